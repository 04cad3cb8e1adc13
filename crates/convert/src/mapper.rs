use alloy_primitives::{hex, Address};
use payload::Placeholder;
use regex::{NoExpand, Regex, RegexBuilder};
use std::collections::HashMap;

/// Assigns placeholders to the addresses of a fixture and rewrites them in hex text.
///
/// Indices are 1-based and handed out in registration order, separately for contracts
/// and senders.
#[derive(Debug, Default)]
pub struct AddressMapper {
    placeholders: HashMap<Address, Placeholder>,
    contracts: usize,
    senders: usize,
    /// Case-insensitive matcher per registered address, in registration order.
    rewrites: Vec<(Regex, String)>,
}

impl AddressMapper {
    /// Creates an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a contract, returning its index. Re-registering returns the existing
    /// index.
    pub fn register_contract(&mut self, address: Address) -> usize {
        self.register(address, |mapper| {
            mapper.contracts += 1;
            Placeholder::Contract(mapper.contracts)
        })
    }

    /// Registers a sender, returning its index.
    pub fn register_sender(&mut self, address: Address) -> usize {
        self.register(address, |mapper| {
            mapper.senders += 1;
            Placeholder::Sender(mapper.senders)
        })
    }

    fn register(&mut self, address: Address, next: impl FnOnce(&mut Self) -> Placeholder) -> usize {
        if let Some(placeholder) = self.placeholders.get(&address) {
            return placeholder.index();
        }
        let placeholder = next(self);
        self.placeholders.insert(address, placeholder);
        if let Ok(regex) = RegexBuilder::new(&regex::escape(&hex::encode(address)))
            .case_insensitive(true)
            .build()
        {
            self.rewrites.push((regex, placeholder.token()));
        }
        placeholder.index()
    }

    /// Placeholder assigned to `address`.
    pub fn placeholder(&self, address: &Address) -> Option<Placeholder> {
        self.placeholders.get(address).copied()
    }

    /// Sender index of `address`.
    pub fn sender_index(&self, address: &Address) -> Option<usize> {
        match self.placeholder(address)? {
            Placeholder::Sender(index) => Some(index),
            Placeholder::Contract(_) => None,
        }
    }

    /// Whether `address` is a registered contract.
    pub fn is_contract(&self, address: &Address) -> bool {
        matches!(self.placeholder(address), Some(Placeholder::Contract(_)))
    }

    /// Key used inside transaction fields: `$contract[N]`, `$sender[N]` or the address.
    pub fn bytecode_key(&self, address: &Address) -> String {
        self.placeholder(address)
            .map(|placeholder| placeholder.token())
            .unwrap_or_else(|| hex::encode_prefixed(address))
    }

    /// Key used for YAML maps and `from`: `contract[N]`, `sender[N]` or the address.
    pub fn yaml_key(&self, address: &Address) -> String {
        self.placeholder(address)
            .map(|placeholder| placeholder.to_string())
            .unwrap_or_else(|| hex::encode_prefixed(address))
    }

    /// Rewrites every registered address found in `text` into its placeholder token.
    pub fn replace_addresses(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (regex, token) in &self.rewrites {
            if regex.is_match(&out) {
                out = regex.replace_all(&out, NoExpand(token)).into_owned();
            }
        }
        out
    }
}
