use alloy_primitives::Address;
use payload::{substitute_placeholders, Origin, Payload, Placeholder, PlaceholderError};

/// Concrete addresses of the placeholders of one execution.
///
/// Built once from the deployer nonce observed before the first transaction is sent and
/// never changed afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressMap {
    senders: Vec<Address>,
    contracts: Vec<Address>,
}

impl AddressMap {
    /// Binds `$sender[i]` to `senders[i - 1]` and `$contract[k]` to the address the k-th
    /// deployer create transaction of `payload` will produce.
    ///
    /// Deployer transactions are sent in payload order starting at `deployer_nonce`, so a
    /// create consumes the nonce matching its position among the deployer transactions.
    pub fn new(
        deployer: Address,
        deployer_nonce: u64,
        senders: Vec<Address>,
        payload: &Payload,
    ) -> Self {
        let contracts = payload
            .txs
            .iter()
            .filter(|tx| matches!(tx.origin(), Ok(Origin::Deployer)))
            .zip(deployer_nonce..)
            .filter(|(tx, _)| tx.is_create())
            .map(|(_, nonce)| deployer.create(nonce))
            .collect();
        Self { senders, contracts }
    }

    /// Address of `sender[index]`.
    pub fn sender(&self, index: usize) -> Option<Address> {
        index
            .checked_sub(1)
            .and_then(|i| self.senders.get(i))
            .copied()
    }

    /// Address of `contract[index]`.
    pub fn contract(&self, index: usize) -> Option<Address> {
        index
            .checked_sub(1)
            .and_then(|i| self.contracts.get(i))
            .copied()
    }

    /// Address bound to a placeholder.
    pub fn resolve(&self, placeholder: Placeholder) -> Option<Address> {
        match placeholder {
            Placeholder::Sender(index) => self.sender(index),
            Placeholder::Contract(index) => self.contract(index),
        }
    }

    /// Replaces every token in `text` with its address as lowercase hex without `0x`.
    pub fn substitute(&self, text: &str) -> Result<String, PlaceholderError> {
        substitute_placeholders(text, |placeholder| self.resolve(placeholder))
    }

    /// Sender addresses.
    pub fn senders(&self) -> &[Address] {
        &self.senders
    }

    /// Contract addresses in creation order.
    pub fn contracts(&self) -> &[Address] {
        &self.contracts
    }
}
