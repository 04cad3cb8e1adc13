//! Deterministic in-memory chain for tests.
//!
//! Every accepted transaction is mined immediately. Calls use 21000 gas and creates
//! 53000, priced at the transaction fee cap. Call data is read as consecutive 64 byte
//! `(slot, value)` pairs written to the callee's storage, and the single byte `0xfe`
//! reverts. Transactions at a nonce marked with [`MockChain::stick`] stay pending until
//! a transaction with the same sender and nonce replaces them.

use crate::{ChainClient, Client, ClientError, TxReceipt, Wallet, DEFAULT_GROUP};
use alloy_consensus::{transaction::SignerRecoverable, Transaction, TxEip1559, TxEnvelope};
use alloy_primitives::{Address, TxKind, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

pub(crate) const CALL_GAS: u64 = 21_000;
pub(crate) const CREATE_GAS: u64 = 53_000;

#[derive(Debug, Default)]
struct State {
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    storage: HashMap<(Address, U256), B256>,
    receipts: HashMap<B256, TxReceipt>,
    stuck: HashSet<(Address, u64)>,
    held: HashSet<(Address, u64)>,
    sent: Vec<TxEnvelope>,
    gas_price: u128,
    priority_fee: u128,
    receipt_queries: usize,
    block: u64,
}

#[derive(Debug)]
pub(crate) struct MockChain {
    chain_id: u64,
    state: Mutex<State>,
}

impl MockChain {
    pub(crate) fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(State {
                gas_price: 10,
                priority_fee: 1,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn set_gas_price(&self, price: u128) {
        self.state.lock().gas_price = price;
    }

    pub(crate) fn set_priority_fee(&self, fee: u128) {
        self.state.lock().priority_fee = fee;
    }

    pub(crate) fn fund(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    pub(crate) fn set_storage(&self, address: Address, slot: U256, value: B256) {
        self.state.lock().storage.insert((address, slot), value);
    }

    pub(crate) fn storage_of(&self, address: Address, slot: U256) -> B256 {
        self.state
            .lock()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn balance_of(&self, address: Address) -> U256 {
        self.state
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn nonce_of(&self, address: Address) -> u64 {
        self.state
            .lock()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Keeps the transaction of `address` at `nonce` pending until it is replaced.
    pub(crate) fn stick(&self, address: Address, nonce: u64) {
        self.state.lock().stuck.insert((address, nonce));
    }

    pub(crate) fn sent_transactions(&self) -> Vec<TxEnvelope> {
        self.state.lock().sent.clone()
    }

    pub(crate) fn receipt_queries(&self) -> usize {
        self.state.lock().receipt_queries
    }
}

impl State {
    fn execute(&mut self, sender: Address, tx: &TxEnvelope) -> TxReceipt {
        let (target, gas) = match tx.kind() {
            TxKind::Create => (sender.create(tx.nonce()), CREATE_GAS),
            TxKind::Call(to) => (to, CALL_GAS),
        };
        let success = tx.gas_limit() >= gas && tx.input().as_ref() != [0xfe_u8].as_slice();
        let gas_used = gas.min(tx.gas_limit());
        let price = tx.max_fee_per_gas();
        let mut cost = U256::from(gas_used) * U256::from(price);
        if success {
            cost += tx.value();
            *self.balances.entry(target).or_default() += tx.value();
            if tx.kind().is_call() {
                for pair in tx.input().chunks_exact(64) {
                    let slot = U256::from_be_slice(&pair[..32]);
                    self.storage
                        .insert((target, slot), B256::from_slice(&pair[32..]));
                }
            }
        }
        let balance = self.balances.entry(sender).or_default();
        *balance = balance.saturating_sub(cost);
        let nonce = self.nonces.entry(sender).or_default();
        *nonce = (*nonce).max(tx.nonce() + 1);
        self.block += 1;

        let receipt = TxReceipt {
            tx_hash: *tx.tx_hash(),
            success,
            gas_used,
            effective_gas_price: price,
            block_number: Some(self.block),
        };
        self.receipts.insert(receipt.tx_hash, receipt);
        receipt
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id)
    }

    async fn nonce(&self, address: Address) -> Result<u64, ClientError> {
        let state = self.state.lock();
        let held = state.held.iter().filter(|(a, _)| *a == address).count() as u64;
        Ok(state.nonces.get(&address).copied().unwrap_or_default() + held)
    }

    async fn balance(&self, address: Address) -> Result<U256, ClientError> {
        Ok(self.balance_of(address))
    }

    async fn storage_at(&self, address: Address, slot: U256) -> Result<B256, ClientError> {
        Ok(self.storage_of(address, slot))
    }

    async fn gas_price(&self) -> Result<u128, ClientError> {
        Ok(self.state.lock().gas_price)
    }

    async fn max_priority_fee(&self) -> Result<u128, ClientError> {
        Ok(self.state.lock().priority_fee)
    }

    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<B256, ClientError> {
        let sender = tx
            .recover_signer()
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        if tx.chain_id().is_some_and(|id| id != self.chain_id) {
            return Err(ClientError::Rejected("invalid chain id".into()));
        }
        let mut state = self.state.lock();
        let key = (sender, tx.nonce());
        let replacing = state.held.contains(&key);
        if !replacing && tx.nonce() < state.nonces.get(&sender).copied().unwrap_or_default() {
            return Err(ClientError::Rejected("nonce too low".into()));
        }
        let max_cost = U256::from(tx.gas_limit()) * U256::from(tx.max_fee_per_gas()) + tx.value();
        if state.balances.get(&sender).copied().unwrap_or_default() < max_cost {
            return Err(ClientError::Rejected(
                "insufficient funds for gas * price + value".into(),
            ));
        }
        state.sent.push(tx.clone());

        if replacing {
            state.held.remove(&key);
            state.stuck.remove(&key);
        } else if state.stuck.contains(&key) {
            state.held.insert(key);
            return Ok(*tx.tx_hash());
        }
        Ok(state.execute(sender, tx).tx_hash)
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ClientError> {
        let mut state = self.state.lock();
        state.receipt_queries += 1;
        Ok(state.receipts.get(&hash).copied())
    }
}

/// Wallets with the private keys 1..=count.
pub(crate) fn test_wallets(count: usize, chain_id: u64) -> Vec<Arc<Wallet>> {
    (1..=count as u64)
        .map(|key| {
            let key = B256::left_padding_from(&key.to_be_bytes());
            Arc::new(Wallet::from_key(&key, chain_id).expect("valid key"))
        })
        .collect()
}

pub(crate) fn test_client(chain: &Arc<MockChain>) -> Arc<Client> {
    Arc::new(Client::new(
        "mock",
        vec![DEFAULT_GROUP.to_string()],
        Arc::clone(chain) as Arc<dyn ChainClient>,
    ))
}

/// Signed transfer of `value` wei to a fixed address, reserving the wallet's next nonce.
pub(crate) fn transfer(wallet: &Wallet, fee_cap: u128, value: u64) -> TxEnvelope {
    let tx = TxEip1559 {
        chain_id: wallet.chain_id(),
        nonce: wallet.reserve_nonce(),
        gas_limit: CALL_GAS,
        max_fee_per_gas: fee_cap,
        max_priority_fee_per_gas: 1,
        to: TxKind::Call(Address::repeat_byte(0x42)),
        value: U256::from(value),
        ..Default::default()
    };
    TxEnvelope::Eip1559(wallet.sign_transaction(tx).expect("signing"))
}
