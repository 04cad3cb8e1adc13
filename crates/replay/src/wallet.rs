use crate::{Client, ClientError};
use alloy_consensus::{SignableTransaction, Signed};
use alloy_eips::eip7702::{Authorization, SignedAuthorization};
use alloy_primitives::{Address, Signature, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use parking_lot::Mutex;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Errors raised by wallets.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Private key is malformed.
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    /// Signing failed.
    #[error(transparent)]
    Signing(#[from] alloy_signer::Error),
}

#[derive(Debug, Default)]
struct WalletState {
    /// Next nonce to hand out.
    nonce: u64,
    /// Tracked balance, decreased by confirmed transaction costs.
    balance: U256,
    needs_resync: bool,
}

/// Signing account with locally tracked nonce and balance.
pub struct Wallet {
    signer: PrivateKeySigner,
    chain_id: u64,
    state: Mutex<WalletState>,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Wallet {
    /// Creates a wallet for `chain_id`.
    pub fn new(signer: PrivateKeySigner, chain_id: u64) -> Self {
        Self {
            signer,
            chain_id,
            state: Mutex::new(WalletState::default()),
        }
    }

    /// Creates a wallet from raw key bytes.
    pub fn from_key(key: &B256, chain_id: u64) -> Result<Self, WalletError> {
        let signer =
            PrivateKeySigner::from_bytes(key).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        Ok(Self::new(signer, chain_id))
    }

    /// Creates a wallet from a hex private key, with or without `0x`.
    pub fn from_hex(key: &str, chain_id: u64) -> Result<Self, WalletError> {
        let signer: PrivateKeySigner = key
            .trim()
            .parse()
            .map_err(|e: alloy_signer_local::LocalSignerError| WalletError::InvalidKey(e.to_string()))?;
        Ok(Self::new(signer, chain_id))
    }

    /// Account address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Chain id transactions are signed for.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Raw private key.
    pub fn private_key(&self) -> B256 {
        self.signer.to_bytes()
    }

    /// Nonce the next transaction will use.
    pub fn nonce(&self) -> u64 {
        self.state.lock().nonce
    }

    /// Hands out the next nonce.
    pub fn reserve_nonce(&self) -> u64 {
        let mut state = self.state.lock();
        let nonce = state.nonce;
        state.nonce += 1;
        nonce
    }

    /// Tracked balance.
    pub fn balance(&self) -> U256 {
        self.state.lock().balance
    }

    /// Overwrites the tracked nonce and balance.
    pub fn set_state(&self, nonce: u64, balance: U256) {
        let mut state = self.state.lock();
        state.nonce = nonce;
        state.balance = balance;
        state.needs_resync = false;
    }

    /// Subtracts the cost of a confirmed transaction from the tracked balance.
    pub fn apply_cost(&self, cost: U256) {
        let mut state = self.state.lock();
        state.balance = state.balance.saturating_sub(cost);
    }

    /// Flags the nonce as out of sync with the node.
    pub fn mark_needs_resync(&self) {
        self.state.lock().needs_resync = true;
    }

    /// Whether a resync is pending.
    pub fn needs_resync(&self) -> bool {
        self.state.lock().needs_resync
    }

    /// Loads nonce and balance from the node.
    pub async fn sync(&self, client: &Client) -> Result<(), ClientError> {
        let address = self.address();
        let (nonce, balance) = futures::try_join!(
            client.chain().nonce(address),
            client.chain().balance(address)
        )?;
        self.set_state(nonce, balance);
        Ok(())
    }

    /// Reloads the nonce from the node when a previous failure flagged it. Returns whether
    /// a resync happened.
    pub async fn reset_nonce_if_needed(&self, client: &Client) -> Result<bool, ClientError> {
        if !self.needs_resync() {
            return Ok(false);
        }
        let nonce = client.chain().nonce(self.address()).await?;
        let mut state = self.state.lock();
        debug!(wallet = %self.signer.address(), old = state.nonce, new = nonce, "resynced nonce");
        state.nonce = nonce;
        state.needs_resync = false;
        Ok(true)
    }

    /// Signs a transaction.
    pub fn sign_transaction<T>(&self, tx: T) -> Result<Signed<T>, WalletError>
    where
        T: SignableTransaction<Signature>,
    {
        let signature = self.signer.sign_hash_sync(&tx.signature_hash())?;
        Ok(tx.into_signed(signature))
    }

    /// Signs an EIP-7702 authorization.
    pub fn sign_authorization(
        &self,
        authorization: Authorization,
    ) -> Result<SignedAuthorization, WalletError> {
        let signature = self.signer.sign_hash_sync(&authorization.signature_hash())?;
        Ok(authorization.into_signed(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_consensus::{transaction::SignerRecoverable, TxEip1559, TxEnvelope};
    use alloy_primitives::{address, b256, TxKind};

    const KEY: B256 =
        b256!("0x45a915e4d060149eb4365960e6a7a45f334393093061116b197e3240065ff2d8");

    #[test]
    fn address_from_key() {
        let wallet = Wallet::from_key(&KEY, 1).unwrap();
        assert_eq!(
            wallet.address(),
            address!("0xa94f5374fce5edbc8e2a8697c15331677e6ebf0b")
        );
        assert_eq!(wallet.private_key(), KEY);

        let hex = Wallet::from_hex(&KEY.to_string(), 1).unwrap();
        assert_eq!(hex.address(), wallet.address());
        assert!(Wallet::from_hex("0x1234", 1).is_err());
    }

    #[test]
    fn nonce_reservation() {
        let wallet = Wallet::from_key(&KEY, 1).unwrap();
        wallet.set_state(7, U256::from(100));
        assert_eq!(wallet.reserve_nonce(), 7);
        assert_eq!(wallet.reserve_nonce(), 8);
        assert_eq!(wallet.nonce(), 9);

        wallet.apply_cost(U256::from(40));
        assert_eq!(wallet.balance(), U256::from(60));
        wallet.apply_cost(U256::from(400));
        assert_eq!(wallet.balance(), U256::ZERO);
    }

    #[test]
    fn signed_transaction_recovers_sender() {
        let wallet = Wallet::from_key(&KEY, 1).unwrap();
        let tx = TxEip1559 {
            chain_id: 1,
            nonce: 0,
            gas_limit: 21_000,
            max_fee_per_gas: 10,
            max_priority_fee_per_gas: 1,
            to: TxKind::Call(Address::ZERO),
            ..Default::default()
        };
        let envelope = TxEnvelope::Eip1559(wallet.sign_transaction(tx).unwrap());
        assert_eq!(envelope.recover_signer().unwrap(), wallet.address());
    }

    #[test]
    fn signed_authorization_recovers_authority() {
        let wallet = Wallet::from_key(&KEY, 1).unwrap();
        let signed = wallet
            .sign_authorization(Authorization {
                chain_id: U256::from(1),
                address: Address::ZERO,
                nonce: 3,
            })
            .unwrap();
        assert_eq!(signed.recover_authority().unwrap(), wallet.address());
    }
}
