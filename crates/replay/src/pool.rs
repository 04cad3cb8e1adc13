use crate::{
    BatchOptions, Client, ClientError, FeeCaps, TxPool, TxPoolError, Wallet, WalletError,
    WalletLockPool,
};
use alloy_consensus::{TxEip1559, TxEnvelope};
use alloy_primitives::{Bytes, TxKind, B256, U256};
use futures::{stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// One ether in wei.
pub const ETHER: u128 = 1_000_000_000_000_000_000;

/// Gas limit of a funding transfer.
pub const FUNDING_GAS_LIMIT: u64 = 21_000;

/// Wallets loaded from the node at once.
const SYNC_CONCURRENCY: usize = 16;

/// Funding transfers in flight at once.
const FUNDING_WINDOW: usize = 50;

/// Errors preparing the wallet pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A child key is not a valid secp256k1 scalar.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// Wallet state could not be loaded.
    #[error("failed to load wallet state: {0}")]
    Client(#[from] ClientError),
    /// The root wallet cannot pay for the refills.
    #[error("root wallet balance {available} cannot cover refills of {needed}")]
    RootUnderfunded {
        /// Total refill amount plus gas.
        needed: U256,
        /// Root balance.
        available: U256,
    },
    /// Funding transfers failed.
    #[error("failed to fund wallets: {0}")]
    Funding(#[source] TxPoolError),
}

/// When and by how much child wallets are topped up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefillOptions {
    /// Children below this balance are refilled.
    pub threshold: U256,
    /// Amount sent to each refilled child.
    pub amount: U256,
}

impl Default for RefillOptions {
    fn default() -> Self {
        Self {
            threshold: U256::from(ETHER),
            amount: U256::from(5 * ETHER),
        }
    }
}

/// Private key of child `index`: `sha256(root ‖ index ‖ seed)` with the index big endian.
pub fn derive_child_key(root: &B256, index: u64, seed: &str) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(root);
    hasher.update(index.to_be_bytes());
    hasher.update(seed.as_bytes());
    B256::from_slice(&hasher.finalize())
}

/// A funded root wallet and the child wallets derived from it.
#[derive(Debug)]
pub struct WalletPool {
    root: Arc<Wallet>,
    children: Vec<Arc<Wallet>>,
}

impl WalletPool {
    /// Derives `count` children of `root`. Different seeds give disjoint wallet sets for
    /// the same root key.
    pub fn new(root: Arc<Wallet>, count: usize, seed: &str) -> Result<Self, WalletError> {
        let root_key = root.private_key();
        let children = (0..count as u64)
            .map(|index| {
                Wallet::from_key(&derive_child_key(&root_key, index, seed), root.chain_id())
                    .map(Arc::new)
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { root, children })
    }

    /// Wallet funding the children.
    pub fn root(&self) -> &Arc<Wallet> {
        &self.root
    }

    /// Child wallets in derivation order.
    pub fn wallets(&self) -> &[Arc<Wallet>] {
        &self.children
    }

    /// Child wallet at `index`.
    pub fn wallet(&self, index: usize) -> Option<&Arc<Wallet>> {
        self.children.get(index)
    }

    /// Number of child wallets.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the pool has no child wallets.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Lock pool over the child wallets.
    pub fn lock_pool(&self) -> WalletLockPool {
        WalletLockPool::new(self.children.clone())
    }

    /// Loads nonce and balance of every wallet and refills children below the threshold
    /// from the root. Returns the number of refilled children.
    pub async fn prepare(
        &self,
        client: &Arc<Client>,
        txpool: &TxPool,
        fees: FeeCaps,
        refill: RefillOptions,
    ) -> Result<usize, PoolError> {
        self.root.sync(client).await?;
        stream::iter(self.children.iter().map(Ok::<_, ClientError>))
            .try_for_each_concurrent(SYNC_CONCURRENCY, |wallet| wallet.sync(client))
            .await?;

        let needy: Vec<_> = self
            .children
            .iter()
            .filter(|wallet| wallet.balance() < refill.threshold)
            .collect();
        if needy.is_empty() {
            debug!(wallets = self.children.len(), "all wallets funded");
            return Ok(0);
        }

        let count = U256::from(needy.len());
        let gas = U256::from(FUNDING_GAS_LIMIT) * U256::from(fees.max_fee_per_gas);
        let needed = count * (refill.amount + gas);
        let available = self.root.balance();
        if available < needed {
            return Err(PoolError::RootUnderfunded { needed, available });
        }

        let txs = needy
            .iter()
            .map(|wallet| self.funding_transaction(wallet, refill.amount, fees))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            root = %self.root.address(),
            wallets = needy.len(),
            amount = %refill.amount,
            "funding wallets"
        );
        let receipts = txpool
            .send_transaction_batch(
                client,
                &self.root,
                txs,
                BatchOptions {
                    pending_limit: FUNDING_WINDOW,
                    ..Default::default()
                },
            )
            .await
            .map_err(PoolError::Funding)?;
        for wallet in &needy {
            wallet.set_state(wallet.nonce(), wallet.balance() + refill.amount);
        }
        Ok(receipts.len())
    }

    fn funding_transaction(
        &self,
        wallet: &Wallet,
        amount: U256,
        fees: FeeCaps,
    ) -> Result<TxEnvelope, WalletError> {
        let tx = TxEip1559 {
            chain_id: self.root.chain_id(),
            nonce: self.root.reserve_nonce(),
            gas_limit: FUNDING_GAS_LIMIT,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            to: TxKind::Call(wallet.address()),
            value: amount,
            access_list: Default::default(),
            input: Bytes::new(),
        };
        Ok(TxEnvelope::Eip1559(self.root.sign_transaction(tx)?))
    }
}
