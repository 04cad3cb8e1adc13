use crate::{Client, ClientError, TxReceipt, Wallet};
use alloy_consensus::{Transaction, TxEnvelope};
use alloy_primitives::{B256, U256};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

/// One gwei in wei.
pub const GWEI: u128 = 1_000_000_000;

/// Fee caps applied to every transaction of an execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeCaps {
    /// Fee cap, also the gas price of legacy priced transactions.
    pub max_fee_per_gas: u128,
    /// Tip cap.
    pub max_priority_fee_per_gas: u128,
}

impl FeeCaps {
    /// Both caps doubled, enough to replace a pending transaction.
    pub fn doubled(&self) -> Self {
        Self {
            max_fee_per_gas: self.max_fee_per_gas.saturating_mul(2),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.saturating_mul(2),
        }
    }
}

/// Errors of the transaction layer.
#[derive(Debug, Error)]
pub enum TxPoolError {
    /// Node rejected the transaction.
    #[error("failed to submit transaction {hash}: {source}")]
    Submit {
        /// Transaction hash.
        hash: B256,
        /// Client error.
        #[source]
        source: ClientError,
    },
    /// Receipt tracking ended without a receipt.
    #[error("transaction {0} was dropped before confirmation")]
    Dropped(B256),
    /// Fee suggestion failed.
    #[error("failed to get suggested fees: {0}")]
    Fees(#[source] ClientError),
    /// Batch did not confirm in time.
    #[error("batch did not confirm within {}", humantime::format_duration(*.0))]
    BatchTimeout(Duration),
}

/// Timing of receipt tracking.
#[derive(Clone, Copy, Debug)]
pub struct TxPoolOptions {
    /// Receipt polling interval.
    pub poll_interval: Duration,
    /// Interval between rebroadcasts of an unconfirmed transaction.
    pub rebroadcast_interval: Duration,
}

impl Default for TxPoolOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            rebroadcast_interval: Duration::from_secs(30),
        }
    }
}

/// Per transaction submit options.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendOptions {
    /// Rebroadcast while unconfirmed.
    pub rebroadcast: bool,
}

/// Options of [`TxPool::send_transaction_batch`].
#[derive(Clone, Copy, Debug)]
pub struct BatchOptions {
    /// Submit attempts per transaction after the first.
    pub max_retries: usize,
    /// Delay between submit attempts.
    pub retry_delay: Duration,
    /// Transactions in flight at once, zero for no limit.
    pub pending_limit: usize,
    /// Rebroadcast while unconfirmed.
    pub rebroadcast: bool,
    /// Upper bound for the whole batch.
    pub timeout: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            pending_limit: 0,
            rebroadcast: true,
            timeout: None,
        }
    }
}

/// Submitted transaction awaiting its receipt.
#[derive(Debug)]
pub struct PendingTx {
    hash: B256,
    nonce: u64,
    receipt: oneshot::Receiver<TxReceipt>,
}

impl PendingTx {
    /// Transaction hash.
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// Transaction nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Waits for the receipt. Dropping the future stops the tracking task.
    pub async fn wait(self) -> Result<TxReceipt, TxPoolError> {
        self.receipt.await.map_err(|_| TxPoolError::Dropped(self.hash))
    }
}

/// Submits transactions and tracks them until they are included.
#[derive(Debug, Default)]
pub struct TxPool {
    options: TxPoolOptions,
}

impl TxPool {
    /// Creates a pool with the given tracking timing.
    pub fn new(options: TxPoolOptions) -> Self {
        Self { options }
    }

    /// Submits `tx` and starts tracking it. Confirmation reduces the tracked balance of
    /// `wallet` by the transaction cost.
    pub async fn send_transaction(
        &self,
        client: &Arc<Client>,
        wallet: &Arc<Wallet>,
        tx: TxEnvelope,
        options: SendOptions,
    ) -> Result<PendingTx, TxPoolError> {
        let hash = *tx.tx_hash();
        let nonce = tx.nonce();
        client
            .chain()
            .send_transaction(&tx)
            .await
            .map_err(|source| TxPoolError::Submit { hash, source })?;

        let (sender, receipt) = oneshot::channel();
        tokio::spawn(track_receipt(
            Arc::clone(client),
            Arc::clone(wallet),
            tx,
            sender,
            self.options,
            options.rebroadcast,
        ));
        Ok(PendingTx {
            hash,
            nonce,
            receipt,
        })
    }

    /// Submits `tx` and waits for its receipt.
    pub async fn send_and_await_transaction(
        &self,
        client: &Arc<Client>,
        wallet: &Arc<Wallet>,
        tx: TxEnvelope,
        options: SendOptions,
    ) -> Result<TxReceipt, TxPoolError> {
        self.send_transaction(client, wallet, tx, options)
            .await?
            .wait()
            .await
    }

    /// Submits nonce-ordered transactions of one wallet and waits for all receipts.
    ///
    /// A rejected submission is retried up to `max_retries` times before the batch fails.
    /// With a `pending_limit` the batch is sent in windows of that size.
    pub async fn send_transaction_batch(
        &self,
        client: &Arc<Client>,
        wallet: &Arc<Wallet>,
        txs: Vec<TxEnvelope>,
        options: BatchOptions,
    ) -> Result<Vec<TxReceipt>, TxPoolError> {
        let batch = async {
            let window = if options.pending_limit == 0 {
                txs.len().max(1)
            } else {
                options.pending_limit
            };
            let mut receipts = Vec::with_capacity(txs.len());
            let mut txs = txs.into_iter().peekable();
            while txs.peek().is_some() {
                let mut pending = Vec::with_capacity(window);
                for tx in txs.by_ref().take(window) {
                    pending.push(self.submit_with_retry(client, wallet, tx, &options).await?);
                }
                for result in join_all(pending.into_iter().map(PendingTx::wait)).await {
                    receipts.push(result?);
                }
            }
            Ok::<_, TxPoolError>(receipts)
        };
        match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, batch)
                .await
                .map_err(|_| TxPoolError::BatchTimeout(timeout))?,
            None => batch.await,
        }
    }

    async fn submit_with_retry(
        &self,
        client: &Arc<Client>,
        wallet: &Arc<Wallet>,
        tx: TxEnvelope,
        options: &BatchOptions,
    ) -> Result<PendingTx, TxPoolError> {
        let send = SendOptions {
            rebroadcast: options.rebroadcast,
        };
        let mut attempt = 0;
        loop {
            match self.send_transaction(client, wallet, tx.clone(), send).await {
                Ok(pending) => return Ok(pending),
                Err(error) if attempt < options.max_retries => {
                    attempt += 1;
                    debug!(%error, attempt, "retrying transaction submission");
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Fee caps for new transactions. Overrides are in wei, zero falls back to the node
    /// suggestion. The fee cap never drops below the tip cap.
    pub async fn suggested_fees(
        &self,
        client: &Client,
        base_fee: u128,
        tip_fee: u128,
    ) -> Result<FeeCaps, TxPoolError> {
        let (mut fee_cap, mut tip_cap) = (base_fee, tip_fee);
        if fee_cap == 0 || tip_cap == 0 {
            let suggested = client.suggested_fee().await.map_err(TxPoolError::Fees)?;
            if fee_cap == 0 {
                fee_cap = suggested.gas_price;
            }
            if tip_cap == 0 {
                tip_cap = suggested.tip;
            }
        }
        Ok(FeeCaps {
            max_fee_per_gas: fee_cap.max(tip_cap),
            max_priority_fee_per_gas: tip_cap,
        })
    }
}

async fn track_receipt(
    client: Arc<Client>,
    wallet: Arc<Wallet>,
    tx: TxEnvelope,
    mut sender: oneshot::Sender<TxReceipt>,
    options: TxPoolOptions,
    rebroadcast: bool,
) {
    let hash = *tx.tx_hash();
    let mut poll = tokio::time::interval(options.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_broadcast = Instant::now();
    loop {
        tokio::select! {
            _ = sender.closed() => {
                debug!(%hash, "receipt no longer awaited");
                return;
            }
            _ = poll.tick() => {}
        }
        match client.chain().receipt(hash).await {
            Ok(Some(receipt)) => {
                let cost = U256::from(receipt.gas_used) * U256::from(receipt.effective_gas_price)
                    + tx.value();
                wallet.apply_cost(cost);
                let _ = sender.send(receipt);
                return;
            }
            Ok(None) => {}
            Err(error) => debug!(%hash, %error, "receipt lookup failed"),
        }
        if rebroadcast && last_broadcast.elapsed() >= options.rebroadcast_interval {
            last_broadcast = Instant::now();
            if let Err(error) = client.chain().send_transaction(&tx).await {
                warn!(%hash, %error, "rebroadcast failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_client, test_wallets, transfer, MockChain};

    fn pool() -> TxPool {
        TxPool::new(TxPoolOptions {
            poll_interval: Duration::from_millis(10),
            rebroadcast_interval: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn send_and_await() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);
        chain.fund(wallet.address(), U256::from(10u64.pow(18)));
        wallet.sync(&client).await.unwrap();

        let tx = transfer(&wallet, 10, 7);
        let receipt = pool()
            .send_and_await_transaction(&client, &wallet, tx, SendOptions::default())
            .await
            .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(
            wallet.balance(),
            U256::from(10u64.pow(18) - 21_000 * 10 - 7)
        );
        assert_eq!(chain.balance_of(wallet.address()), wallet.balance());
    }

    #[tokio::test]
    async fn rejected_submission() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);

        let err = pool()
            .send_transaction(&client, &wallet, transfer(&wallet, 10, 1), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TxPoolError::Submit { .. }));
    }

    #[tokio::test]
    async fn dropping_pending_stops_tracking() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);
        chain.fund(wallet.address(), U256::from(10u64.pow(18)));
        chain.stick(wallet.address(), 0);

        let pending = pool()
            .send_transaction(&client, &wallet, transfer(&wallet, 10, 0), SendOptions::default())
            .await
            .unwrap();
        let polls = chain.receipt_queries();
        drop(pending);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let after_drop = chain.receipt_queries();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(after_drop <= polls + 2);
        assert_eq!(chain.receipt_queries(), after_drop);
    }

    #[tokio::test]
    async fn batch_in_windows() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);
        chain.fund(wallet.address(), U256::from(10u64.pow(18)));

        let txs = (0..5).map(|_| transfer(&wallet, 10, 1)).collect();
        let receipts = pool()
            .send_transaction_batch(
                &client,
                &wallet,
                txs,
                BatchOptions {
                    pending_limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(receipts.len(), 5);
        assert_eq!(chain.nonce_of(wallet.address()), 5);
    }

    #[tokio::test]
    async fn fee_overrides() {
        let chain = Arc::new(MockChain::new(1));
        chain.set_gas_price(40);
        chain.set_priority_fee(4);
        let client = test_client(&chain);
        let pool = pool();

        let fees = pool.suggested_fees(&client, 0, 0).await.unwrap();
        assert_eq!(
            fees,
            FeeCaps {
                max_fee_per_gas: 40,
                max_priority_fee_per_gas: 4
            }
        );

        let fees = pool.suggested_fees(&client, 20 * GWEI, 0).await.unwrap();
        assert_eq!(fees.max_fee_per_gas, 20 * GWEI);
        assert_eq!(fees.max_priority_fee_per_gas, 4);

        let fees = pool.suggested_fees(&client, 1, 2 * GWEI).await.unwrap();
        assert_eq!(fees.max_fee_per_gas, 2 * GWEI);
        assert_eq!(fees.doubled().max_priority_fee_per_gas, 4 * GWEI);
    }
}
