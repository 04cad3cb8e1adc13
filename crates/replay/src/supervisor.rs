use crate::{BatchOptions, Client, FeeCaps, PendingTx, TxPool, TxPoolError, TxReceipt, Wallet, WalletError};
use alloy_consensus::{TxEip1559, TxEnvelope};
use alloy_primitives::{Bytes, TxKind, U256};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Phase timeout used when none is configured.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Gas limit of a replacement transaction.
pub const REPLACEMENT_GAS_LIMIT: u64 = 25_000;

/// Submit retries per replacement transaction.
pub const REPLACEMENT_MAX_RETRIES: usize = 3;

/// How the wait for a phase ended.
#[derive(Debug)]
pub enum PhaseWait {
    /// Every transaction resolved, results in submission order.
    Completed(Vec<Result<TxReceipt, TxPoolError>>),
    /// The deadline passed first.
    TimedOut {
        /// Nonces of the transactions still unresolved.
        outstanding: Vec<u64>,
    },
    /// The run was cancelled.
    Cancelled,
}

/// Errors sending replacement transactions.
#[derive(Debug, Error)]
pub enum ReplacementError {
    /// Replacement could not be signed.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// Replacement batch failed.
    #[error(transparent)]
    TxPool(#[from] TxPoolError),
}

/// Bounds the wait of each phase and unblocks wallets whose transactions got stuck.
#[derive(Clone, Copy, Debug)]
pub struct Supervisor {
    phase_timeout: Duration,
    rebroadcast: bool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(None, true)
    }
}

impl Supervisor {
    /// Creates a supervisor. Without a timeout phases wait [`DEFAULT_PHASE_TIMEOUT`].
    pub fn new(phase_timeout: Option<Duration>, rebroadcast: bool) -> Self {
        Self {
            phase_timeout: phase_timeout.unwrap_or(DEFAULT_PHASE_TIMEOUT),
            rebroadcast,
        }
    }

    /// Time a phase may wait for its transactions.
    pub fn phase_timeout(&self) -> Duration {
        self.phase_timeout
    }

    /// Deadline of a phase starting now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.phase_timeout
    }

    /// Waits until every transaction resolved, the deadline passed or `cancel` fired,
    /// whichever happens first.
    ///
    /// Returning drops the pending futures, which stops their receipt tracking.
    pub async fn await_phase(
        &self,
        pending: Vec<PendingTx>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> PhaseWait {
        let nonces: Vec<u64> = pending.iter().map(PendingTx::nonce).collect();
        let mut results: Vec<Option<Result<TxReceipt, TxPoolError>>> =
            nonces.iter().map(|_| None).collect();
        let mut waiting: FuturesUnordered<_> = pending
            .into_iter()
            .enumerate()
            .map(|(index, tx)| async move { (index, tx.wait().await) })
            .collect();
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PhaseWait::Cancelled,
                next = waiting.next() => match next {
                    Some((index, result)) => results[index] = Some(result),
                    None => break,
                },
                _ = &mut expiry => {
                    let outstanding = results
                        .iter()
                        .zip(&nonces)
                        .filter(|(result, _)| result.is_none())
                        .map(|(_, nonce)| *nonce)
                        .collect();
                    return PhaseWait::TimedOut { outstanding };
                }
            }
        }
        PhaseWait::Completed(results.into_iter().flatten().collect())
    }

    /// Replaces the transactions at `nonces` with zero value self transfers priced at
    /// twice `fees`, and waits for them. Returns the number of confirmed replacements.
    pub async fn replace_outstanding(
        &self,
        txpool: &TxPool,
        client: &Arc<Client>,
        wallet: &Arc<Wallet>,
        nonces: &[u64],
        fees: FeeCaps,
    ) -> Result<usize, ReplacementError> {
        let txs = nonces
            .iter()
            .map(|nonce| replacement_transaction(wallet, *nonce, fees))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(wallet = %wallet.address(), ?nonces, "replacing stuck transactions");
        let receipts = txpool
            .send_transaction_batch(
                client,
                wallet,
                txs,
                BatchOptions {
                    max_retries: REPLACEMENT_MAX_RETRIES,
                    rebroadcast: self.rebroadcast,
                    timeout: Some(self.phase_timeout),
                    ..Default::default()
                },
            )
            .await
            .inspect_err(|error| warn!(wallet = %wallet.address(), %error, "replacement failed"))?;
        Ok(receipts.len())
    }
}

/// Zero value transfer to `wallet` itself at `nonce`, with both fee caps doubled.
pub fn replacement_transaction(
    wallet: &Wallet,
    nonce: u64,
    fees: FeeCaps,
) -> Result<TxEnvelope, WalletError> {
    let fees = fees.doubled();
    let tx = TxEip1559 {
        chain_id: wallet.chain_id(),
        nonce,
        gas_limit: REPLACEMENT_GAS_LIMIT,
        max_fee_per_gas: fees.max_fee_per_gas,
        max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        to: TxKind::Call(wallet.address()),
        value: U256::ZERO,
        access_list: Default::default(),
        input: Bytes::new(),
    };
    Ok(TxEnvelope::Eip1559(wallet.sign_transaction(tx)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{test_client, test_wallets, transfer, MockChain},
        SendOptions, TxPoolOptions,
    };
    use alloy_consensus::Transaction;

    const FEES: FeeCaps = FeeCaps {
        max_fee_per_gas: 10,
        max_priority_fee_per_gas: 1,
    };

    fn txpool() -> TxPool {
        TxPool::new(TxPoolOptions {
            poll_interval: Duration::from_millis(5),
            rebroadcast_interval: Duration::from_secs(60),
        })
    }

    #[test]
    fn replacement_shape() {
        let wallet = test_wallets(1, 7).remove(0);
        let tx = replacement_transaction(&wallet, 3, FEES).unwrap();
        assert_eq!(tx.nonce(), 3);
        assert_eq!(tx.gas_limit(), REPLACEMENT_GAS_LIMIT);
        assert_eq!(tx.max_fee_per_gas(), 20);
        assert_eq!(tx.max_priority_fee_per_gas(), Some(2));
        assert_eq!(tx.to(), Some(wallet.address()));
        assert_eq!(tx.value(), U256::ZERO);
        assert!(tx.input().is_empty());
        assert_eq!(tx.chain_id(), Some(7));
    }

    #[tokio::test]
    async fn completes_in_submission_order() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);
        chain.fund(wallet.address(), U256::from(10u64.pow(18)));
        let pool = txpool();

        let mut pending = Vec::new();
        for value in [1, 2, 3] {
            let tx = transfer(&wallet, 10, value);
            pending.push(
                pool.send_transaction(&client, &wallet, tx, SendOptions::default())
                    .await
                    .unwrap(),
            );
        }
        let hashes: Vec<_> = pending.iter().map(PendingTx::hash).collect();

        let supervisor = Supervisor::new(Some(Duration::from_secs(5)), false);
        let PhaseWait::Completed(results) = supervisor
            .await_phase(pending, supervisor.deadline(), &CancellationToken::new())
            .await
        else {
            panic!("phase did not complete");
        };
        let receipts: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            receipts.iter().map(|r| r.tx_hash).collect::<Vec<_>>(),
            hashes
        );
    }

    #[tokio::test]
    async fn timeout_reports_outstanding_and_replaces_them() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);
        chain.fund(wallet.address(), U256::from(10u64.pow(18)));
        chain.stick(wallet.address(), 1);
        let pool = txpool();

        let mut pending = Vec::new();
        for _ in 0..2 {
            let tx = transfer(&wallet, 10, 1);
            pending.push(
                pool.send_transaction(&client, &wallet, tx, SendOptions::default())
                    .await
                    .unwrap(),
            );
        }

        let supervisor = Supervisor::new(Some(Duration::from_millis(100)), false);
        let wait = supervisor
            .await_phase(pending, supervisor.deadline(), &CancellationToken::new())
            .await;
        let PhaseWait::TimedOut { outstanding } = wait else {
            panic!("expected timeout, got {wait:?}");
        };
        assert_eq!(outstanding, vec![1]);

        let replaced = supervisor
            .replace_outstanding(&pool, &client, &wallet, &outstanding, FEES)
            .await
            .unwrap();
        assert_eq!(replaced, 1);

        let sent = chain.sent_transactions();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent.iter().filter(|tx| (**tx).nonce() == 0).count(), 1);
        let replacement = sent.last().unwrap();
        assert_eq!(replacement.nonce(), 1);
        assert_eq!(replacement.to(), Some(wallet.address()));
        assert_eq!(chain.nonce_of(wallet.address()), 2);
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallet = test_wallets(1, 1).remove(0);
        chain.fund(wallet.address(), U256::from(10u64.pow(18)));
        chain.stick(wallet.address(), 0);

        let pending = txpool()
            .send_transaction(&client, &wallet, transfer(&wallet, 10, 1), SendOptions::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let supervisor = Supervisor::default();
        assert!(matches!(
            supervisor
                .await_phase(vec![pending], supervisor.deadline(), &cancel)
                .await,
            PhaseWait::Cancelled
        ));
    }

    #[tokio::test]
    async fn empty_phase_completes() {
        let supervisor = Supervisor::default();
        let wait = supervisor
            .await_phase(Vec::new(), supervisor.deadline(), &CancellationToken::new())
            .await;
        assert!(matches!(wait, PhaseWait::Completed(results) if results.is_empty()));
    }
}
