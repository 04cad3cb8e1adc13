use crate::{
    AcquireError, DriverOptions, DriverSummary, ExecutionResult, Outcome, PayloadExecutor, ReplayStats,
    StatsSnapshot, ThroughputDriver, WalletLockPool, WorkParams,
};
use payload::Payload;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Interval between progress lines.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Errors setting up a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Nothing to replay.
    #[error("no payloads to replay")]
    NoPayloads,
}

/// Replays payloads, one execution per unit of work of the throughput driver.
#[derive(Debug)]
pub struct ReplayRunner {
    payloads: Vec<Payload>,
    locks: WalletLockPool,
    executor: PayloadExecutor,
    stats: Arc<ReplayStats>,
    start_offset: u64,
}

impl ReplayRunner {
    /// Creates a runner. Unit `n` replays payload `(n + start_offset) % payloads.len()`.
    pub fn new(
        payloads: Vec<Payload>,
        locks: WalletLockPool,
        executor: PayloadExecutor,
        start_offset: u64,
    ) -> Result<Self, RunError> {
        if payloads.is_empty() {
            return Err(RunError::NoPayloads);
        }
        Ok(Self {
            payloads,
            locks,
            executor,
            stats: Arc::new(ReplayStats::new()),
            start_offset,
        })
    }

    /// Outcome counters.
    pub fn stats(&self) -> &Arc<ReplayStats> {
        &self.stats
    }

    /// Payloads in replay order.
    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// Payload position replayed by unit `index`.
    pub fn payload_index(&self, index: u64) -> usize {
        (index.wrapping_add(self.start_offset) % self.payloads.len() as u64) as usize
    }

    /// Executions a run performs for the requested `count`: at most one pass over the
    /// payloads, and exactly one pass when `count` is zero.
    pub fn total_count(&self, count: u64) -> u64 {
        let len = self.payloads.len() as u64;
        if count == 0 || count > len {
            len
        } else {
            count
        }
    }

    /// Executes one unit of work and records its outcome. Returns `None` when the run
    /// was cancelled before the execution finished; such executions are not counted.
    pub async fn run_unit(
        &self,
        cancel: &CancellationToken,
        params: &mut WorkParams,
    ) -> Option<Outcome> {
        let index = params.index();
        let payload = &self.payloads[self.payload_index(index)];
        self.stats.set_current(index);

        let lease = match self.locks.acquire(payload.wallet_count(), cancel).await {
            Ok(lease) => lease,
            Err(AcquireError::Cancelled) => return None,
            Err(error) => {
                self.stats.record(Outcome::Invalid);
                let name = payload.name.clone();
                params.ordered_log(move || {
                    warn!(index, payload = %name, %error, "cannot acquire wallets")
                });
                return Some(Outcome::Invalid);
            }
        };
        params.notify_submitted();

        let result = self.executor.execute(payload, lease.wallets(), cancel).await;
        lease.release();
        if result.error.as_ref().is_some_and(|error| error.is_cancelled()) {
            return None;
        }

        let outcome = Outcome::classify(&result);
        self.stats.record(outcome);
        let name = payload.name.clone();
        params.ordered_log(move || log_outcome(index, &name, outcome, &result));
        Some(outcome)
    }

    /// Runs the driver to completion, logging progress every [`STATS_INTERVAL`] and a
    /// final summary. The driver's `total_count` is capped by [`Self::total_count`].
    pub async fn run(
        self: Arc<Self>,
        driver: &ThroughputDriver,
        cancel: &CancellationToken,
    ) -> (DriverSummary, StatsSnapshot) {
        let options = *driver.options();
        let driver = ThroughputDriver::new(DriverOptions {
            total_count: self.total_count(options.total_count),
            ..options
        });
        info!(
            payloads = self.payloads.len(),
            count = driver.options().total_count,
            wallets = self.locks.len(),
            start_offset = self.start_offset,
            "starting replay"
        );
        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(report_progress(
            Arc::clone(&self.stats),
            reporter_stop.clone(),
        ));

        let runner = Arc::clone(&self);
        let summary = driver
            .run(cancel, move |token, mut params| {
                let runner = Arc::clone(&runner);
                async move {
                    runner.run_unit(&token, &mut params).await;
                }
            })
            .await;

        reporter_stop.cancel();
        if let Err(error) = reporter.await {
            warn!(%error, "progress reporter failed");
        }
        let snapshot = self.stats.snapshot();
        info!(started = summary.started, stop = ?summary.stop, "replay finished: {snapshot}");
        (summary, snapshot)
    }
}

fn log_outcome(index: u64, name: &str, outcome: Outcome, result: &ExecutionResult) {
    match outcome {
        Outcome::Success => info!(index, payload = name, %outcome, "payload replayed"),
        Outcome::PostCheck => warn!(
            index,
            payload = name,
            %outcome,
            failures = ?result.post_check_failures,
            "post-check failed"
        ),
        _ => match &result.error {
            Some(error) => warn!(index, payload = name, %outcome, %error, "payload failed"),
            None => warn!(index, payload = name, %outcome, "payload failed"),
        },
    }
}

async fn report_progress(stats: Arc<ReplayStats>, stop: CancellationToken) {
    let mut ticks = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticks.tick() => info!("progress: {}", stats.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{test_client, test_wallets, MockChain},
        ClientPool, DriverOptions, DriverStop, ExecutorOptions, OrderedLog, Supervisor, TxPool,
        TxPoolOptions,
    };
    use alloy_primitives::{hex, B256, U256};
    use payload::PayloadFile;

    const ETHER: u64 = 1_000_000_000_000_000_000;

    fn setup(wallets: usize, payloads: &str, start_offset: u64) -> (Arc<MockChain>, ReplayRunner) {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let wallets = test_wallets(wallets, 1);
        for wallet in &wallets {
            chain.fund(wallet.address(), U256::from(5 * ETHER));
            wallet.set_state(0, U256::from(5 * ETHER));
        }
        let executor = PayloadExecutor::new(
            Arc::new(ClientPool::new(vec![client])),
            Arc::new(TxPool::new(TxPoolOptions {
                poll_interval: Duration::from_millis(5),
                rebroadcast_interval: Duration::from_secs(60),
            })),
            Supervisor::new(Some(Duration::from_secs(5)), false),
            ExecutorOptions::default(),
        );
        let payloads = PayloadFile::from_yaml(payloads).unwrap().payloads;
        let runner =
            ReplayRunner::new(payloads, WalletLockPool::new(wallets), executor, start_offset)
                .unwrap();
        (chain, runner)
    }

    fn simple_transfer() -> String {
        let word = |byte| hex::encode(B256::with_last_byte(byte));
        format!(
            r#"
payloads:
  - name: simple-transfer
    prerequisites:
      sender[1]: "0x0de0b6b3a7640000"
    txs:
      - from: deployer
        type: 2
        data: "0x00"
        gas: 100000
      - from: sender[1]
        type: 2
        to: $contract[1]
        data: "0x{}{}{}000000000000000000000000$contract[1]"
        gas: 50000
        gasPrice: 10
    postcheck:
      contract[1]:
        storage:
          "0x0": "0x01"
          "0x1": "0x$contract[1]"
      sender[1]:
        balance: "0x0de0b6b3a760cbb0"
"#,
            word(0),
            word(1),
            word(1)
        )
    }

    const MIXED: &str = r#"
payloads:
  - name: ok
    txs:
      - from: sender[1]
        to: $sender[1]
        type: 2
  - name: reverts
    txs:
      - from: sender[1]
        to: $sender[1]
        type: 2
        data: "0xfe"
  - name: wrong-storage
    txs:
      - from: sender[1]
        to: $sender[1]
        type: 2
    postcheck:
      sender[1]:
        storage:
          "0x0": "0x01"
  - name: bad-origin
    txs:
      - from: nobody
"#;

    fn driver(total_count: u64) -> ThroughputDriver {
        ThroughputDriver::new(DriverOptions {
            throughput: total_count,
            max_pending: total_count,
            total_count,
            timeout: None,
        })
    }

    #[test]
    fn payload_index_wraps_with_offset() {
        let (_, runner) = setup(2, MIXED, 3);
        let order: Vec<_> = (0..6).map(|i| runner.payload_index(i)).collect();
        assert_eq!(order, vec![3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn empty_payload_list_is_rejected() {
        let chain = Arc::new(MockChain::new(1));
        let executor = PayloadExecutor::new(
            Arc::new(ClientPool::new(vec![test_client(&chain)])),
            Arc::new(TxPool::default()),
            Supervisor::default(),
            ExecutorOptions::default(),
        );
        assert!(matches!(
            ReplayRunner::new(Vec::new(), WalletLockPool::new(Vec::new()), executor, 0),
            Err(RunError::NoPayloads)
        ));
    }

    #[tokio::test]
    async fn simple_transfer_counts_one_success() {
        let (chain, runner) = setup(2, &simple_transfer(), 0);
        let (summary, snapshot) = Arc::new(runner)
            .run(&driver(1), &CancellationToken::new())
            .await;

        assert_eq!(summary.stop, DriverStop::Completed);
        assert_eq!(
            snapshot,
            StatsSnapshot {
                current: 0,
                success: 1,
                ..Default::default()
            }
        );
        assert_eq!(chain.sent_transactions().len(), 2);
    }

    #[tokio::test]
    async fn every_outcome_lands_in_one_bucket() {
        let (_, runner) = setup(8, MIXED, 0);
        let (summary, snapshot) = Arc::new(runner)
            .run(&driver(4), &CancellationToken::new())
            .await;

        assert_eq!(summary.started, 4);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.reverted, 1);
        assert_eq!(snapshot.postcheck, 1);
        assert_eq!(snapshot.invalid, 1);
        assert_eq!(snapshot.timeout, 0);
        assert_eq!(snapshot.total(), 4);
    }

    const TWO_TRANSFERS: &str = r#"
payloads:
  - name: first
    txs:
      - from: sender[1]
        to: $sender[1]
        type: 2
  - name: second
    txs:
      - from: sender[1]
        to: $sender[1]
        type: 2
"#;

    #[test]
    fn total_count_is_one_pass_at_most() {
        let (_, runner) = setup(2, TWO_TRANSFERS, 0);
        assert_eq!(runner.total_count(0), 2);
        assert_eq!(runner.total_count(1), 1);
        assert_eq!(runner.total_count(2), 2);
        assert_eq!(runner.total_count(5), 2);
    }

    #[rstest::rstest]
    #[case::unlimited(0)]
    #[case::past_the_end(5)]
    #[tokio::test]
    async fn run_replays_each_payload_once(#[case] count: u64) {
        let (chain, runner) = setup(4, TWO_TRANSFERS, 0);
        let driver = ThroughputDriver::new(DriverOptions {
            throughput: 10,
            max_pending: 10,
            total_count: count,
            timeout: None,
        });
        let (summary, snapshot) = Arc::new(runner)
            .run(&driver, &CancellationToken::new())
            .await;

        assert_eq!(summary.stop, DriverStop::Completed);
        assert_eq!(summary.started, 2);
        assert_eq!(snapshot.success, 2);
        assert_eq!(snapshot.total(), 2);
        assert_eq!(chain.sent_transactions().len(), 2);
    }

    #[tokio::test]
    async fn acquisition_failure_is_logged_in_unit_order() {
        let (_, runner) = setup(
            1,
            "payloads:\n  - name: big\n    txs:\n      - from: sender[3]\n",
            0,
        );
        let log = Arc::new(OrderedLog::new());
        let mut params = WorkParams::new(1, Arc::clone(&log));
        assert_eq!(
            runner.run_unit(&CancellationToken::new(), &mut params).await,
            Some(Outcome::Invalid)
        );
        assert_eq!(log.queued(), 1);

        log.mark_submitted(0);
        assert_eq!(log.queued(), 1);
        drop(params);
        assert_eq!(log.queued(), 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_invalid() {
        let (chain, runner) = setup(
            1,
            "payloads:\n  - name: big\n    txs:\n      - from: sender[3]\n",
            0,
        );
        let mut params = WorkParams::new(0, Arc::new(OrderedLog::new()));
        let outcome = runner.run_unit(&CancellationToken::new(), &mut params).await;
        assert_eq!(outcome, Some(Outcome::Invalid));
        assert_eq!(runner.stats().snapshot().invalid, 1);
        assert!(chain.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn cancelled_unit_is_not_recorded() {
        let (_, runner) = setup(2, &simple_transfer(), 0);
        let _held = runner.locks.try_acquire(1).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut params = WorkParams::new(0, Arc::new(OrderedLog::new()));
        assert_eq!(runner.run_unit(&cancel, &mut params).await, None);
        assert_eq!(runner.stats().snapshot().total(), 0);
    }
}
