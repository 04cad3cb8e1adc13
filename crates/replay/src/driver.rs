//! Paced execution of units of work.
//!
//! The driver starts up to `throughput` units at the beginning of every 12 second slot,
//! never keeps more than `max_pending` units running, and stops after `total_count`
//! units, when its run timeout expires or when the run is cancelled.
//!
//! Units may log through [`WorkParams::ordered_log`]. Those callbacks run in unit order:
//! the callbacks of unit `n` run once units `0..=n` each called
//! [`WorkParams::notify_submitted`] or finished.

use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Length of one pacing slot, the mainnet block time.
pub const SLOT_DURATION: Duration = Duration::from_secs(12);

/// Pacing limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverOptions {
    /// Units started per slot.
    pub throughput: u64,
    /// Units running at once.
    pub max_pending: u64,
    /// Units to start, zero runs until cancelled or timed out.
    pub total_count: u64,
    /// Limit on the whole run.
    pub timeout: Option<Duration>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            throughput: 1,
            max_pending: 10,
            total_count: 0,
            timeout: None,
        }
    }
}

/// Why the driver stopped starting units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverStop {
    /// `total_count` units were started and finished.
    Completed,
    /// The run was cancelled.
    Cancelled,
    /// The run timeout expired.
    TimedOut,
}

/// What a driver run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverSummary {
    /// Units started.
    pub started: u64,
    /// Why the run ended.
    pub stop: DriverStop,
}

/// Deferred log callback.
pub type LogFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LogSlot {
    submitted: bool,
    logs: Vec<LogFn>,
}

#[derive(Default)]
struct LogState {
    next: u64,
    slots: BTreeMap<u64, LogSlot>,
}

/// Log callbacks released in unit order.
#[derive(Default)]
pub struct OrderedLog {
    state: Mutex<LogState>,
}

impl fmt::Debug for OrderedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OrderedLog")
            .field("next", &state.next)
            .field("queued", &state.slots.len())
            .finish()
    }
}

impl OrderedLog {
    /// Creates an empty log starting at unit 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `log` behind the earlier units, or runs it right away when unit `index` was
    /// already flushed.
    pub fn push(&self, index: u64, log: LogFn) {
        {
            let mut state = self.state.lock();
            if index >= state.next {
                state.slots.entry(index).or_default().logs.push(log);
                return;
            }
        }
        log();
    }

    /// Units holding queued callbacks.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Marks unit `index` as submitted and runs every callback that became ready.
    pub fn mark_submitted(&self, index: u64) {
        let ready = {
            let mut state = self.state.lock();
            if index < state.next {
                return;
            }
            state.slots.entry(index).or_default().submitted = true;
            let mut ready = Vec::new();
            loop {
                let next = state.next;
                match state.slots.get(&next) {
                    Some(slot) if slot.submitted => {}
                    _ => break,
                }
                if let Some(slot) = state.slots.remove(&next) {
                    ready.extend(slot.logs);
                }
                state.next += 1;
            }
            ready
        };
        for log in ready {
            log();
        }
    }
}

/// Handle a unit of work receives from the driver.
#[derive(Debug)]
pub struct WorkParams {
    index: u64,
    log: Arc<OrderedLog>,
    notified: bool,
}

impl WorkParams {
    /// Creates the handle of unit `index`.
    pub fn new(index: u64, log: Arc<OrderedLog>) -> Self {
        Self {
            index,
            log,
            notified: false,
        }
    }

    /// Sequential index of the unit.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Signals that the unit submitted its work, which releases its ordered logs.
    /// Dropping the handle does the same.
    pub fn notify_submitted(&mut self) {
        if !self.notified {
            self.notified = true;
            self.log.mark_submitted(self.index);
        }
    }

    /// Runs `log` once every earlier unit notified submission.
    pub fn ordered_log(&self, log: impl FnOnce() + Send + 'static) {
        self.log.push(self.index, Box::new(log));
    }
}

impl Drop for WorkParams {
    fn drop(&mut self) {
        self.notify_submitted();
    }
}

/// Starts units of work at a fixed pace.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThroughputDriver {
    options: DriverOptions,
}

impl ThroughputDriver {
    /// Creates a driver.
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }

    /// Pacing limits.
    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Runs `work` once per unit until the run ends, then waits for the running units.
    ///
    /// Units receive a token that fires when the run is cancelled or times out.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, work: F) -> DriverSummary
    where
        F: Fn(CancellationToken, WorkParams) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let DriverOptions {
            throughput,
            max_pending,
            total_count,
            timeout,
        } = self.options;
        let units = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(max_pending.max(1) as usize));
        let log = Arc::new(OrderedLog::new());
        let mut tasks = JoinSet::new();

        let mut slots = tokio::time::interval(SLOT_DURATION);
        slots.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut started = 0;
        let stop = 'run: loop {
            if total_count > 0 && started >= total_count {
                break DriverStop::Completed;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break DriverStop::Cancelled,
                _ = &mut expired => break DriverStop::TimedOut,
                _ = slots.tick() => {}
            }
            for _ in 0..throughput.max(1) {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'run DriverStop::Cancelled,
                    _ = &mut expired => break 'run DriverStop::TimedOut,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'run DriverStop::Cancelled,
                    },
                };
                while let Some(result) = tasks.try_join_next() {
                    report_panic(result);
                }

                let params = WorkParams::new(started, Arc::clone(&log));
                let unit = work(units.clone(), params);
                tasks.spawn(async move {
                    unit.await;
                    drop(permit);
                });
                started += 1;
                if total_count > 0 && started >= total_count {
                    break 'run DriverStop::Completed;
                }
            }
            debug!(started, running = tasks.len(), "slot filled");
        };

        if stop != DriverStop::Completed {
            units.cancel();
        }
        loop {
            tokio::select! {
                _ = &mut expired, if !units.is_cancelled() => units.cancel(),
                next = tasks.join_next() => match next {
                    Some(result) => report_panic(result),
                    None => break,
                },
            }
        }
        let stop = match stop {
            DriverStop::Completed if cancel.is_cancelled() => DriverStop::Cancelled,
            DriverStop::Completed if units.is_cancelled() => DriverStop::TimedOut,
            stop => stop,
        };
        DriverSummary { started, stop }
    }
}

fn report_panic(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        if error.is_panic() {
            error!(%error, "unit of work panicked");
        }
    }
}
