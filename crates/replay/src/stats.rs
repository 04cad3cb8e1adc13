use crate::ExecutionResult;
use parking_lot::Mutex;
use std::fmt;

/// Bucket an execution is counted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Every phase confirmed and every post-check passed.
    Success,
    /// Acquisition, build, sign or submission failure.
    Invalid,
    /// A confirmed transaction reverted.
    Reverted,
    /// The post-state did not match.
    PostCheck,
    /// A phase ran into its deadline.
    Timeout,
}

impl Outcome {
    /// Classifies a finished execution. A timeout outranks every other failure,
    /// followed by invalid, reverted and post-check failures.
    pub fn classify(result: &ExecutionResult) -> Self {
        if result.timed_out {
            Self::Timeout
        } else if result.error.is_some() {
            Self::Invalid
        } else if result.reverted {
            Self::Reverted
        } else if !result.post_check_failures.is_empty() {
            Self::PostCheck
        } else {
            Self::Success
        }
    }

    /// Label used in log lines.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Invalid => "invalid",
            Self::Reverted => "reverted",
            Self::PostCheck => "postcheck",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point in time copy of the run counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Index of the most recently started unit of work.
    pub current: u64,
    /// Successful executions.
    pub success: u64,
    /// Invalid executions.
    pub invalid: u64,
    /// Executions with a reverted transaction.
    pub reverted: u64,
    /// Executions with post-check mismatches.
    pub postcheck: u64,
    /// Executions that timed out.
    pub timeout: u64,
}

impl StatsSnapshot {
    /// Number of failed executions of any kind.
    pub fn failed(&self) -> u64 {
        self.invalid + self.reverted + self.postcheck + self.timeout
    }

    /// Number of recorded executions.
    pub fn total(&self) -> u64 {
        self.success + self.failed()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={}, success={}, failed={} (invalid={}, reverted={}, postcheck={}, timeout={})",
            self.current,
            self.success,
            self.failed(),
            self.invalid,
            self.reverted,
            self.postcheck,
            self.timeout
        )
    }
}

/// Outcome counters of a run, shared by every execution task.
#[derive(Debug, Default)]
pub struct ReplayStats {
    inner: Mutex<StatsSnapshot>,
}

impl ReplayStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one finished execution.
    pub fn record(&self, outcome: Outcome) {
        let mut stats = self.inner.lock();
        let counter = match outcome {
            Outcome::Success => &mut stats.success,
            Outcome::Invalid => &mut stats.invalid,
            Outcome::Reverted => &mut stats.reverted,
            Outcome::PostCheck => &mut stats.postcheck,
            Outcome::Timeout => &mut stats.timeout,
        };
        *counter += 1;
    }

    /// Moves the progress marker forward to `index`.
    pub fn set_current(&self, index: u64) {
        let mut stats = self.inner.lock();
        stats.current = stats.current.max(index);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }
}
