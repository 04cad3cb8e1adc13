use crate::{
    DriverOptions, ExecutorOptions, PayloadSource, RefillOptions, TxPoolOptions, ETHER, GWEI,
};
use alloy_primitives::U256;
use convert::ConvertOptions;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Wallets kept per allowed in-flight execution when no explicit cap is configured.
pub const WALLETS_PER_PENDING: u64 = 5;

/// Errors loading or validating replay options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config file.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid YAML for the options.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Both a payload file and a fixtures archive were given.
    #[error("--payload and --fixtures are mutually exclusive")]
    ConflictingSources,
    /// Neither a payload file nor a fixtures archive was given.
    #[error("one of --payload or --fixtures is required")]
    MissingSource,
    /// Throughput or pending limit is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Settings of a replay run. Loaded from a YAML config file, then overridden by
/// command line flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplayOptions {
    /// Payload executions to run, capped at one pass over the payloads. Zero replays
    /// every payload once.
    pub count: u64,
    /// Executions started per 12 second slot.
    pub throughput: u64,
    /// Executions in flight at once.
    pub max_pending: u64,
    /// Wallet universe size, zero derives it from `max_pending`.
    pub max_wallets: u64,
    /// Seconds between rebroadcasts of unconfirmed transactions, zero disables them.
    pub rebroadcast: u64,
    /// Fee cap in gwei.
    pub basefee: u64,
    /// Tip cap in gwei.
    pub tipfee: u64,
    /// Limit on the whole run.
    #[serde(with = "humantime_opt")]
    pub timeout: Option<Duration>,
    /// Limit on each phase of a payload.
    #[serde(with = "humantime_dur")]
    pub payload_timeout: Duration,
    /// Client group to send to.
    pub client_group: String,
    /// Payload YAML file or URL.
    pub payload: Option<String>,
    /// Fixtures release archive file or URL.
    pub fixtures: Option<String>,
    /// Regex selecting fixture tests by payload name.
    pub pattern: Option<String>,
    /// Regex excluding fixture tests by payload name.
    pub exclude: Option<String>,
    /// Payload index of the first execution.
    pub start_offset: u64,
    /// Skip the post-state comparison.
    pub skip_postchecks: bool,
    /// Log every submitted transaction.
    pub log_txs: bool,
    /// Ether sent to a child wallet on refill.
    pub refill_amount: u64,
    /// Ether balance below which a child wallet is refilled.
    pub refill_balance: u64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            count: 0,
            throughput: 1,
            max_pending: 10,
            max_wallets: 100,
            rebroadcast: 1,
            basefee: 20,
            tipfee: 2,
            timeout: None,
            payload_timeout: Duration::from_secs(30 * 60),
            client_group: String::new(),
            payload: None,
            fixtures: None,
            pattern: None,
            exclude: None,
            start_offset: 0,
            skip_postchecks: false,
            log_txs: false,
            refill_amount: 5,
            refill_balance: 1,
        }
    }
}

impl ReplayOptions {
    /// Parses options from YAML, missing keys keep their defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(Into::into)
    }

    /// Reads options from a YAML file.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Checks that the options describe a runnable replay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source()?;
        if self.throughput == 0 {
            return Err(ConfigError::Zero("throughput"));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::Zero("max-pending"));
        }
        Ok(())
    }

    /// Size of the wallet universe. Without an explicit cap it is
    /// [`WALLETS_PER_PENDING`] wallets per in-flight execution.
    pub fn wallet_count(&self) -> u64 {
        let wanted = self.max_pending * WALLETS_PER_PENDING;
        match self.max_wallets {
            0 => wanted,
            cap if cap < wanted => {
                warn!(
                    max_wallets = cap,
                    wanted,
                    "wallet cap below recommended count, executions may wait for wallets"
                );
                cap
            }
            cap => cap,
        }
    }

    /// Fee cap override in wei.
    pub fn base_fee_wei(&self) -> u128 {
        u128::from(self.basefee) * GWEI
    }

    /// Tip cap override in wei.
    pub fn tip_fee_wei(&self) -> u128 {
        u128::from(self.tipfee) * GWEI
    }

    /// Settings of the payload executor.
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            client_group: self.client_group.clone(),
            base_fee: self.base_fee_wei(),
            tip_fee: self.tip_fee_wei(),
            rebroadcast: self.rebroadcast > 0,
            skip_postchecks: self.skip_postchecks,
            log_txs: self.log_txs,
        }
    }

    /// Where payloads are loaded from.
    pub fn source(&self) -> Result<PayloadSource, ConfigError> {
        match (&self.payload, &self.fixtures) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingSources),
            (Some(payload), None) => Ok(PayloadSource::Payload(payload.clone())),
            (None, Some(fixtures)) => Ok(PayloadSource::Fixtures(fixtures.clone())),
            (None, None) => Err(ConfigError::MissingSource),
        }
    }

    /// Name filters applied to converted fixtures.
    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            include: self.pattern.clone(),
            exclude: self.exclude.clone(),
            verbose: false,
        }
    }

    /// Pacing of the run.
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            throughput: self.throughput,
            max_pending: self.max_pending,
            total_count: self.count,
            timeout: self.timeout,
        }
    }

    /// Child wallet top up policy.
    pub fn refill_options(&self) -> RefillOptions {
        RefillOptions {
            threshold: U256::from(u128::from(self.refill_balance) * ETHER),
            amount: U256::from(u128::from(self.refill_amount) * ETHER),
        }
    }

    /// Settings of the transaction layer.
    pub fn txpool_options(&self) -> TxPoolOptions {
        let defaults = TxPoolOptions::default();
        TxPoolOptions {
            rebroadcast_interval: match self.rebroadcast {
                0 => defaults.rebroadcast_interval,
                secs => Duration::from_secs(secs),
            },
            ..defaults
        }
    }
}

mod humantime_dur {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => s.collect_str(&humantime::format_duration(*value)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
