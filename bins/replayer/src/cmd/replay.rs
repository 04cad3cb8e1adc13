use clap::Parser;
use replay::{
    load_payloads, ClientError, ClientPool, ClientSelection, ConfigError, LoadError,
    PayloadExecutor, PoolError, ReplayOptions, ReplayRunner, RunError, Supervisor,
    ThroughputDriver, TxPool, TxPoolError, Wallet, WalletError, WalletPool,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `replay` subcommand
#[derive(Parser, Debug)]
pub struct Cmd {
    /// RPC endpoints as `[group(a,b)][name(x)]url`
    #[arg(long = "rpchost", required = true, num_args = 1..)]
    rpchosts: Vec<String>,
    /// Private key of the root wallet funding the replay wallets
    #[arg(short = 'p', long)]
    privkey: String,
    /// Seed mixed into the derivation of the replay wallets
    #[arg(short = 's', long, default_value = "")]
    seed: String,
    /// YAML file with replay options, flags given on the command line take precedence
    #[arg(long)]
    config: Option<PathBuf>,
    /// Payload executions to run, capped at the payload count; 0 replays every payload once
    #[arg(short = 'c', long)]
    count: Option<u64>,
    /// Payload executions started per slot
    #[arg(short = 't', long)]
    throughput: Option<u64>,
    /// Payload executions in flight at once
    #[arg(long)]
    max_pending: Option<u64>,
    /// Size of the wallet pool, 0 derives it from --max-pending
    #[arg(long)]
    max_wallets: Option<u64>,
    /// Seconds between rebroadcasts of unconfirmed transactions, 0 disables them
    #[arg(long)]
    rebroadcast: Option<u64>,
    /// Max fee per gas in gwei
    #[arg(long)]
    basefee: Option<u64>,
    /// Max tip per gas in gwei
    #[arg(long)]
    tipfee: Option<u64>,
    /// Limit on the whole run, e.g. `1h 30m`
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    /// Limit on each phase of a payload
    #[arg(long, value_parser = humantime::parse_duration)]
    payload_timeout: Option<Duration>,
    /// Client group transactions are sent to
    #[arg(long)]
    client_group: Option<String>,
    /// Payload YAML file or URL
    #[arg(long, conflicts_with = "fixtures")]
    payload: Option<String>,
    /// Fixtures release archive (file or URL) or extracted fixtures directory
    #[arg(long)]
    fixtures: Option<String>,
    /// Regex selecting fixture tests by payload name
    #[arg(long)]
    pattern: Option<String>,
    /// Regex excluding fixture tests by payload name
    #[arg(long)]
    exclude: Option<String>,
    /// Payload index of the first execution
    #[arg(long)]
    start_offset: Option<u64>,
    /// Skip the post-state comparison
    #[arg(long)]
    skip_postchecks: bool,
    /// Log every submitted transaction
    #[arg(long)]
    log_txs: bool,
    /// Ether sent to a replay wallet when it is refilled
    #[arg(long)]
    refill_amount: Option<u64>,
    /// Ether balance below which a replay wallet is refilled
    #[arg(long)]
    refill_balance: Option<u64>,
}

/// Errors of the `replay` subcommand.
#[derive(Debug, Error)]
pub enum Error {
    /// Options are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Tokio runtime could not start.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// Endpoint failure.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// No endpoint serves the client group.
    #[error("no client available in group {0:?}")]
    NoClient(String),
    /// Root key is invalid.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// Wallet pool could not be prepared.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Fees could not be determined.
    #[error(transparent)]
    Fees(#[from] TxPoolError),
    /// Payloads could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// Run could not start.
    #[error(transparent)]
    Run(#[from] RunError),
}

impl Cmd {
    /// Runs the `replay` command.
    pub fn run(&self) -> Result<(), Error> {
        let options = self.options()?;
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?
            .block_on(self.replay(options))
    }

    /// Options from the config file with the command line flags applied on top.
    pub fn options(&self) -> Result<ReplayOptions, ConfigError> {
        let mut options = match &self.config {
            Some(path) => ReplayOptions::read(path)?,
            None => ReplayOptions::default(),
        };
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        options.$field = value.clone();
                    }
                )*
            };
        }
        set!(
            count,
            throughput,
            max_pending,
            max_wallets,
            rebroadcast,
            basefee,
            tipfee,
            payload_timeout,
            client_group,
            start_offset,
            refill_amount,
            refill_balance,
        );
        if self.timeout.is_some() {
            options.timeout = self.timeout;
        }
        if self.payload.is_some() || self.fixtures.is_some() {
            options.payload = self.payload.clone();
            options.fixtures = self.fixtures.clone();
        }
        if self.pattern.is_some() {
            options.pattern = self.pattern.clone();
        }
        if self.exclude.is_some() {
            options.exclude = self.exclude.clone();
        }
        options.skip_postchecks |= self.skip_postchecks;
        options.log_txs |= self.log_txs;
        options.validate()?;
        Ok(options)
    }

    async fn replay(&self, options: ReplayOptions) -> Result<(), Error> {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping replay");
                interrupt.cancel();
            }
        });

        let clients = Arc::new(ClientPool::connect(&self.rpchosts)?);
        let client = clients
            .get(ClientSelection::First, &options.client_group)
            .ok_or_else(|| Error::NoClient(options.client_group.clone()))?;
        let chain_id = client.chain().chain_id().await?;
        info!(chain_id, clients = clients.clients().len(), "connected");

        let root = Arc::new(Wallet::from_hex(&self.privkey, chain_id)?);
        let wallets = WalletPool::new(root, options.wallet_count() as usize, &self.seed)?;
        let txpool = Arc::new(TxPool::new(options.txpool_options()));
        let fees = txpool
            .suggested_fees(&client, options.base_fee_wei(), options.tip_fee_wei())
            .await?;
        let refilled = wallets
            .prepare(&client, &txpool, fees, options.refill_options())
            .await?;
        info!(wallets = wallets.len(), refilled, root = %wallets.root().address(), "wallets ready");

        let source = options.source()?;
        let payloads = match load_payloads(&source, options.convert_options(), &cancel).await {
            Err(LoadError::Cancelled) => {
                warn!("interrupted while loading payloads");
                return Ok(());
            }
            result => result?,
        };

        let executor = PayloadExecutor::new(
            clients,
            txpool,
            Supervisor::new(Some(options.payload_timeout), options.rebroadcast > 0),
            options.executor_options(),
        );
        let runner = Arc::new(ReplayRunner::new(
            payloads,
            wallets.lock_pool(),
            executor,
            options.start_offset,
        )?);
        let driver = ThroughputDriver::new(options.driver_options());
        runner.run(&driver, &cancel).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cmd {
        let mut argv = vec!["replay", "--rpchost", "http://localhost:8545", "-p", "0x01"];
        argv.extend_from_slice(args);
        Cmd::parse_from(argv)
    }

    #[test]
    fn flags_override_defaults() {
        let options = parse(&[
            "--payload",
            "payloads.yaml",
            "-t",
            "3",
            "--payload-timeout",
            "10m",
            "--skip-postchecks",
        ])
        .options()
        .unwrap();
        assert_eq!(options.throughput, 3);
        assert_eq!(options.max_pending, 10);
        assert_eq!(options.payload_timeout, Duration::from_secs(600));
        assert_eq!(options.payload.as_deref(), Some("payloads.yaml"));
        assert!(options.skip_postchecks);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.yaml");
        std::fs::write(
            &path,
            "throughput: 5\nmaxPending: 4\nfixtures: fixtures.tar.gz\npattern: sstore\n",
        )
        .unwrap();
        let config = path.display().to_string();

        let options = parse(&["--config", &config, "--max-pending", "8"])
            .options()
            .unwrap();
        assert_eq!(options.throughput, 5);
        assert_eq!(options.max_pending, 8);
        assert_eq!(options.fixtures.as_deref(), Some("fixtures.tar.gz"));
        assert_eq!(options.pattern.as_deref(), Some("sstore"));

        let options = parse(&["--config", &config, "--payload", "p.yaml"])
            .options()
            .unwrap();
        assert_eq!(options.payload.as_deref(), Some("p.yaml"));
        assert_eq!(options.fixtures, None);
    }

    #[test]
    fn source_is_required() {
        assert!(matches!(
            parse(&[]).options(),
            Err(ConfigError::MissingSource)
        ));
    }

    #[test]
    fn payload_and_fixtures_conflict() {
        let result = Cmd::try_parse_from([
            "replay",
            "--rpchost",
            "http://localhost:8545",
            "-p",
            "0x01",
            "--payload",
            "a.yaml",
            "--fixtures",
            "b.tar.gz",
        ]);
        assert!(result.is_err());
    }
}
