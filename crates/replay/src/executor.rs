use crate::{
    AddressMap, Client, ClientError, ClientPool, ClientSelection, ExecutionLedger,
    MaterializeError, Materializer, PendingTx, PhaseWait, PostCheckValidator, SendOptions,
    Supervisor, TxPool, TxPoolError, TxReceipt, Wallet,
};
use payload::{Origin, Payload, PlaceholderError, Tx};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors aborting an execution. Every variant except a timed out phase counts as an
/// invalid payload.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No client serves the configured group.
    #[error("no client available in group {0:?}")]
    NoClient(String),
    /// Fewer wallets than the payload needs.
    #[error("payload needs {needed} wallets, got {got}")]
    NotEnoughWallets {
        /// Senders plus deployer.
        needed: usize,
        /// Wallets handed in.
        got: usize,
    },
    /// A `from` field is not `deployer` or `sender[N]`.
    #[error("invalid transaction origin: {0}")]
    Origin(#[from] PlaceholderError),
    /// A `from` field names a sender beyond the acquired ones.
    #[error("sender index {0} out of range")]
    SenderOutOfRange(usize),
    /// Chain state could not be read.
    #[error("failed to query chain state: {0}")]
    Client(#[from] ClientError),
    /// Fees could not be determined.
    #[error(transparent)]
    Fees(TxPoolError),
    /// A phase failed.
    #[error("{origin} transactions failed: {source}")]
    Phase {
        /// Author of the phase.
        origin: Origin,
        /// Cause.
        #[source]
        source: PhaseError,
    },
}

impl ExecutionError {
    /// Whether a phase ran into its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Phase {
                source: PhaseError::TimedOut { .. },
                ..
            }
        )
    }

    /// Whether the run was cancelled mid-execution.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Phase {
                source: PhaseError::Cancelled,
                ..
            }
        )
    }
}

/// Errors of a single phase.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Transaction could not be built or signed.
    #[error("failed to build transaction {index}: {source}")]
    Build {
        /// Position within the phase.
        index: usize,
        /// Cause.
        #[source]
        source: MaterializeError,
    },
    /// Transaction was rejected on submission.
    #[error("failed to send transaction {index}: {source}")]
    Submit {
        /// Position within the phase.
        index: usize,
        /// Cause.
        #[source]
        source: TxPoolError,
    },
    /// Tracking failed before a receipt arrived.
    #[error("transaction {index} failed: {source}")]
    Confirm {
        /// Position within the phase.
        index: usize,
        /// Cause.
        #[source]
        source: TxPoolError,
    },
    /// Deadline passed, outstanding transactions were replaced.
    #[error("transactions timed out (replaced: {replaced})")]
    TimedOut {
        /// Confirmed replacements, or why replacing failed.
        replaced: String,
    },
    /// The run was cancelled.
    #[error("execution cancelled")]
    Cancelled,
    /// The wallet nonce could not be resynchronised.
    #[error("failed to resync nonce: {0}")]
    Nonce(#[source] ClientError),
}

/// Outcome of one payload execution.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Why the execution stopped early.
    pub error: Option<ExecutionError>,
    /// A confirmed transaction reverted.
    pub reverted: bool,
    /// A phase ran into its deadline.
    pub timed_out: bool,
    /// Post-check mismatches in target order.
    pub post_check_failures: Vec<String>,
    /// Placeholder bindings used by the execution.
    pub addresses: AddressMap,
    /// Every confirmed receipt in submission order.
    pub receipts: Vec<TxReceipt>,
}

/// One submission batch: the transactions of a single wallet that are sent together and
/// awaited with one barrier.
#[derive(Debug, PartialEq, Eq)]
pub struct Phase<'a> {
    /// Author of every transaction of the phase.
    pub origin: Origin,
    /// Transactions in payload order.
    pub txs: Vec<&'a Tx>,
}

/// Splits the transactions of `payload` into phases: every deployer transaction first,
/// then runs of consecutive transactions sharing the same sender, in payload order.
pub fn plan_phases(payload: &Payload) -> Result<Vec<Phase<'_>>, PlaceholderError> {
    let mut deployer = Vec::new();
    let mut groups: Vec<Phase<'_>> = Vec::new();
    for tx in &payload.txs {
        match tx.origin()? {
            Origin::Deployer => deployer.push(tx),
            origin => match groups.last_mut() {
                Some(group) if group.origin == origin => group.txs.push(tx),
                _ => groups.push(Phase {
                    origin,
                    txs: vec![tx],
                }),
            },
        }
    }
    let mut phases = Vec::with_capacity(groups.len() + 1);
    if !deployer.is_empty() {
        phases.push(Phase {
            origin: Origin::Deployer,
            txs: deployer,
        });
    }
    phases.extend(groups);
    Ok(phases)
}

/// Execution settings shared by every payload of a run.
#[derive(Clone, Debug, Default)]
pub struct ExecutorOptions {
    /// Client group transactions are sent to.
    pub client_group: String,
    /// Fee cap override in wei, zero uses the node suggestion.
    pub base_fee: u128,
    /// Tip cap override in wei, zero uses the node suggestion.
    pub tip_fee: u128,
    /// Rebroadcast unconfirmed transactions.
    pub rebroadcast: bool,
    /// Skip the post-state comparison.
    pub skip_postchecks: bool,
    /// Log every submitted transaction.
    pub log_txs: bool,
}

#[derive(Debug, Default)]
struct PhaseReport {
    receipts: Vec<TxReceipt>,
    reverted: bool,
}

/// Runs payloads against the network.
#[derive(Debug)]
pub struct PayloadExecutor {
    clients: Arc<ClientPool>,
    txpool: Arc<TxPool>,
    supervisor: Supervisor,
    options: ExecutorOptions,
}

impl PayloadExecutor {
    /// Creates an executor.
    pub fn new(
        clients: Arc<ClientPool>,
        txpool: Arc<TxPool>,
        supervisor: Supervisor,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            clients,
            txpool,
            supervisor,
            options,
        }
    }

    /// Executes `payload` with `wallets`, the deployer first and then one wallet per
    /// sender.
    pub async fn execute(
        &self,
        payload: &Payload,
        wallets: &[Arc<Wallet>],
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        if let Err(error) = self.run(payload, wallets, cancel, &mut result).await {
            result.timed_out = error.is_timeout();
            result.error = Some(error);
        }
        result
    }

    async fn run(
        &self,
        payload: &Payload,
        wallets: &[Arc<Wallet>],
        cancel: &CancellationToken,
        result: &mut ExecutionResult,
    ) -> Result<(), ExecutionError> {
        let client = self
            .clients
            .get(ClientSelection::RoundRobin, &self.options.client_group)
            .ok_or_else(|| ExecutionError::NoClient(self.options.client_group.clone()))?;
        let needed = payload.wallet_count();
        let Some((deployer, senders)) = wallets.split_first().filter(|_| wallets.len() >= needed)
        else {
            return Err(ExecutionError::NotEnoughWallets {
                needed,
                got: wallets.len(),
            });
        };
        let phases = plan_phases(payload)?;

        deployer.reset_nonce_if_needed(&client).await?;
        let mut ledger = ExecutionLedger::default();
        for (position, sender) in senders.iter().enumerate() {
            let balance = client.chain().balance(sender.address()).await?;
            ledger.initial_balances.insert(position + 1, balance);
        }

        let addresses = AddressMap::new(
            deployer.address(),
            deployer.nonce(),
            senders.iter().map(|wallet| wallet.address()).collect(),
            payload,
        );
        result.addresses = addresses.clone();

        let fees = self
            .txpool
            .suggested_fees(&client, self.options.base_fee, self.options.tip_fee)
            .await
            .map_err(ExecutionError::Fees)?;
        let materializer = Materializer::new(&addresses, senders, fees);

        for phase in &phases {
            let wallet = match phase.origin {
                Origin::Deployer => deployer,
                Origin::Sender(index) => index
                    .checked_sub(1)
                    .and_then(|i| senders.get(i))
                    .ok_or(ExecutionError::SenderOutOfRange(index))?,
            };
            let report = self
                .run_phase(&client, wallet, phase, &materializer, cancel)
                .await
                .map_err(|source| ExecutionError::Phase {
                    origin: phase.origin,
                    source,
                })?;
            if let Origin::Sender(index) = phase.origin {
                let costs = ledger.gas_costs.entry(index).or_default();
                for (tx, receipt) in phase.txs.iter().zip(&report.receipts) {
                    costs.record(receipt.gas_used, tx.gas_price, fees.max_fee_per_gas);
                }
            }
            result.reverted |= report.reverted;
            result.receipts.extend(report.receipts);
        }

        if !self.options.skip_postchecks {
            result.post_check_failures = PostCheckValidator::new(&client, &addresses)
                .validate(payload, &ledger)
                .await;
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        client: &Arc<Client>,
        wallet: &Arc<Wallet>,
        phase: &Phase<'_>,
        materializer: &Materializer<'_>,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport, PhaseError> {
        wallet
            .reset_nonce_if_needed(client)
            .await
            .map_err(PhaseError::Nonce)?;

        let mut envelopes = Vec::with_capacity(phase.txs.len());
        for (index, tx) in phase.txs.iter().enumerate() {
            let envelope = materializer.build(wallet, tx).map_err(|source| {
                if index > 0 {
                    wallet.mark_needs_resync();
                }
                PhaseError::Build { index, source }
            })?;
            envelopes.push(envelope);
        }

        let send = SendOptions {
            rebroadcast: self.options.rebroadcast,
        };
        let mut pending: Vec<PendingTx> = Vec::with_capacity(envelopes.len());
        for (index, envelope) in envelopes.into_iter().enumerate() {
            if self.options.log_txs {
                info!(
                    origin = %phase.origin,
                    wallet = %wallet.address(),
                    hash = %envelope.tx_hash(),
                    index,
                    "sending transaction"
                );
            }
            match self.txpool.send_transaction(client, wallet, envelope, send).await {
                Ok(tx) => pending.push(tx),
                Err(source) => {
                    wallet.mark_needs_resync();
                    return Err(PhaseError::Submit { index, source });
                }
            }
        }

        let deadline = self.supervisor.deadline();
        match self.supervisor.await_phase(pending, deadline, cancel).await {
            PhaseWait::Completed(results) => {
                let mut report = PhaseReport::default();
                for (index, result) in results.into_iter().enumerate() {
                    let receipt = result.map_err(|source| PhaseError::Confirm { index, source })?;
                    if !receipt.success {
                        debug!(origin = %phase.origin, hash = %receipt.tx_hash, "transaction reverted");
                        report.reverted = true;
                    }
                    report.receipts.push(receipt);
                }
                Ok(report)
            }
            PhaseWait::TimedOut { outstanding } => {
                let replaced = match self
                    .supervisor
                    .replace_outstanding(
                        &self.txpool,
                        client,
                        wallet,
                        &outstanding,
                        materializer.fees(),
                    )
                    .await
                {
                    Ok(count) => count.to_string(),
                    Err(error) => {
                        wallet.mark_needs_resync();
                        error.to_string()
                    }
                };
                Err(PhaseError::TimedOut { replaced })
            }
            PhaseWait::Cancelled => {
                wallet.mark_needs_resync();
                Err(PhaseError::Cancelled)
            }
        }
    }
}
