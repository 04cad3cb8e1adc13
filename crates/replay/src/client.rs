use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::Encodable2718;
use alloy_network::ReceiptResponse;
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_transport::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::debug;

/// Group every client belongs to when its host spec names none.
pub const DEFAULT_GROUP: &str = "default";

/// Group selector matching any client.
pub const ANY_GROUP: &str = "*";

/// How long a suggested gas price is reused.
pub const GAS_PRICE_CACHE_TTL: Duration = Duration::from_secs(12);

/// Tip used when the node cannot suggest one, 2 gwei.
pub const FALLBACK_TIP: u128 = 2_000_000_000;

/// Errors returned by chain clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// JSON-RPC transport or server error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Node refused the transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),
    /// Host spec could not be parsed.
    #[error("invalid rpc host {0:?}")]
    InvalidHost(String),
}

/// Receipt fields used by the replay engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Whether execution succeeded.
    pub success: bool,
    /// Gas used by the transaction.
    pub gas_used: u64,
    /// Price paid per unit of gas.
    pub effective_gas_price: u128,
    /// Including block.
    pub block_number: Option<u64>,
}

/// Read and submit access to an execution client.
#[async_trait]
pub trait ChainClient: fmt::Debug + Send + Sync {
    /// Chain id of the network.
    async fn chain_id(&self) -> Result<u64, ClientError>;

    /// Pending nonce of `address`.
    async fn nonce(&self, address: Address) -> Result<u64, ClientError>;

    /// Latest balance of `address`.
    async fn balance(&self, address: Address) -> Result<U256, ClientError>;

    /// Latest value of a storage slot.
    async fn storage_at(&self, address: Address, slot: U256) -> Result<B256, ClientError>;

    /// Suggested legacy gas price.
    async fn gas_price(&self) -> Result<u128, ClientError>;

    /// Suggested priority fee.
    async fn max_priority_fee(&self) -> Result<u128, ClientError>;

    /// Submits a signed transaction and returns its hash.
    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<B256, ClientError>;

    /// Receipt of a transaction, `None` while it is not included.
    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ClientError>;
}

/// [`ChainClient`] backed by an alloy [`Provider`].
pub struct RpcClient<P> {
    provider: P,
}

impl<P> RpcClient<P> {
    /// Wraps a provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P> fmt::Debug for RpcClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl<P: Provider + 'static> ChainClient for RpcClient<P> {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn nonce(&self, address: Address) -> Result<u64, ClientError> {
        Ok(self.provider.get_transaction_count(address).pending().await?)
    }

    async fn balance(&self, address: Address) -> Result<U256, ClientError> {
        Ok(self.provider.get_balance(address).await?)
    }

    async fn storage_at(&self, address: Address, slot: U256) -> Result<B256, ClientError> {
        let value = self.provider.get_storage_at(address, slot).await?;
        Ok(B256::from(value.to_be_bytes::<32>()))
    }

    async fn gas_price(&self) -> Result<u128, ClientError> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn max_priority_fee(&self) -> Result<u128, ClientError> {
        Ok(self.provider.get_max_priority_fee_per_gas().await?)
    }

    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<B256, ClientError> {
        let encoded = tx.encoded_2718();
        let pending = self.provider.send_raw_transaction(&encoded).await?;
        Ok(*pending.tx_hash())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ClientError> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|receipt| TxReceipt {
            tx_hash: receipt.transaction_hash(),
            success: receipt.status(),
            gas_used: receipt.gas_used(),
            effective_gas_price: receipt.effective_gas_price(),
            block_number: receipt.block_number(),
        }))
    }
}

/// Parsed `group(a,b)name(x)url` host spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSpec {
    /// RPC endpoint.
    pub url: String,
    /// Display name, the url when not given.
    pub name: String,
    /// Groups the client belongs to.
    pub groups: Vec<String>,
}

impl HostSpec {
    /// Parses a host spec. Prefixes may appear in any order before the url.
    pub fn parse(spec: &str) -> Result<Self, ClientError> {
        let mut rest = spec.trim();
        let mut name = None;
        let mut groups = Vec::new();
        loop {
            if let Some(body) = rest.strip_prefix("group(") {
                let (list, tail) = body
                    .split_once(')')
                    .ok_or_else(|| ClientError::InvalidHost(spec.to_string()))?;
                groups.extend(
                    list.split(',')
                        .map(str::trim)
                        .filter(|group| !group.is_empty())
                        .map(str::to_string),
                );
                rest = tail;
            } else if let Some(body) = rest.strip_prefix("name(") {
                let (value, tail) = body
                    .split_once(')')
                    .ok_or_else(|| ClientError::InvalidHost(spec.to_string()))?;
                name = Some(value.trim().to_string());
                rest = tail;
            } else {
                break;
            }
        }
        if rest.is_empty() {
            return Err(ClientError::InvalidHost(spec.to_string()));
        }
        if groups.is_empty() {
            groups.push(DEFAULT_GROUP.to_string());
        }
        Ok(Self {
            url: rest.to_string(),
            name: name.unwrap_or_else(|| rest.to_string()),
            groups,
        })
    }
}

/// Fee suggestion of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuggestedFee {
    /// Gas price, used as fee cap.
    pub gas_price: u128,
    /// Priority fee.
    pub tip: u128,
}

/// Named execution client with group membership and a cached gas price.
#[derive(Debug)]
pub struct Client {
    name: String,
    groups: Vec<String>,
    chain: Arc<dyn ChainClient>,
    gas_price: Mutex<Option<(Instant, u128)>>,
}

impl Client {
    /// Wraps a chain client.
    pub fn new(name: impl Into<String>, groups: Vec<String>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            name: name.into(),
            groups,
            chain,
            gas_price: Mutex::new(None),
        }
    }

    /// Connects to the endpoint of a host spec over HTTP.
    pub fn connect(spec: &HostSpec) -> Result<Self, ClientError> {
        let url = reqwest::Url::parse(&spec.url)
            .map_err(|_| ClientError::InvalidHost(spec.url.clone()))?;
        let provider = ProviderBuilder::new().connect_http(url);
        Ok(Self::new(
            spec.name.clone(),
            spec.groups.clone(),
            Arc::new(RpcClient::new(provider)),
        ))
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Groups of the client.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Whether the client is selected by `group`. `""` selects the default group and `*`
    /// selects every client.
    pub fn in_group(&self, group: &str) -> bool {
        let group = if group.is_empty() { DEFAULT_GROUP } else { group };
        group == ANY_GROUP || self.groups.iter().any(|g| g == group)
    }

    /// Underlying chain access.
    pub fn chain(&self) -> &dyn ChainClient {
        self.chain.as_ref()
    }

    /// Suggested gas price and tip. The gas price is cached for
    /// [`GAS_PRICE_CACHE_TTL`], a failing tip query falls back to [`FALLBACK_TIP`].
    pub async fn suggested_fee(&self) -> Result<SuggestedFee, ClientError> {
        let cached = *self.gas_price.lock();
        let gas_price = match cached {
            Some((at, price)) if at.elapsed() < GAS_PRICE_CACHE_TTL => price,
            _ => {
                let price = self.chain.gas_price().await?;
                *self.gas_price.lock() = Some((Instant::now(), price));
                price
            }
        };
        let tip = match self.chain.max_priority_fee().await {
            Ok(tip) => tip,
            Err(error) => {
                debug!(client = %self.name, %error, "priority fee unavailable, using fallback");
                FALLBACK_TIP
            }
        };
        Ok(SuggestedFee { gas_price, tip })
    }
}

/// How a client is picked from the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientSelection {
    /// Rotate through matching clients.
    #[default]
    RoundRobin,
    /// Pick a random matching client.
    Random,
    /// Always the first matching client.
    First,
}

/// Set of clients to spread load over.
#[derive(Debug, Default)]
pub struct ClientPool {
    clients: Vec<Arc<Client>>,
    next: AtomicUsize,
}

impl ClientPool {
    /// Creates a pool from connected clients.
    pub fn new(clients: Vec<Arc<Client>>) -> Self {
        Self {
            clients,
            next: AtomicUsize::new(0),
        }
    }

    /// Connects one client per host spec.
    pub fn connect(hosts: &[String]) -> Result<Self, ClientError> {
        let clients = hosts
            .iter()
            .map(|host| HostSpec::parse(host).and_then(|spec| Client::connect(&spec)))
            .map(|client| client.map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(clients))
    }

    /// All clients.
    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    /// Picks a client of `group`.
    pub fn get(&self, selection: ClientSelection, group: &str) -> Option<Arc<Client>> {
        let candidates: Vec<_> = self
            .clients
            .iter()
            .filter(|client| client.in_group(group))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = match selection {
            ClientSelection::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed),
            ClientSelection::Random => rand::rng().random_range(0..candidates.len()),
            ClientSelection::First => 0,
        };
        Some(Arc::clone(candidates[index % candidates.len()]))
    }
}
