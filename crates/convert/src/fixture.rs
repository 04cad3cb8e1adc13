//! Blockchain test fixture types.
//!
//! Only the fields needed for conversion are modelled, unknown fields are ignored so that
//! fixtures from newer EEST releases keep deserializing.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Fixture file, test name to test case.
#[derive(Debug, PartialEq, Eq, Deserialize)]
pub struct BlockchainFixture(pub BTreeMap<String, FixtureTestCase>);

/// Individual blockchain test case.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureTestCase {
    /// Genesis block header
    #[serde(default)]
    pub genesis_block_header: FixtureHeader,
    /// Pre-state accounts
    #[serde(default)]
    pub pre: BTreeMap<Address, FixtureAccount>,
    /// Post-state accounts
    #[serde(default)]
    pub post_state: BTreeMap<Address, FixtureAccount>,
    /// Blocks of the test
    #[serde(default)]
    pub blocks: Vec<FixtureBlock>,
}

/// Block header fields used by the converter.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureHeader {
    /// Base fee per gas (EIP-1559)
    pub base_fee_per_gas: Option<U256>,
}

impl FixtureHeader {
    /// Base fee as `u64`, zero when absent.
    pub fn base_fee(&self) -> u64 {
        self.base_fee_per_gas.unwrap_or_default().saturating_to()
    }
}

/// Block of a blockchain test.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureBlock {
    /// Block header
    #[serde(default)]
    pub block_header: FixtureHeader,
    /// Transactions in block order
    #[serde(default)]
    pub transactions: Vec<FixtureTransaction>,
}

/// Account state.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct FixtureAccount {
    /// Balance
    #[serde(default)]
    pub balance: U256,
    /// Code
    #[serde(default)]
    pub code: Bytes,
    /// Nonce
    #[serde(default)]
    pub nonce: U256,
    /// Storage, kept as hex text so values can be rewritten in place
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
}

/// Signed transaction of a fixture block.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureTransaction {
    /// Transaction type
    #[serde(rename = "type")]
    pub transaction_type: Option<U256>,
    /// Transaction sender
    pub sender: Option<Address>,
    /// Target address, `None` for contract creation
    #[serde(default, deserialize_with = "deserialize_maybe_empty")]
    pub to: Option<Address>,
    /// Transaction data/input
    #[serde(default)]
    pub data: Bytes,
    /// Gas limit
    #[serde(default)]
    pub gas_limit: U256,
    /// Gas price (legacy transactions)
    pub gas_price: Option<U256>,
    /// Maximum fee per gas (EIP-1559)
    pub max_fee_per_gas: Option<U256>,
    /// Maximum priority fee per gas (EIP-1559)
    pub max_priority_fee_per_gas: Option<U256>,
    /// Ether value to transfer
    #[serde(default)]
    pub value: U256,
    /// Access list (EIP-2930)
    #[serde(default)]
    pub access_list: Vec<FixtureAccessListItem>,
    /// Blob versioned hashes (EIP-4844)
    #[serde(default)]
    pub blob_versioned_hashes: Vec<B256>,
    /// Authorization list (EIP-7702)
    #[serde(default)]
    pub authorization_list: Vec<FixtureAuthorization>,
}

impl FixtureTransaction {
    /// Transaction type, legacy when absent.
    pub fn tx_type(&self) -> u64 {
        self.transaction_type.unwrap_or_default().saturating_to()
    }
}

/// Access list item
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureAccessListItem {
    /// Account address
    pub address: Address,
    /// Storage keys
    #[serde(default)]
    pub storage_keys: Vec<B256>,
}

/// EIP-7702 authorization as found in fixtures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureAuthorization {
    /// Chain id
    #[serde(default)]
    pub chain_id: U256,
    /// Delegation target
    pub address: Address,
    /// Authority nonce
    #[serde(default)]
    pub nonce: U256,
    /// Signature v
    pub v: Option<U256>,
    /// Signature y parity, used when `v` is missing
    pub y_parity: Option<U256>,
    /// Signature r
    #[serde(default)]
    pub r: U256,
    /// Signature s
    #[serde(default)]
    pub s: U256,
    /// Recovered signer
    pub signer: Option<Address>,
}

impl FixtureAuthorization {
    /// Signature parity, taken from `v` or `yParity`.
    pub fn parity(&self) -> U256 {
        self.v.or(self.y_parity).unwrap_or_default()
    }
}

/// Deserializes an address that fixtures encode as `""` when absent.
pub fn deserialize_maybe_empty<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(deserializer)?;
    if string.is_empty() {
        Ok(None)
    } else {
        string.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
