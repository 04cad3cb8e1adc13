use crate::{sender_references, Origin, PayloadError, PlaceholderError, TxType, UnsupportedTxType};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

/// Top level payload document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    /// Payloads in replay order.
    #[serde(default)]
    pub payloads: Vec<Payload>,
}

impl PayloadFile {
    /// Parses a YAML payload document.
    pub fn from_yaml(content: &str) -> Result<Self, PayloadError> {
        serde_yaml::from_str(content).map_err(Into::into)
    }

    /// Serializes the document to YAML.
    pub fn to_yaml(&self) -> Result<String, PayloadError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Reads a YAML payload document from disk.
    pub fn read(path: &Path) -> Result<Self, PayloadError> {
        let content = fs::read_to_string(path).map_err(|source| PayloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Writes the document to disk as YAML.
    pub fn write(&self, path: &Path) -> Result<(), PayloadError> {
        fs::write(path, self.to_yaml()?).map_err(|source| PayloadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One replayable test case.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Test name, `<fixture path>/<test>`.
    pub name: String,
    /// Required starting balance per sender, `sender[N]` to hex amount.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prerequisites: BTreeMap<String, String>,
    /// Transactions in submission order.
    #[serde(default)]
    pub txs: Vec<Tx>,
    /// Expected state per target, `contract[N]` or `sender[N]`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub postcheck: BTreeMap<String, PostCheck>,
}

impl Payload {
    /// Number of distinct senders referenced by transactions and prerequisites.
    pub fn sender_count(&self) -> usize {
        self.txs
            .iter()
            .flat_map(|tx| sender_references(&tx.from))
            .chain(self.prerequisites.keys().flat_map(|key| sender_references(key)))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Number of contracts the deployer creates.
    pub fn contract_count(&self) -> usize {
        self.txs.iter().filter(|tx| tx.is_deployment()).count()
    }

    /// Number of wallets an execution needs, deployer included.
    pub fn wallet_count(&self) -> usize {
        self.sender_count() + 1
    }
}

/// Transaction template.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    /// `deployer` or `sender[N]`.
    pub from: String,
    /// Transaction type, 0 to 4.
    #[serde(rename = "type", default)]
    pub tx_type: u64,
    /// Recipient. Empty for contract creation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    /// Hex calldata, may embed placeholders.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// Gas limit.
    #[serde(default)]
    pub gas: u64,
    /// Fixture gas price, used for fee reconciliation only.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub gas_price: u64,
    /// Fixture fee cap.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_fee_per_gas: u64,
    /// Fixture tip cap.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_priority_fee_per_gas: u64,
    /// Hex value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// EIP-2930 access list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_list: Vec<AccessListEntry>,
    /// Number of random blobs attached to a blob transaction.
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub blob_count: usize,
    /// EIP-7702 authorizations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_list: Vec<AuthorizationEntry>,
    /// Base fee of the fixture block the transaction was taken from.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fixture_base_fee: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

impl Tx {
    /// Parses the `from` field.
    pub fn origin(&self) -> Result<Origin, PlaceholderError> {
        self.from.parse()
    }

    /// Resolves the transaction type.
    pub fn kind(&self) -> Result<TxType, UnsupportedTxType> {
        TxType::try_from(self.tx_type)
    }

    /// Whether the transaction creates a contract.
    pub fn is_create(&self) -> bool {
        self.to.is_empty()
    }

    /// Whether the transaction is a deployer contract creation.
    pub fn is_deployment(&self) -> bool {
        self.from == crate::DEPLOYER && self.is_create()
    }
}

/// Access list entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessListEntry {
    /// Address or placeholder.
    pub address: String,
    /// Hex storage keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_keys: Vec<String>,
}

/// EIP-7702 authorization entry.
///
/// When `signer` is `sender[N]` the authorization is signed by that sender during replay,
/// otherwise the fixture signature in `v`, `r` and `s` is reused.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationEntry {
    /// Chain id the authorization is valid on.
    #[serde(default)]
    pub chain_id: u64,
    /// Delegation target, address or placeholder.
    pub address: String,
    /// Authority nonce.
    #[serde(default)]
    pub nonce: u64,
    /// `sender[N]` or the original signer address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signer: String,
    /// Original signature parity.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v: String,
    /// Original signature r.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r: String,
    /// Original signature s.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub s: String,
}

/// Expected state of one target after execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCheck {
    /// Expected hex balance.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub balance: String,
    /// Expected storage, hex slot to hex value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
payloads:
  - name: simple-transfer
    prerequisites:
      sender[1]: "0x0de0b6b3a7640000"
    txs:
      - from: deployer
        type: 2
        data: "0x600b380380600b5f395ff3600160005500"
        gas: 200000
      - from: sender[1]
        type: 2
        to: $contract[1]
        data: "0x$contract[1]"
        gas: 50000
        maxFeePerGas: 10
        maxPriorityFeePerGas: 1
      - from: sender[2]
        type: 4
        to: $sender[2]
        gas: 60000
        authorizationList:
          - chainId: 1
            address: $contract[1]
            nonce: 0
            signer: sender[2]
    postcheck:
      contract[1]:
        storage:
          "0x0": "0x01"
      sender[1]:
        balance: "0x0de0b6b3a763ffff"
"#;

    #[test]
    fn parse_document() {
        let file = PayloadFile::from_yaml(DOCUMENT).unwrap();
        assert_eq!(file.payloads.len(), 1);

        let payload = &file.payloads[0];
        assert_eq!(payload.name, "simple-transfer");
        assert_eq!(payload.txs.len(), 3);
        assert_eq!(payload.txs[1].to, "$contract[1]");
        assert_eq!(payload.txs[1].max_fee_per_gas, 10);
        assert_eq!(payload.txs[2].kind(), Ok(TxType::SetCode));
        assert_eq!(payload.txs[2].authorization_list[0].signer, "sender[2]");
        assert_eq!(payload.postcheck["contract[1]"].storage["0x0"], "0x01");
    }

    #[test]
    fn derived_counts() {
        let payload = &PayloadFile::from_yaml(DOCUMENT).unwrap().payloads[0];
        assert_eq!(payload.sender_count(), 2);
        assert_eq!(payload.contract_count(), 1);
        assert_eq!(payload.wallet_count(), 3);
    }

    #[test]
    fn prerequisite_only_senders_are_counted() {
        let mut payload = Payload::default();
        payload
            .prerequisites
            .insert("sender[3]".into(), "0x1".into());
        payload.txs.push(Tx {
            from: "sender[3]".into(),
            ..Default::default()
        });
        payload
            .prerequisites
            .insert("sender[4]".into(), "0x1".into());
        assert_eq!(payload.sender_count(), 2);
    }

    #[test]
    fn deployer_calls_are_not_deployments() {
        let payload = Payload {
            txs: vec![
                Tx {
                    from: "deployer".into(),
                    ..Default::default()
                },
                Tx {
                    from: "deployer".into(),
                    to: "$contract[1]".into(),
                    ..Default::default()
                },
                Tx {
                    from: "sender[1]".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(payload.contract_count(), 1);
    }

    #[test]
    fn yaml_round_trip_keeps_optional_fields_out() {
        let file = PayloadFile::from_yaml(DOCUMENT).unwrap();
        let yaml = file.to_yaml().unwrap();
        assert!(!yaml.contains("blobCount"));
        assert_eq!(PayloadFile::from_yaml(&yaml).unwrap(), file);
    }

    #[test]
    fn read_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payloads.yaml");

        let file = PayloadFile::from_yaml(DOCUMENT).unwrap();
        file.write(&path).unwrap();
        assert_eq!(PayloadFile::read(&path).unwrap(), file);

        let missing = PayloadFile::read(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, PayloadError::Io { .. }));
    }
}
