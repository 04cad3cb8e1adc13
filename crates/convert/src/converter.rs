use crate::{
    fixture::{BlockchainFixture, FixtureAccount, FixtureTestCase, FixtureTransaction},
    AddressMapper, ConvertError,
};
use alloy_primitives::{address, hex, Address, U256};
use payload::{
    AccessListEntry, AuthorizationEntry, Payload, PayloadFile, PostCheck, Tx, TxType, DEPLOYER,
};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// System contracts present in every fixture pre-state. Networks already have them, so
/// they are neither deployed nor checked.
pub const SYSTEM_CONTRACTS: [Address; 5] = [
    // deposit contract
    address!("0x00000000219ab540356cbb839cbe05303d7705fa"),
    // EIP-7002 withdrawal requests
    address!("0x00000961ef480eb55e80d19ad83579a64c007002"),
    // EIP-7251 consolidation requests
    address!("0x0000bbddc7ce488642fb579f8b00f3a590007251"),
    // EIP-2935 history storage
    address!("0x0000f90827f1c53a10cb7a02335b175320002935"),
    // EIP-4788 beacon roots
    address!("0x000f3df6d732807ef1319fb7b8bb8522d0beac02"),
];

/// Init code returning the runtime code appended to it.
pub const INIT_CODE_PREFIX: [u8; 11] = hex!("600b380380600b5f395ff3");

/// Fee cap of generated deployment transactions, 10 gwei.
pub const DEPLOYMENT_MAX_FEE_PER_GAS: u64 = 10_000_000_000;

/// Tip cap of generated deployment transactions, 1 gwei.
pub const DEPLOYMENT_MAX_PRIORITY_FEE_PER_GAS: u64 = 1_000_000_000;

/// Gas limit used when a fixture transaction has none.
pub const DEFAULT_TX_GAS: u64 = 21_000;

const MAX_DEPLOYMENT_GAS: u64 = 16_000_000;

/// Returns `true` for predeployed system contracts.
pub fn is_system_contract(address: &Address) -> bool {
    SYSTEM_CONTRACTS.contains(address)
}

/// Conversion settings.
#[derive(Clone, Debug, Default)]
pub struct ConvertOptions {
    /// Only convert tests whose payload name matches this regex.
    pub include: Option<String>,
    /// Skip tests whose payload name matches this regex.
    pub exclude: Option<String>,
    /// Log every converted payload.
    pub verbose: bool,
}

/// Converts fixture files into payloads.
#[derive(Debug)]
pub struct Converter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    verbose: bool,
}

fn compile(kind: &'static str, pattern: Option<&str>) -> Result<Option<Regex>, ConvertError> {
    pattern
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConvertError::InvalidPattern {
                kind,
                pattern: pattern.to_string(),
                source,
            })
        })
        .transpose()
}

/// Find all JSON fixture files in the given path, sorted.
///
/// If path is a file, returns it in a vector.
pub fn find_fixture_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<_> = WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.path().extension() == Some("json".as_ref()))
        .map(DirEntry::into_path)
        .collect();
    files.sort();
    files
}

impl Converter {
    /// Creates a converter, compiling the name filters.
    pub fn new(options: ConvertOptions) -> Result<Self, ConvertError> {
        Ok(Self {
            include: compile("include", options.include.as_deref())?,
            exclude: compile("exclude", options.exclude.as_deref())?,
            verbose: options.verbose,
        })
    }

    /// Whether a payload with this name passes the include and exclude filters.
    pub fn is_selected(&self, name: &str) -> bool {
        self.include.as_ref().is_none_or(|re| re.is_match(name))
            && !self.exclude.as_ref().is_some_and(|re| re.is_match(name))
    }

    /// Converts every fixture found under `root`.
    ///
    /// Files that fail to convert are logged and skipped.
    pub fn convert_directory(&self, root: &Path) -> Result<PayloadFile, ConvertError> {
        if !root.exists() {
            return Err(ConvertError::PathNotFound(root.to_path_buf()));
        }
        info!(path = %root.display(), "scanning for EEST fixtures");

        let files = find_fixture_files(root);
        let mut payloads = Vec::new();
        let mut failed = 0usize;
        for file in &files {
            match self.convert_file(root, file) {
                Ok(converted) => payloads.extend(converted),
                Err(error) => {
                    warn!(file = %file.display(), %error, "failed to convert fixture");
                    failed += 1;
                }
            }
        }

        info!(
            files = files.len(),
            failed,
            payloads = payloads.len(),
            "fixture conversion finished"
        );
        Ok(PayloadFile { payloads })
    }

    /// Converts one fixture file. Payload names are prefixed with the path of the file
    /// relative to `root`, without extension.
    pub fn convert_file(&self, root: &Path, path: &Path) -> Result<Vec<Payload>, ConvertError> {
        debug!(file = %path.display(), "processing fixture file");
        let content = fs::read_to_string(path).map_err(|source| ConvertError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let fixture: BlockchainFixture =
            serde_json::from_str(&content).map_err(|source| ConvertError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(self.convert_fixture(&fixture, &relative_name(root, path)))
    }

    /// Converts the selected test cases of a parsed fixture.
    pub fn convert_fixture(&self, fixture: &BlockchainFixture, prefix: &str) -> Vec<Payload> {
        let mut payloads = Vec::new();
        for (test_name, test_case) in &fixture.0 {
            let name = format!("{prefix}/{}", short_name(test_name));
            if !self.is_selected(&name) {
                continue;
            }
            let payload = convert_test_case(test_case, name);
            if self.verbose {
                info!(payload = %payload.name, txs = payload.txs.len(), "converted payload");
            }
            payloads.push(payload);
        }
        payloads
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    let relative = match path.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative,
        _ => path.file_name().map(Path::new).unwrap_or(path),
    };
    let name = relative.to_string_lossy().replace('\\', "/");
    name.strip_suffix(".json").map(str::to_string).unwrap_or(name)
}

/// Strips the pytest module path, `file.py::test_x[params]` becomes `test_x[params]`.
fn short_name(test_name: &str) -> &str {
    test_name
        .rsplit_once("::")
        .map(|(_, short)| short)
        .unwrap_or(test_name)
}

fn nonzero_hex(value: U256) -> String {
    if value.is_zero() {
        String::new()
    } else {
        format!("{value:#x}")
    }
}

/// Converts one fixture test case.
pub fn convert_test_case(test_case: &FixtureTestCase, name: String) -> Payload {
    let mut mapper = AddressMapper::new();
    let mut payload = Payload {
        name,
        ..Default::default()
    };

    let mut contracts: Vec<(Address, &FixtureAccount)> = Vec::new();
    let mut candidates: BTreeMap<Address, &FixtureAccount> = BTreeMap::new();
    for (address, account) in &test_case.pre {
        if is_system_contract(address) {
            continue;
        }
        if account.code.is_empty() {
            candidates.insert(*address, account);
        } else {
            contracts.push((*address, account));
        }
    }

    // Contracts are numbered before senders so that `$contract[N]` follows pre-state order.
    for (address, _) in &contracts {
        mapper.register_contract(*address);
    }

    for address in used_senders(test_case, &mapper, &candidates, &contracts) {
        let index = mapper.register_sender(address);
        let balance = candidates
            .get(&address)
            .map(|account| account.balance)
            .unwrap_or_default();
        if !balance.is_zero() {
            payload
                .prerequisites
                .insert(format!("sender[{index}]"), format!("{balance:#x}"));
        }
    }

    let genesis_base_fee = test_case.genesis_block_header.base_fee();
    for (address, account) in &contracts {
        let mut init_code = INIT_CODE_PREFIX.to_vec();
        init_code.extend_from_slice(&account.code);

        payload.txs.push(Tx {
            from: DEPLOYER.to_string(),
            tx_type: TxType::DynamicFee.into(),
            data: mapper.replace_addresses(&hex::encode_prefixed(&init_code)),
            gas: estimate_deployment_gas(&init_code),
            max_fee_per_gas: DEPLOYMENT_MAX_FEE_PER_GAS,
            max_priority_fee_per_gas: DEPLOYMENT_MAX_PRIORITY_FEE_PER_GAS,
            value: nonzero_hex(account.balance),
            fixture_base_fee: genesis_base_fee,
            ..Default::default()
        });
        debug!(%address, key = %mapper.yaml_key(address), "added deployment transaction");
    }

    for block in &test_case.blocks {
        let base_fee = block.block_header.base_fee();
        for tx in &block.transactions {
            payload.txs.push(convert_transaction(&mapper, tx, base_fee));
        }
    }

    for (address, account) in &test_case.post_state {
        if is_system_contract(address) {
            continue;
        }
        // Accounts created during execution have no placeholder and are not checked.
        let Some(placeholder) = mapper.placeholder(address) else {
            continue;
        };
        let check = PostCheck {
            balance: nonzero_hex(account.balance),
            storage: account
                .storage
                .iter()
                .map(|(slot, value)| (slot.clone(), mapper.replace_addresses(value)))
                .collect(),
        };
        if !check.balance.is_empty() || !check.storage.is_empty() {
            payload.postcheck.insert(placeholder.to_string(), check);
        }
    }

    payload
}

/// Plain pre-state accounts that take part in the test: transaction senders and
/// recipients, and accounts whose address appears in calldata or contract code.
fn used_senders(
    test_case: &FixtureTestCase,
    mapper: &AddressMapper,
    candidates: &BTreeMap<Address, &FixtureAccount>,
    contracts: &[(Address, &FixtureAccount)],
) -> BTreeSet<Address> {
    let needles: Vec<(Address, String)> = candidates
        .keys()
        .map(|address| (*address, hex::encode(address)))
        .collect();
    let mut used = BTreeSet::new();

    for tx in test_case.blocks.iter().flat_map(|block| &block.transactions) {
        if let Some(sender) = tx.sender {
            if !is_system_contract(&sender) && !mapper.is_contract(&sender) {
                used.insert(sender);
            }
        }
        if let Some(to) = tx.to {
            if candidates.contains_key(&to) {
                used.insert(to);
            }
        }
        let data = hex::encode(&tx.data);
        for (address, needle) in &needles {
            if data.contains(needle.as_str()) {
                used.insert(*address);
            }
        }
    }

    let bytecodes: Vec<String> = contracts
        .iter()
        .map(|(_, account)| hex::encode(&account.code))
        .collect();
    for (address, needle) in &needles {
        if bytecodes.iter().any(|code| code.contains(needle.as_str())) {
            used.insert(*address);
        }
    }
    used
}

/// Converts a signed fixture transaction into a template.
pub fn convert_transaction(mapper: &AddressMapper, tx: &FixtureTransaction, base_fee: u64) -> Tx {
    let tx_type = tx.tx_type();
    let gas = tx.gas_limit.saturating_to::<u64>();
    let mut converted = Tx {
        from: tx
            .sender
            .map(|sender| mapper.yaml_key(&sender))
            .unwrap_or_default(),
        tx_type,
        to: tx
            .to
            .map(|to| mapper.bytecode_key(&to))
            .unwrap_or_default(),
        data: if tx.data.is_empty() {
            String::new()
        } else {
            mapper.replace_addresses(&hex::encode_prefixed(&tx.data))
        },
        gas: if gas == 0 { DEFAULT_TX_GAS } else { gas },
        value: nonzero_hex(tx.value),
        fixture_base_fee: base_fee,
        ..Default::default()
    };

    let Ok(kind) = TxType::try_from(tx_type) else {
        return converted;
    };
    if kind.is_legacy_priced() {
        converted.gas_price = tx.gas_price.unwrap_or_default().saturating_to();
    } else {
        converted.max_fee_per_gas = tx.max_fee_per_gas.unwrap_or_default().saturating_to();
        converted.max_priority_fee_per_gas = tx
            .max_priority_fee_per_gas
            .unwrap_or_default()
            .saturating_to();
    }

    if kind.has_access_list() {
        converted.access_list = tx
            .access_list
            .iter()
            .map(|item| AccessListEntry {
                address: mapper.bytecode_key(&item.address),
                storage_keys: item.storage_keys.iter().map(hex::encode_prefixed).collect(),
            })
            .collect();
    }

    if kind == TxType::Blob {
        converted.blob_count = tx.blob_versioned_hashes.len();
    }

    if kind == TxType::SetCode {
        converted.authorization_list = tx
            .authorization_list
            .iter()
            .map(|auth| {
                let mut entry = AuthorizationEntry {
                    chain_id: auth.chain_id.saturating_to(),
                    address: mapper.bytecode_key(&auth.address),
                    nonce: auth.nonce.saturating_to(),
                    ..Default::default()
                };
                match auth.signer.and_then(|signer| mapper.sender_index(&signer)) {
                    // Signed again by the live sender wallet during replay.
                    Some(index) => entry.signer = format!("sender[{index}]"),
                    None => {
                        entry.signer = auth.signer.map(hex::encode_prefixed).unwrap_or_default();
                        entry.v = format!("{:#x}", auth.parity());
                        entry.r = format!("{:#x}", auth.r);
                        entry.s = format!("{:#x}", auth.s);
                    }
                }
                entry
            })
            .collect();
    }

    converted
}

/// Estimates the gas needed to deploy `init_code` built from [`INIT_CODE_PREFIX`] and the
/// runtime code: intrinsic and creation cost, calldata, code deposit, the copy routine and
/// memory expansion, plus a 20k buffer. Capped at 16M.
pub fn estimate_deployment_gas(init_code: &[u8]) -> u64 {
    if init_code.is_empty() {
        return 100_000;
    }
    let len = init_code.len() as u64;
    let zero = init_code.iter().filter(|byte| **byte == 0).count() as u64;
    let calldata = (len - zero) * 16 + zero * 4;
    let prefix = INIT_CODE_PREFIX.len() as u64;
    let runtime = if len > prefix { len - prefix } else { len };

    let gas = 21_000 + 32_000 + calldata + runtime * 200 + 100 + runtime.div_ceil(32) * 3 + 20_000;
    gas.min(MAX_DEPLOYMENT_GAS)
}
