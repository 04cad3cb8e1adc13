use crate::{AddressMap, FeeCaps, Wallet, WalletError};
use alloy_consensus::{
    TxEip1559, TxEip2930, TxEip4844, TxEip4844Variant, TxEip4844WithSidecar, TxEip7702,
    TxEnvelope, TxLegacy,
};
use alloy_eips::{
    eip2930::{AccessList, AccessListItem},
    eip4844::{Blob, BlobTransactionSidecar},
    eip7702::{Authorization, SignedAuthorization},
};
use alloy_primitives::{Address, TxKind, U256};
use payload::{
    parse_address, parse_b256, parse_bytes, parse_u256, parse_u256_lenient, parse_u8_lenient,
    AuthorizationEntry, HexError, Origin, PlaceholderError, Tx, TxType, UnsupportedTxType,
};
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;

/// Gas limit of templates that leave `gas` at zero.
pub const DEFAULT_GAS_LIMIT: u64 = 1_000_000;

/// Blob fee cap as a multiple of the execution fee cap.
pub const BLOB_FEE_CAP_MULTIPLIER: u128 = 1_000_000_000;

/// Errors turning a template into a signed transaction.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// Placeholder could not be bound.
    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),
    /// Field holds malformed hex.
    #[error("{field}: {source}")]
    Hex {
        /// Template field.
        field: &'static str,
        /// Parse error.
        #[source]
        source: HexError,
    },
    /// Type outside 0..=4.
    #[error(transparent)]
    UnsupportedType(#[from] UnsupportedTxType),
    /// Blob and set code transactions cannot create contracts.
    #[error("{0} transaction requires a recipient")]
    MissingRecipient(TxType),
    /// Authorization names a sender that was not acquired.
    #[error("authorization signer {0} is not an acquired sender")]
    UnknownSigner(String),
    /// KZG commitment computation failed.
    #[error("failed to build blob sidecar: {0}")]
    Blob(String),
    /// Signing failed.
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

fn hex_field<T>(field: &'static str, result: Result<T, HexError>) -> Result<T, MaterializeError> {
    result.map_err(|source| MaterializeError::Hex { field, source })
}

/// Builds signed transactions for one execution.
#[derive(Debug)]
pub struct Materializer<'a> {
    addresses: &'a AddressMap,
    senders: &'a [Arc<Wallet>],
    fees: FeeCaps,
}

impl<'a> Materializer<'a> {
    /// Creates a materializer binding placeholders through `addresses`, signing fresh
    /// authorizations with `senders` and pricing with `fees`.
    pub fn new(addresses: &'a AddressMap, senders: &'a [Arc<Wallet>], fees: FeeCaps) -> Self {
        Self {
            addresses,
            senders,
            fees,
        }
    }

    /// Fee caps transactions are priced with.
    pub fn fees(&self) -> FeeCaps {
        self.fees
    }

    fn address(&self, field: &'static str, text: &str) -> Result<Address, MaterializeError> {
        hex_field(field, parse_address(&self.addresses.substitute(text)?))
    }

    /// Builds and signs `tx` for `wallet`. The wallet nonce is only consumed once every
    /// field resolved.
    pub fn build(&self, wallet: &Wallet, tx: &Tx) -> Result<TxEnvelope, MaterializeError> {
        let kind = tx.kind()?;
        let input = hex_field("data", parse_bytes(&self.addresses.substitute(&tx.data)?))?;
        let to = if tx.is_create() {
            TxKind::Create
        } else {
            TxKind::Call(self.address("to", &tx.to)?)
        };
        let value = hex_field("value", parse_u256(&tx.value))?;
        let gas_limit = if tx.gas == 0 { DEFAULT_GAS_LIMIT } else { tx.gas };
        let access_list = if kind.has_access_list() {
            self.access_list(tx)?
        } else {
            AccessList::default()
        };
        let FeeCaps {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } = self.fees;
        let chain_id = wallet.chain_id();

        let envelope = match kind {
            TxType::Legacy => {
                let tx = TxLegacy {
                    chain_id: Some(chain_id),
                    nonce: wallet.reserve_nonce(),
                    gas_price: max_fee_per_gas,
                    gas_limit,
                    to,
                    value,
                    input,
                };
                TxEnvelope::Legacy(wallet.sign_transaction(tx)?)
            }
            TxType::AccessList => {
                let tx = TxEip2930 {
                    chain_id,
                    nonce: wallet.reserve_nonce(),
                    gas_price: max_fee_per_gas,
                    gas_limit,
                    to,
                    value,
                    access_list,
                    input,
                };
                TxEnvelope::Eip2930(wallet.sign_transaction(tx)?)
            }
            TxType::DynamicFee => {
                let tx = TxEip1559 {
                    chain_id,
                    nonce: wallet.reserve_nonce(),
                    gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    to,
                    value,
                    access_list,
                    input,
                };
                TxEnvelope::Eip1559(wallet.sign_transaction(tx)?)
            }
            TxType::Blob => {
                let TxKind::Call(to) = to else {
                    return Err(MaterializeError::MissingRecipient(kind));
                };
                let sidecar = random_sidecar(tx.blob_count)?;
                let tx = TxEip4844 {
                    chain_id,
                    nonce: wallet.reserve_nonce(),
                    gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    to,
                    value,
                    access_list,
                    blob_versioned_hashes: sidecar.versioned_hashes().collect(),
                    max_fee_per_blob_gas: max_fee_per_gas.saturating_mul(BLOB_FEE_CAP_MULTIPLIER),
                    input,
                };
                let tx = TxEip4844Variant::TxEip4844WithSidecar(
                    TxEip4844WithSidecar::from_tx_and_sidecar(tx, sidecar),
                );
                TxEnvelope::Eip4844(wallet.sign_transaction(tx)?)
            }
            TxType::SetCode => {
                let TxKind::Call(to) = to else {
                    return Err(MaterializeError::MissingRecipient(kind));
                };
                let authorization_list = tx
                    .authorization_list
                    .iter()
                    .map(|entry| self.authorization(wallet, entry))
                    .collect::<Result<Vec<_>, _>>()?;
                let tx = TxEip7702 {
                    chain_id,
                    nonce: wallet.reserve_nonce(),
                    gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    to,
                    value,
                    access_list,
                    authorization_list,
                    input,
                };
                TxEnvelope::Eip7702(wallet.sign_transaction(tx)?)
            }
        };
        Ok(envelope)
    }

    fn access_list(&self, tx: &Tx) -> Result<AccessList, MaterializeError> {
        tx.access_list
            .iter()
            .map(|entry| {
                Ok(AccessListItem {
                    address: self.address("accessList.address", &entry.address)?,
                    storage_keys: entry
                        .storage_keys
                        .iter()
                        .map(|key| hex_field("accessList.storageKeys", parse_b256(key)))
                        .collect::<Result<_, _>>()?,
                })
            })
            .collect::<Result<Vec<_>, MaterializeError>>()
            .map(AccessList)
    }

    /// Signs the authorization with the referenced sender, or replays the fixture
    /// signature when the signer is not one of ours.
    ///
    /// Fresh signatures use the authority's live nonce, one past the transaction nonce
    /// when the authority also sends the transaction. A non-zero chain id is rebound to
    /// the live chain.
    fn authorization(
        &self,
        wallet: &Wallet,
        entry: &AuthorizationEntry,
    ) -> Result<SignedAuthorization, MaterializeError> {
        let address = self.address("authorizationList.address", &entry.address)?;
        if let Ok(Origin::Sender(index)) = entry.signer.parse::<Origin>() {
            let signer = index
                .checked_sub(1)
                .and_then(|i| self.senders.get(i))
                .ok_or_else(|| MaterializeError::UnknownSigner(entry.signer.clone()))?;
            let nonce = if signer.address() == wallet.address() {
                signer.nonce() + 1
            } else {
                signer.nonce()
            };
            let chain_id = if entry.chain_id == 0 {
                U256::ZERO
            } else {
                U256::from(signer.chain_id())
            };
            return Ok(signer.sign_authorization(Authorization {
                chain_id,
                address,
                nonce,
            })?);
        }

        let mut y_parity = parse_u8_lenient(&entry.v);
        if y_parity >= 27 {
            y_parity -= 27;
        }
        Ok(SignedAuthorization::new_unchecked(
            Authorization {
                chain_id: U256::from(entry.chain_id),
                address,
                nonce: entry.nonce,
            },
            y_parity,
            parse_u256_lenient(&entry.r),
            parse_u256_lenient(&entry.s),
        ))
    }
}

/// Sidecar with `count` random blobs. The first byte of every field element is zeroed so
/// each element stays below the BLS modulus.
fn random_sidecar(count: usize) -> Result<BlobTransactionSidecar, MaterializeError> {
    let mut rng = rand::rng();
    let mut blobs = vec![Blob::ZERO; count];
    for blob in &mut blobs {
        rng.fill_bytes(blob.as_mut_slice());
        for element in blob.chunks_mut(32) {
            element[0] = 0;
        }
    }
    BlobTransactionSidecar::try_from_blobs(blobs).map_err(|e| MaterializeError::Blob(e.to_string()))
}
