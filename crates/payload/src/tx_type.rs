use std::fmt;
use thiserror::Error;

/// Transaction shapes a payload can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxType {
    /// Legacy transaction.
    Legacy = 0,
    /// EIP-2930 access list transaction.
    AccessList = 1,
    /// EIP-1559 dynamic fee transaction.
    DynamicFee = 2,
    /// EIP-4844 blob transaction.
    Blob = 3,
    /// EIP-7702 set code transaction.
    SetCode = 4,
}

/// Transaction type outside of the supported range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unsupported transaction type: {0}")]
pub struct UnsupportedTxType(pub u64);

impl TryFrom<u64> for TxType {
    type Error = UnsupportedTxType;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Legacy,
            1 => Self::AccessList,
            2 => Self::DynamicFee,
            3 => Self::Blob,
            4 => Self::SetCode,
            other => return Err(UnsupportedTxType(other)),
        })
    }
}

impl From<TxType> for u64 {
    fn from(value: TxType) -> Self {
        value as u64
    }
}

impl TxType {
    /// Whether the transaction carries an access list.
    pub const fn has_access_list(&self) -> bool {
        !matches!(self, Self::Legacy)
    }

    /// Whether the transaction prices gas through `gasPrice` rather than fee caps.
    pub const fn is_legacy_priced(&self) -> bool {
        matches!(self, Self::Legacy | Self::AccessList)
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Legacy => "legacy",
            Self::AccessList => "access-list",
            Self::DynamicFee => "dynamic-fee",
            Self::Blob => "blob",
            Self::SetCode => "set-code",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types() {
        for raw in 0..=4u64 {
            let ty = TxType::try_from(raw).unwrap();
            assert_eq!(u64::from(ty), raw);
        }
        assert_eq!(TxType::try_from(5), Err(UnsupportedTxType(5)));
        assert_eq!(
            UnsupportedTxType(7).to_string(),
            "unsupported transaction type: 7"
        );
    }
}
