//! Hex helpers shared by the converter and the replay engine.
//!
//! Payload values are hand editable strings, so an empty string or a bare `0x` are
//! accepted wherever they have an obvious meaning (zero, empty bytes).

use crate::HexError;
use alloy_primitives::{hex, Address, Bytes, B256, U256};

fn strip_prefix(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Decodes hex, left padding odd-length input with a zero nibble.
fn decode_padded(s: &str) -> Result<Vec<u8>, HexError> {
    let digits = strip_prefix(s);
    let result = if digits.len() % 2 == 1 {
        hex::decode(format!("0{digits}"))
    } else {
        hex::decode(digits)
    };
    result.map_err(|e| HexError::new(s, e))
}

/// Right-aligns `bytes` into `N` bytes, keeping the trailing bytes when the input is longer.
fn right_align<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    if bytes.len() >= N {
        out.copy_from_slice(&bytes[bytes.len() - N..]);
    } else {
        out[N - bytes.len()..].copy_from_slice(bytes);
    }
    out
}

/// Parses a hex quantity. Empty input and `0x` are zero.
pub fn parse_u256(s: &str) -> Result<U256, HexError> {
    let digits = strip_prefix(s);
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).map_err(|e| HexError::new(s, e))
}

/// Parses hex calldata. Empty input and `0x` are empty bytes; odd length is an error.
pub fn parse_bytes(s: &str) -> Result<Bytes, HexError> {
    let digits = strip_prefix(s);
    if digits.is_empty() {
        return Ok(Bytes::new());
    }
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| HexError::new(s, e))
}

/// Parses an address, left padding short input and keeping the trailing 20 bytes of long
/// input.
pub fn parse_address(s: &str) -> Result<Address, HexError> {
    if strip_prefix(s).is_empty() {
        return Err(HexError::new(s, "empty address"));
    }
    decode_padded(s).map(|bytes| Address::from(right_align::<20>(&bytes)))
}

/// Parses a 32-byte word with the same alignment rules as [`parse_address`].
pub fn parse_b256(s: &str) -> Result<B256, HexError> {
    decode_padded(s).map(|bytes| B256::from(right_align::<32>(&bytes)))
}

/// Parses a signature component, treating anything unparsable as zero.
pub fn parse_u256_lenient(s: &str) -> U256 {
    decode_padded(s)
        .ok()
        .filter(|bytes| bytes.len() <= 32)
        .map(|bytes| U256::from_be_slice(&bytes))
        .unwrap_or_default()
}

/// Parses a signature parity byte, treating anything unparsable as zero.
pub fn parse_u8_lenient(s: &str) -> u8 {
    decode_padded(s)
        .ok()
        .and_then(|bytes| bytes.last().copied())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};
    use rstest::rstest;

    #[rstest]
    #[case("", 0)]
    #[case("0x", 0)]
    #[case("0x0", 0)]
    #[case("0x00", 0)]
    #[case("0x0de0b6b3a7640000", 1_000_000_000_000_000_000)]
    #[case("ff", 255)]
    fn quantities(#[case] input: &str, #[case] expected: u128) {
        assert_eq!(parse_u256(input).unwrap(), U256::from(expected));
    }

    #[test]
    fn bytes() {
        assert!(parse_bytes("0x").unwrap().is_empty());
        assert_eq!(parse_bytes("0x6001").unwrap().as_ref(), &[0x60, 0x01]);
        assert!(parse_bytes("0x600").is_err());
        assert!(parse_bytes("0xzz").is_err());
    }

    #[test]
    fn address_alignment() {
        assert_eq!(
            parse_address("0x1").unwrap(),
            address!("0x0000000000000000000000000000000000000001")
        );
        assert_eq!(
            parse_address("0x000000000000000000000000a94f5374fce5edbc8e2a8697c15331677e6ebf0b")
                .unwrap(),
            address!("0xa94f5374fce5edbc8e2a8697c15331677e6ebf0b")
        );
        assert!(parse_address("").is_err());
    }

    #[test]
    fn word_alignment() {
        assert_eq!(
            parse_b256("0x01").unwrap(),
            b256!("0x0000000000000000000000000000000000000000000000000000000000000001")
        );
    }

    #[test]
    fn lenient_signature_parts() {
        assert_eq!(parse_u8_lenient("0x1"), 1);
        assert_eq!(parse_u8_lenient("garbage"), 0);
        assert_eq!(parse_u256_lenient("0xabc"), U256::from(0xabc));
        assert_eq!(parse_u256_lenient(""), U256::ZERO);
    }
}
