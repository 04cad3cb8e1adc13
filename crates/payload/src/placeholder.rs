use crate::PlaceholderError;
use alloy_primitives::{hex, Address};
use regex::{Captures, Regex};
use std::{fmt, str::FromStr, sync::LazyLock};

/// Matches `$contract[N]` and `$sender[N]` tokens embedded in payload text.
static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(contract|sender)\[(\d+)\]").unwrap());

/// Matches a bare `sender[N]` reference, as used by `from` fields and map keys.
static SENDER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sender\[(\d+)\]").unwrap());

/// Name of the wallet that deploys the contracts of a payload.
pub const DEPLOYER: &str = "deployer";

/// Participant reference inside a payload. Indices are 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
    /// `sender[N]`, the N-th sender wallet acquired for the execution.
    Sender(usize),
    /// `contract[N]`, the contract created by the N-th deployer create transaction.
    Contract(usize),
}

impl Placeholder {
    /// Returns the token form (`$sender[N]`) used inside transaction fields.
    pub fn token(&self) -> String {
        format!("${self}")
    }

    /// Returns the 1-based index.
    pub const fn index(&self) -> usize {
        match self {
            Self::Sender(index) | Self::Contract(index) => *index,
        }
    }

    fn from_parts(kind: &str, index: &str, raw: &str) -> Result<Self, PlaceholderError> {
        let index = index
            .parse::<usize>()
            .ok()
            .filter(|index| *index > 0)
            .ok_or_else(|| PlaceholderError::Invalid(raw.to_string()))?;
        match kind {
            "sender" => Ok(Self::Sender(index)),
            "contract" => Ok(Self::Contract(index)),
            _ => Err(PlaceholderError::Invalid(raw.to_string())),
        }
    }

    fn from_captures(caps: &Captures<'_>) -> Result<Self, PlaceholderError> {
        Self::from_parts(&caps[1], &caps[2], &caps[0])
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender(index) => write!(f, "sender[{index}]"),
            Self::Contract(index) => write!(f, "contract[{index}]"),
        }
    }
}

impl FromStr for Placeholder {
    type Err = PlaceholderError;

    /// Parses `sender[N]` or `contract[N]`, with or without the leading `$`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix('$').unwrap_or(s);
        let (kind, rest) = body
            .split_once('[')
            .ok_or_else(|| PlaceholderError::Invalid(s.to_string()))?;
        let index = rest
            .strip_suffix(']')
            .ok_or_else(|| PlaceholderError::Invalid(s.to_string()))?;
        Self::from_parts(kind, index, s)
    }
}

/// Author of a payload transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// The deployer wallet.
    Deployer,
    /// A sender wallet, 1-based.
    Sender(usize),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployer => f.write_str(DEPLOYER),
            Self::Sender(index) => write!(f, "sender[{index}]"),
        }
    }
}

impl FromStr for Origin {
    type Err = PlaceholderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == DEPLOYER {
            return Ok(Self::Deployer);
        }
        match s.parse()? {
            Placeholder::Sender(index) => Ok(Self::Sender(index)),
            Placeholder::Contract(_) => Err(PlaceholderError::Invalid(s.to_string())),
        }
    }
}

/// Returns the sender indices referenced by `text` through bare `sender[N]` references.
pub fn sender_references(text: &str) -> impl Iterator<Item = usize> + '_ {
    SENDER_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse().ok())
}

/// Returns every placeholder token contained in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Result<Vec<Placeholder>, PlaceholderError> {
    TOKEN_REGEX
        .captures_iter(text)
        .map(|caps| Placeholder::from_captures(&caps))
        .collect()
}

/// Replaces every `$contract[N]` / `$sender[N]` token of `text` with the address `resolve`
/// returns for it, hex encoded in lowercase and without `0x`.
///
/// Fails on the first token `resolve` has no address for.
pub fn substitute_placeholders<F>(text: &str, mut resolve: F) -> Result<String, PlaceholderError>
where
    F: FnMut(Placeholder) -> Option<Address>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in TOKEN_REGEX.captures_iter(text) {
        let Some(token) = caps.get(0) else {
            continue;
        };
        let placeholder = Placeholder::from_captures(&caps)?;
        let address = resolve(placeholder).ok_or(PlaceholderError::Unresolved(placeholder))?;
        out.push_str(&text[last..token.start()]);
        out.push_str(&hex::encode(address));
        last = token.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
