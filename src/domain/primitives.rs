//! Domain primitives: TimeMs, Address, ConditionId, TokenId, TxHash, OutcomeIndex, Side.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    pub fn as_ms(&self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }
}

/// Position of one outcome within a condition's outcome list.
pub type OutcomeIndex = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("empty hex identifier")]
    Empty,
    #[error("non-hex character in {0}")]
    NotHex(String),
}

/// Lowercase, `0x`-prefixed form of a hex identifier. Accepts `0X`, a missing prefix and
/// surrounding whitespace.
pub fn normalize_hex(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

fn parse_hex(raw: &str) -> Result<String, AddressParseError> {
    let normalized = normalize_hex(raw);
    let body = &normalized[2..];
    if body.is_empty() {
        return Err(AddressParseError::Empty);
    }
    if !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressParseError::NotHex(raw.trim().to_string()));
    }
    Ok(normalized)
}

macro_rules! hex_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Build from raw input, normalizing casing and the hex prefix.
            pub fn new(raw: impl AsRef<str>) -> Self {
                $name(normalize_hex(raw.as_ref()))
            }

            /// Build from raw input, rejecting empty or non-hex bodies.
            pub fn parse(raw: &str) -> Result<Self, AddressParseError> {
                parse_hex(raw).map($name)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Rehydrate an already-normalized value read back from storage.
            pub fn from_stored(value: String) -> Self {
                $name(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hex_identifier!(
    /// Wallet address. Proxy wallets are rewritten to their owner during normalization.
    Address
);

hex_identifier!(
    /// Identifier of a resolvable condition (one market question).
    ConditionId
);

hex_identifier!(
    /// Transaction hash.
    TxHash
);

/// Opaque outcome-token identifier.
///
/// Token ids arrive either as large decimal integers or as hex strings; hex ids are
/// normalized like addresses, decimal ids are only trimmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            TokenId(normalize_hex(trimmed))
        } else {
            TokenId(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("invalid side: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalizes_case_and_prefix() {
        let a = Address::new("0xABCdef01");
        let b = Address::new("abcDEF01");
        let c = Address::new("  0XabcDEF01 ");
        assert_eq!(a.as_str(), "0xabcdef01");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert_eq!(Address::parse("0x"), Err(AddressParseError::Empty));
        assert!(matches!(
            Address::parse("0xnothex"),
            Err(AddressParseError::NotHex(_))
        ));
        assert!(ConditionId::parse("0xC0FFEE").is_ok());
    }

    #[test]
    fn test_token_id_decimal_kept_verbatim() {
        let token = TokenId::new(" 71321045679252212594626385532706912750332728571942532289631379312455583992563 ");
        assert!(token.as_str().starts_with("7132"));
        assert!(!token.as_str().starts_with(' '));
        assert_eq!(TokenId::new("0xAB").as_str(), "0xab");
    }

    #[test]
    fn test_side_parse_and_display() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!(" sell".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
        assert_eq!(Side::Buy.to_string(), "buy");
    }

    #[test]
    fn test_side_serialization() {
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"sell\"");
    }

    #[test]
    fn test_timems_ordering() {
        assert!(TimeMs::new(1000) < TimeMs::new(2000));
    }
}
