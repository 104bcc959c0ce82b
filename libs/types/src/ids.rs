//! Identifier types for subscribed markets
//!
//! A market is named by its trading pair. The synchronization core never
//! maps symbols to venues; the pair string is opaque apart from the
//! `BASE/QUOTE` shape check.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::IdError;

/// Market identifier (trading pair)
///
/// Format: "BASE/QUOTE" (e.g., "APT/USDC", "BTC/USDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketId(String);

impl MarketId {
    /// Create a new MarketId from a string
    ///
    /// # Panics
    /// Panics if the format is invalid (must contain '/')
    pub fn new(symbol: impl Into<String>) -> Self {
        let s = symbol.into();
        assert!(s.contains('/'), "MarketId must be in BASE/QUOTE format");
        Self(s)
    }

    /// Try to create a MarketId, returning None if invalid
    pub fn try_new(symbol: impl Into<String>) -> Option<Self> {
        let s = symbol.into();
        let valid = match s.split_once('/') {
            Some((base, quote)) => !base.is_empty() && !quote.is_empty(),
            None => false,
        };
        valid.then_some(Self(s))
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into base and quote assets
    pub fn split(&self) -> (&str, &str) {
        self.0.split_once('/').unwrap_or((self.0.as_str(), ""))
    }

    /// Venue-style concatenated symbol, e.g. "APTUSDC".
    pub fn compact(&self) -> String {
        let (base, quote) = self.split();
        format!("{base}{quote}")
    }
}

impl TryFrom<String> for MarketId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match Self::try_new(value.as_str()) {
            Some(market) => Ok(market),
            None => Err(IdError::InvalidMarketId(value)),
        }
    }
}

impl From<MarketId> for String {
    fn from(market: MarketId) -> Self {
        market.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_id_creation() {
        let market = MarketId::new("APT/USDC");
        assert_eq!(market.as_str(), "APT/USDC");

        let (base, quote) = market.split();
        assert_eq!(base, "APT");
        assert_eq!(quote, "USDC");
    }

    #[test]
    fn test_market_id_try_new() {
        assert!(MarketId::try_new("BTC/USDT").is_some());
        assert!(MarketId::try_new("INVALID").is_none());
        assert!(MarketId::try_new("/USDT").is_none());
        assert!(MarketId::try_new("BTC/").is_none());
    }

    #[test]
    #[should_panic(expected = "MarketId must be in BASE/QUOTE format")]
    fn test_market_id_invalid_format() {
        MarketId::new("INVALID");
    }

    #[test]
    fn test_market_id_compact() {
        assert_eq!(MarketId::new("BTC/USDT").compact(), "BTCUSDT");
    }

    #[test]
    fn test_market_id_serialization() {
        let market = MarketId::new("ETH/USDC");
        let json = serde_json::to_string(&market).unwrap();
        assert_eq!(json, "\"ETH/USDC\"");

        let deserialized: MarketId = serde_json::from_str(&json).unwrap();
        assert_eq!(market, deserialized);
    }

    #[test]
    fn test_market_id_deserialize_rejects_bad_format() {
        for bad in ["\"APTUSDC\"", "\"/USDC\"", "\"APT/\""] {
            let result: Result<MarketId, _> = serde_json::from_str(bad);
            assert!(result.is_err(), "{bad} should not deserialize");
        }
    }
}
