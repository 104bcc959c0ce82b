//! Error types for the shared value types

use thiserror::Error;

/// Errors raised when constructing or parsing a numeric value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NumericError {
    #[error("Price must be strictly positive: {0}")]
    NonPositivePrice(String),

    #[error("Quantity must not be negative: {0}")]
    NegativeQuantity(String),

    #[error("Not a decimal number: {0:?}")]
    Unparseable(String),
}

/// Errors raised when parsing an identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("MarketId must be in BASE/QUOTE format: {0:?}")]
    InvalidMarketId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_error_display() {
        let err = NumericError::NonPositivePrice("0".to_string());
        assert_eq!(err.to_string(), "Price must be strictly positive: 0");

        let err = NumericError::Unparseable("x".to_string());
        assert_eq!(err.to_string(), "Not a decimal number: \"x\"");
    }
}
