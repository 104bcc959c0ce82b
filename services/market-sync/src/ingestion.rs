//! Structural validation of incoming feed events
//!
//! Every snapshot, delta and tick passes through here before it can reach
//! the engines. Anything that fails is a malformed event: it is dropped by
//! the coordinator and never applied.
//!
//! Checks:
//! - Event symbol matches the subscription
//! - Delta update-ID range is not inverted
//! - Snapshot ladders are strictly ordered with positive quantities
//! - No price appears twice on one side of a delta
//! - Tick timestamps are set

use std::collections::BTreeSet;

use types::ids::MarketId;
use types::numeric::Price;
use types::side::Side;

use crate::events::{OrderBookDelta, OrderBookSnapshot, PriceLevel, PriceTick, TickerStats};

/// Reasons an event is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestionError {
    #[error("symbol mismatch: subscribed to {expected}, event is for {actual}")]
    SymbolMismatch { expected: MarketId, actual: MarketId },

    #[error("inverted update range: first={first} > final={last}")]
    InvertedRange { first: u64, last: u64 },

    #[error("{side} levels out of order at index {index}")]
    UnsortedLevels { side: Side, index: usize },

    #[error("duplicate {side} price {price}")]
    DuplicatePrice { side: Side, price: Price },

    #[error("zero quantity {side} level at {price} in snapshot")]
    ZeroQuantity { side: Side, price: Price },

    #[error("tick has no timestamp")]
    MissingTimestamp,

    #[error("ticker low {low} is above high {high}")]
    InvertedTickerRange { low: Price, high: Price },
}

/// Validates events for a single subscribed symbol.
#[derive(Debug, Clone)]
pub struct EventValidator {
    symbol: MarketId,
}

impl EventValidator {
    pub fn new(symbol: MarketId) -> Self {
        Self { symbol }
    }

    pub fn symbol(&self) -> &MarketId {
        &self.symbol
    }

    /// Validate a snapshot: bids strictly descending, asks strictly
    /// ascending, every level carrying a positive quantity.
    pub fn validate_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<(), IngestionError> {
        self.check_symbol(&snapshot.symbol)?;
        for side in [Side::Bid, Side::Ask] {
            check_ladder(side, snapshot.levels(side))?;
        }
        Ok(())
    }

    /// Validate a delta. Change lists need not be sorted, but a price may
    /// appear at most once per side.
    pub fn validate_delta(&self, delta: &OrderBookDelta) -> Result<(), IngestionError> {
        self.check_symbol(&delta.symbol)?;

        if delta.first_sequence > delta.final_sequence {
            return Err(IngestionError::InvertedRange {
                first: delta.first_sequence,
                last: delta.final_sequence,
            });
        }

        for side in [Side::Bid, Side::Ask] {
            let mut seen = BTreeSet::new();
            for level in delta.changes(side) {
                if !seen.insert(level.price) {
                    return Err(IngestionError::DuplicatePrice {
                        side,
                        price: level.price,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn validate_tick(&self, tick: &PriceTick) -> Result<(), IngestionError> {
        if tick.timestamp_ms == 0 {
            return Err(IngestionError::MissingTimestamp);
        }
        Ok(())
    }

    /// Validate a ticker update: the tick itself plus a sane 24h range.
    pub fn validate_ticker(&self, tick: &PriceTick, stats: &TickerStats) -> Result<(), IngestionError> {
        self.validate_tick(tick)?;
        if stats.low > stats.high {
            return Err(IngestionError::InvertedTickerRange {
                low: stats.low,
                high: stats.high,
            });
        }
        Ok(())
    }

    fn check_symbol(&self, actual: &MarketId) -> Result<(), IngestionError> {
        if actual != &self.symbol {
            return Err(IngestionError::SymbolMismatch {
                expected: self.symbol.clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }
}

/// Check one side of a snapshot for ordering, uniqueness and quantities.
fn check_ladder(side: Side, levels: &[PriceLevel]) -> Result<(), IngestionError> {
    for (index, level) in levels.iter().enumerate() {
        if level.is_tombstone() {
            return Err(IngestionError::ZeroQuantity {
                side,
                price: level.price,
            });
        }

        if index == 0 {
            continue;
        }

        let prev = levels[index - 1].price;
        if prev == level.price {
            return Err(IngestionError::DuplicatePrice {
                side,
                price: level.price,
            });
        }

        let ordered = match side {
            Side::Bid => prev > level.price,
            Side::Ask => prev < level.price,
        };
        if !ordered {
            return Err(IngestionError::UnsortedLevels { side, index });
        }
    }
    Ok(())
}
