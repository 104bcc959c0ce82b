//! Local order book mirror
//!
//! Maintains a depth-bounded bid/ask ladder from a REST snapshot plus the
//! diff stream. Uses `BTreeMap` keyed by price so both sides iterate in a
//! deterministic sorted order; bids are read back-to-front (best = highest).
//!
//! Each delta is classified purely by its update-ID range:
//! - `final_sequence <= last_applied` → `Stale`, dropped without mutation
//! - `first_sequence > last_applied + 1` → `Gap`, dropped, resync needed
//! - otherwise the range straddles `last_applied + 1` → merged
//!
//! A merge is staged on copies of both ladders and committed only after the
//! crossed-book check passes, so a rejected merge leaves no trace.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use types::ids::MarketId;
use types::numeric::{Price, Quantity};
use types::side::Side;

use crate::events::{OrderBookDelta, OrderBookSnapshot, PriceLevel};
use crate::snapshot::BookView;

/// Default number of levels kept per side.
pub const DEFAULT_DEPTH_LIMIT: usize = 20;

/// Outcome of applying a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// The delta was contiguous and has been merged.
    Applied,
    /// The delta predates the current state; nothing changed.
    Stale,
    /// Update IDs between `expected` and `first_sequence` were never seen.
    Gap { expected: u64, first_sequence: u64 },
}

/// Outcome of applying a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotResult {
    /// State was replaced by the snapshot.
    Replaced,
    /// The snapshot is older than the state already held; nothing changed.
    Stale { snapshot_sequence: u64, applied_sequence: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    /// Upstream sent data that would cross the book.
    #[error("crossed book at sequence {sequence}: best bid {best_bid} >= best ask {best_ask}")]
    Crossed {
        sequence: u64,
        best_bid: Price,
        best_ask: Price,
    },

    /// The engine's own state is inconsistent. Not recoverable.
    #[error("order book invariant violated: {0}")]
    InvariantViolation(String),
}

/// Depth-bounded local mirror of one symbol's order book.
#[derive(Debug, Clone)]
pub struct LocalOrderBook {
    pub symbol: MarketId,
    /// price → quantity, ascending; best bid is the last key.
    bids: BTreeMap<Price, Quantity>,
    /// price → quantity, ascending; best ask is the first key.
    asks: BTreeMap<Price, Quantity>,
    last_applied_sequence: u64,
    depth_limit: usize,
}

impl LocalOrderBook {
    /// Create an empty book. A `depth_limit` of zero is raised to one.
    pub fn new(symbol: MarketId, depth_limit: usize) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied_sequence: 0,
            depth_limit: depth_limit.max(1),
        }
    }

    /// Replace the book with a snapshot.
    ///
    /// A snapshot older than `last_applied_sequence` is refused so the
    /// sequence never moves backwards. A crossed snapshot is refused with
    /// `BookError::Crossed`. In both cases the book is untouched.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &OrderBookSnapshot,
    ) -> Result<SnapshotResult, BookError> {
        if snapshot.last_sequence < self.last_applied_sequence {
            return Ok(SnapshotResult::Stale {
                snapshot_sequence: snapshot.last_sequence,
                applied_sequence: self.last_applied_sequence,
            });
        }

        let mut bids = BTreeMap::new();
        let mut asks = BTreeMap::new();
        merge_side(&mut bids, &snapshot.bids);
        merge_side(&mut asks, &snapshot.asks);
        truncate_side(&mut bids, Side::Bid, self.depth_limit);
        truncate_side(&mut asks, Side::Ask, self.depth_limit);
        check_not_crossed(&bids, &asks, snapshot.last_sequence)?;

        self.bids = bids;
        self.asks = asks;
        self.last_applied_sequence = snapshot.last_sequence;
        Ok(SnapshotResult::Replaced)
    }

    /// Classify and, if contiguous, merge a delta.
    pub fn apply_delta(&mut self, delta: &OrderBookDelta) -> Result<ApplyResult, BookError> {
        if delta.final_sequence <= self.last_applied_sequence {
            return Ok(ApplyResult::Stale);
        }

        let expected = self.last_applied_sequence.saturating_add(1);
        if delta.first_sequence > expected {
            return Ok(ApplyResult::Gap {
                expected,
                first_sequence: delta.first_sequence,
            });
        }

        let mut bids = self.bids.clone();
        let mut asks = self.asks.clone();
        merge_side(&mut bids, &delta.bid_changes);
        merge_side(&mut asks, &delta.ask_changes);
        truncate_side(&mut bids, Side::Bid, self.depth_limit);
        truncate_side(&mut asks, Side::Ask, self.depth_limit);
        check_not_crossed(&bids, &asks, delta.final_sequence)?;

        self.bids = bids;
        self.asks = asks;
        self.last_applied_sequence = delta.final_sequence;
        Ok(ApplyResult::Applied)
    }

    /// Re-verify every ladder invariant. A failure means the engine itself
    /// is broken.
    pub fn check_invariants(&self) -> Result<(), BookError> {
        for (side, levels) in [(Side::Bid, &self.bids), (Side::Ask, &self.asks)] {
            if levels.len() > self.depth_limit {
                return Err(BookError::InvariantViolation(format!(
                    "{side} depth {} exceeds limit {}",
                    levels.len(),
                    self.depth_limit
                )));
            }
            if let Some((price, _)) = levels.iter().find(|(_, qty)| qty.is_zero()) {
                return Err(BookError::InvariantViolation(format!(
                    "zero quantity {side} level at {price}"
                )));
            }
        }

        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                return Err(BookError::InvariantViolation(format!(
                    "crossed book: bid {bid} >= ask {ask}"
                )));
            }
        }

        Ok(())
    }

    /// Get the current best bid price.
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().next_back().copied()
    }

    /// Get the current best ask price.
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    /// Get the mid-market price (average of best bid and best ask).
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                Some((bid.as_decimal() + ask.as_decimal()) / Decimal::from(2))
            }
            _ => None,
        }
    }

    /// Get the spread between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.as_decimal() - bid.as_decimal()),
            _ => None,
        }
    }

    /// Get all bid levels (descending price order).
    pub fn bid_levels(&self) -> Vec<PriceLevel> {
        self.top_levels(Side::Bid, self.depth_limit)
    }

    /// Get all ask levels (ascending price order).
    pub fn ask_levels(&self) -> Vec<PriceLevel> {
        self.top_levels(Side::Ask, self.depth_limit)
    }

    /// Best `n` levels of one side, best first.
    pub fn top_levels(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        let to_level = |(price, qty): (&Price, &Quantity)| PriceLevel::new(*price, *qty);
        match side {
            Side::Bid => self.bids.iter().rev().take(n).map(to_level).collect(),
            Side::Ask => self.asks.iter().take(n).map(to_level).collect(),
        }
    }

    /// Quantity resting at `price` on `side`, if any.
    pub fn quantity_at(&self, side: Side, price: Price) -> Option<Quantity> {
        match side {
            Side::Bid => self.bids.get(&price).copied(),
            Side::Ask => self.asks.get(&price).copied(),
        }
    }

    /// Immutable point-in-time copy for readers.
    pub fn view(&self) -> BookView {
        BookView::capture(self)
    }

    /// Number of bid price levels.
    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    /// Number of ask price levels.
    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Last update ID folded into the book.
    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied_sequence
    }

    pub fn depth_limit(&self) -> usize {
        self.depth_limit
    }
}

/// Upsert non-zero levels, remove tombstoned prices.
fn merge_side(levels: &mut BTreeMap<Price, Quantity>, changes: &[PriceLevel]) {
    for change in changes {
        if change.is_tombstone() {
            levels.remove(&change.price);
        } else {
            levels.insert(change.price, change.quantity);
        }
    }
}

/// Drop levels beyond the cap, keeping the best prices of the side.
fn truncate_side(levels: &mut BTreeMap<Price, Quantity>, side: Side, depth_limit: usize) {
    while levels.len() > depth_limit {
        match side {
            Side::Bid => levels.pop_first(),
            Side::Ask => levels.pop_last(),
        };
    }
}

fn check_not_crossed(
    bids: &BTreeMap<Price, Quantity>,
    asks: &BTreeMap<Price, Quantity>,
    sequence: u64,
) -> Result<(), BookError> {
    if let (Some(&best_bid), Some(&best_ask)) = (bids.keys().next_back(), asks.keys().next()) {
        if best_bid >= best_ask {
            return Err(BookError::Crossed {
                sequence,
                best_bid,
                best_ask,
            });
        }
    }
    Ok(())
}
