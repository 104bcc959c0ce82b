//! Point-in-time book views for the presentation layer
//!
//! Readers never hold a reference into the live ladder; they get a
//! `BookView`, an owned copy tagged with the sequence it reflects and a
//! SHA-256 checksum over its content. Two views with the same checksum
//! render identically, so a UI can skip redundant redraws.

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use types::ids::MarketId;

use crate::events::PriceLevel;
use crate::order_book::LocalOrderBook;

/// Immutable copy of a book at one sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookView {
    pub symbol: MarketId,
    /// Last update ID reflected in this view.
    pub last_sequence: u64,
    /// Bid levels in descending price order (best first).
    pub bids: Vec<PriceLevel>,
    /// Ask levels in ascending price order (best first).
    pub asks: Vec<PriceLevel>,
    /// SHA-256 checksum of the view content.
    pub checksum: String,
}

impl BookView {
    /// Copy the current state of `book`.
    pub fn capture(book: &LocalOrderBook) -> Self {
        Self::from_levels(
            book.symbol.clone(),
            book.last_applied_sequence(),
            book.bid_levels(),
            book.ask_levels(),
        )
    }

    fn from_levels(
        symbol: MarketId,
        last_sequence: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        let checksum = compute_checksum(&bids, &asks, last_sequence);
        Self {
            symbol,
            last_sequence,
            bids,
            asks,
            checksum,
        }
    }

    /// The best `levels` entries of each side, re-checksummed.
    pub fn truncated(&self, levels: usize) -> Self {
        Self::from_levels(
            self.symbol.clone(),
            self.last_sequence,
            self.bids.iter().take(levels).copied().collect(),
            self.asks.iter().take(levels).copied().collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Compute a SHA-256 checksum over the book levels and sequence.
fn compute_checksum(bids: &[PriceLevel], asks: &[PriceLevel], sequence: u64) -> String {
    let mut hasher = Sha256::new();

    for level in bids {
        hasher.update(level.price.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(level.quantity.to_string().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b"---");

    for level in asks {
        hasher.update(level.price.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(level.quantity.to_string().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b"---");

    hasher.update(sequence.to_le_bytes());

    format!("{:x}", hasher.finalize())
}

/// Verify that a view's checksum matches its content.
pub fn verify_view_integrity(view: &BookView) -> bool {
    view.checksum == compute_checksum(&view.bids, &view.asks, view.last_sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderBookSnapshot;
    use types::numeric::{Price, Quantity};

    fn level(price: u64, qty: u64) -> PriceLevel {
        PriceLevel::new(Price::from_u64(price), Quantity::from_u64(qty))
    }

    fn populated_book() -> LocalOrderBook {
        let mut book = LocalOrderBook::new(MarketId::new("APT/USDC"), 20);
        book.apply_snapshot(&OrderBookSnapshot {
            symbol: MarketId::new("APT/USDC"),
            last_sequence: 10,
            bids: (1..=5).map(|i| level(500 - i, 1)).collect(),
            asks: (1..=5).map(|i| level(510 + i, 1)).collect(),
        })
        .unwrap();
        book
    }

    #[test]
    fn test_capture() {
        let view = populated_book().view();
        assert_eq!(view.bids.len(), 5);
        assert_eq!(view.asks.len(), 5);
        assert_eq!(view.last_sequence, 10);
        assert!(view.bids[0].price > view.bids[1].price);
        assert!(view.asks[0].price < view.asks[1].price);
        assert!(!view.checksum.is_empty());
    }

    #[test]
    fn test_view_is_detached_from_book() {
        let mut book = populated_book();
        let view = book.view();
        book.apply_snapshot(&OrderBookSnapshot {
            symbol: MarketId::new("APT/USDC"),
            last_sequence: 11,
            bids: vec![],
            asks: vec![],
        })
        .unwrap();
        assert_eq!(view.bids.len(), 5);
        assert!(book.view().is_empty());
    }

    #[test]
    fn test_view_integrity() {
        let view = populated_book().view();
        assert!(verify_view_integrity(&view));

        let mut tampered = view.clone();
        tampered.bids.pop();
        assert!(!verify_view_integrity(&tampered));
    }

    #[test]
    fn test_deterministic_checksum() {
        assert_eq!(populated_book().view().checksum, populated_book().view().checksum);
    }

    #[test]
    fn test_truncated_view() {
        let view = populated_book().view().truncated(2);
        assert_eq!(view.bids.len(), 2);
        assert_eq!(view.asks.len(), 2);
        assert!(verify_view_integrity(&view));
    }

    #[test]
    fn test_view_of_fresh_book() {
        let view = LocalOrderBook::new(MarketId::new("APT/USDC"), 20).view();
        assert!(view.is_empty());
        assert_eq!(view.last_sequence, 0);
        assert!(verify_view_integrity(&view));
    }
}
