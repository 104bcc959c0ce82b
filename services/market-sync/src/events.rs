//! Event definitions consumed by the synchronization core
//!
//! The transport layer decodes exchange messages into these value objects
//! and pushes them, in arrival order, onto one channel per symbol. Every
//! object here is transient: it is consumed once by the coordinator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::MarketId;
use types::numeric::{Price, Quantity};
use types::side::Side;

use crate::candles::Candle;

/// A single price level. A zero quantity on a delta is a tombstone
/// meaning "remove this price".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub quantity: Quantity,
}

impl PriceLevel {
    pub fn new(price: Price, quantity: Quantity) -> Self {
        Self { price, quantity }
    }

    /// Whether this level removes its price from the ladder.
    pub fn is_tombstone(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Full-depth book state as served by the REST snapshot endpoint.
///
/// Bids descending, asks ascending, unique prices on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: MarketId,
    /// Last update ID folded into this snapshot.
    pub last_sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    pub fn levels(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }
}

/// One atomic batch of book changes covering the inclusive update-ID range
/// `[first_sequence, final_sequence]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookDelta {
    pub symbol: MarketId,
    pub first_sequence: u64,
    pub final_sequence: u64,
    pub bid_changes: Vec<PriceLevel>,
    pub ask_changes: Vec<PriceLevel>,
}

impl OrderBookDelta {
    pub fn changes(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Bid => &self.bid_changes,
            Side::Ask => &self.ask_changes,
        }
    }

    /// Total number of level changes across both sides.
    pub fn change_count(&self) -> usize {
        self.bid_changes.len() + self.ask_changes.len()
    }
}

/// A last-trade price observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: Price,
    /// Unix milliseconds.
    pub timestamp_ms: u64,
}

impl PriceTick {
    pub fn new(price: Price, timestamp_ms: u64) -> Self {
        Self {
            price,
            timestamp_ms,
        }
    }
}

/// Rolling 24h window summary from the ticker stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerStats {
    /// Absolute change over the window; negative when the price fell.
    pub change: Decimal,
    pub change_percent: Decimal,
    pub high: Price,
    pub low: Price,
    /// Traded volume in the quote asset.
    pub quote_volume: Quantity,
}

/// Everything the transport can hand to a symbol's coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum FeedEvent {
    /// A snapshot fetch completed.
    Snapshot(OrderBookSnapshot),
    /// A snapshot fetch failed; the transport is retrying with backoff.
    SnapshotFailed { reason: String },
    /// A diff from the depth stream.
    Delta(OrderBookDelta),
    /// A trade-price tick.
    Tick(PriceTick),
    /// A ticker update: last price plus the 24h window.
    Ticker { tick: PriceTick, stats: TickerStats },
    /// Historical candles used to bootstrap the chart series.
    CandleHistory { candles: Vec<Candle> },
    /// Switch the chart to another interval. The series is cleared and
    /// waits for fresh history.
    ConfigureCandles { interval_ms: u64, capacity: usize },
}

impl FeedEvent {
    /// Get the event type as a string label for logging.
    pub fn event_type_label(&self) -> &'static str {
        match self {
            FeedEvent::Snapshot(_) => "Snapshot",
            FeedEvent::SnapshotFailed { .. } => "SnapshotFailed",
            FeedEvent::Delta(_) => "Delta",
            FeedEvent::Tick(_) => "Tick",
            FeedEvent::Ticker { .. } => "Ticker",
            FeedEvent::CandleHistory { .. } => "CandleHistory",
            FeedEvent::ConfigureCandles { .. } => "ConfigureCandles",
        }
    }
}

/// Ask the transport to fetch a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub symbol: MarketId,
    /// Number of levels per side to request.
    pub depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: u64, qty: u64) -> PriceLevel {
        PriceLevel::new(Price::from_u64(price), Quantity::from_u64(qty))
    }

    #[test]
    fn test_tombstone_detection() {
        assert!(level(100, 0).is_tombstone());
        assert!(!level(100, 1).is_tombstone());
    }

    #[test]
    fn test_delta_changes_by_side() {
        let delta = OrderBookDelta {
            symbol: MarketId::new("APT/USDC"),
            first_sequence: 1,
            final_sequence: 2,
            bid_changes: vec![level(10, 1), level(9, 2)],
            ask_changes: vec![level(11, 1)],
        };
        assert_eq!(delta.changes(Side::Bid).len(), 2);
        assert_eq!(delta.changes(Side::Ask).len(), 1);
        assert_eq!(delta.change_count(), 3);
    }

    #[test]
    fn test_event_type_label() {
        let e = FeedEvent::Tick(PriceTick::new(Price::from_u64(10), 1));
        assert_eq!(e.event_type_label(), "Tick");
        let e = FeedEvent::SnapshotFailed {
            reason: "timeout".to_string(),
        };
        assert_eq!(e.event_type_label(), "SnapshotFailed");
    }

    #[test]
    fn test_feed_event_serialization() {
        let e = FeedEvent::Delta(OrderBookDelta {
            symbol: MarketId::new("APT/USDC"),
            first_sequence: 7,
            final_sequence: 9,
            bid_changes: vec![level(10, 0)],
            ask_changes: vec![],
        });
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"event_type\":\"Delta\""));
        let back: FeedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
