//! Market Sync Service
//!
//! Keeps a local, depth-bounded mirror of an exchange order book and a
//! bounded OHLC candle series per subscribed market, fed by:
//! - A REST depth snapshot, re-fetched whenever continuity is lost
//! - An unordered stream of depth diffs tagged with update-ID ranges
//! - A stream of 24h ticker updates (last price plus window stats)
//! - Historical klines to bootstrap the chart
//!
//! The engines are synchronous state machines with no I/O. One tokio task
//! per market owns them and publishes immutable views for readers.
//!
//! # Architecture
//!
//! ```text
//!   Transport (REST + WebSocket)
//!        │  FeedEvent            ▲ SnapshotRequest
//!    ┌───▼────────────────────────┴──┐
//!    │ SyncCoordinator (per symbol)  │ ← Synced / Resyncing
//!    │   validate → route            │
//!    └───┬──────────────┬────────────┘
//!        │              │
//!   ┌────▼─────┐   ┌────▼───────┐
//!   │OrderBook │   │Candles     │
//!   └────┬─────┘   └────┬───────┘
//!        │              │
//!    ┌───▼──────────────▼──┐
//!    │ MarketView (watch)  │ → MarketDataHub queries
//!    └─────────────────────┘
//! ```

pub mod candles;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod order_book;
pub mod snapshot;
pub mod subscription;
pub mod wire;

pub use candles::{Candle, CandleAggregator, CandleEvent, ChartPeriod, GapFill, Timeframe};
pub use config::{CandleConfig, SyncConfig};
pub use coordinator::{SyncAction, SyncCoordinator, SyncError, SyncState};
pub use events::{FeedEvent, OrderBookDelta, OrderBookSnapshot, PriceLevel, PriceTick, SnapshotRequest, TickerStats};
pub use order_book::{ApplyResult, LocalOrderBook};
pub use snapshot::BookView;
pub use subscription::{spawn_feed, FeedHandle, HubError, MarketDataHub, MarketView};
pub use wire::WireDecoder;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
