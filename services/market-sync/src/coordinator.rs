//! Snapshot/delta orchestration for one symbol
//!
//! The coordinator decides, for every feed event, whether it goes to the
//! book, the candle series, the pending queue or the bin. It owns the
//! `Synced` / `Resyncing` transition:
//!
//! ```text
//!            start / gap / corruption
//!   Synced ───────────────────────────▶ Resyncing
//!     ▲                                    │
//!     └──── snapshot applied + queue ──────┘
//!           drained without a gap
//! ```
//!
//! No I/O happens here. When a fresh snapshot is needed the coordinator
//! returns `SyncAction::RequestSnapshot` and the caller forwards it to the
//! transport. At most one fetch is outstanding at a time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use types::ids::MarketId;

use crate::candles::{Candle, CandleAggregator, CandleError, CandleEvent};
use crate::config::{ConfigError, SyncConfig};
use crate::events::{
    FeedEvent, OrderBookDelta, OrderBookSnapshot, PriceTick, SnapshotRequest, TickerStats,
};
use crate::ingestion::EventValidator;
use crate::metrics::SyncMetrics;
use crate::order_book::{ApplyResult, BookError, LocalOrderBook, SnapshotResult};
use crate::snapshot::BookView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Every delta up to the book's sequence has been applied.
    Synced,
    /// Waiting for a snapshot; deltas are queued, reads may be stale.
    Resyncing,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Synced => write!(f, "synced"),
            SyncState::Resyncing => write!(f, "resyncing"),
        }
    }
}

/// What the caller must do after an event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    None,
    RequestSnapshot(SnapshotRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("candle series: {0}")]
    Candle(#[from] CandleError),

    /// Internal state is broken; the symbol must be torn down.
    #[error("{symbol}: {detail}")]
    InvariantViolation { symbol: MarketId, detail: String },

    #[error("{symbol}: coordinator halted after a fatal error")]
    Halted { symbol: MarketId },
}

/// Result of replaying the pending queue after a snapshot.
enum Drain {
    Complete,
    Interrupted,
}

/// Per-symbol sync state machine.
pub struct SyncCoordinator {
    symbol: MarketId,
    validator: EventValidator,
    book: LocalOrderBook,
    candles: CandleAggregator,
    /// Latest 24h window from the ticker stream.
    ticker: Option<TickerStats>,
    state: SyncState,
    /// Deltas held back while resyncing, in arrival order.
    pending: VecDeque<OrderBookDelta>,
    pending_capacity: usize,
    fetch_outstanding: bool,
    halted: bool,
    metrics: Arc<SyncMetrics>,
}

impl SyncCoordinator {
    pub fn new(symbol: MarketId, config: &SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            validator: EventValidator::new(symbol.clone()),
            book: LocalOrderBook::new(symbol.clone(), config.depth_limit),
            candles: config.candle.build()?,
            ticker: None,
            state: SyncState::Resyncing,
            pending: VecDeque::with_capacity(config.pending_capacity.min(1024)),
            pending_capacity: config.pending_capacity,
            fetch_outstanding: false,
            halted: false,
            metrics: Arc::new(SyncMetrics::new()),
            symbol,
        })
    }

    /// Kick off the initial snapshot fetch.
    pub fn start(&mut self) -> SyncAction {
        info!(symbol = %self.symbol, depth = self.book.depth_limit(), "Starting book sync");
        SyncMetrics::incr(&self.metrics.resyncs_started);
        self.request_snapshot()
    }

    /// Route one feed event.
    ///
    /// Recoverable conditions (stale, gap, crossed book, malformed input)
    /// are absorbed here. Only a broken internal invariant is an `Err`, after
    /// which every further call returns `SyncError::Halted`.
    pub fn handle(&mut self, event: FeedEvent) -> Result<SyncAction, SyncError> {
        if self.halted {
            return Err(SyncError::Halted {
                symbol: self.symbol.clone(),
            });
        }

        let started = Instant::now();
        debug!(symbol = %self.symbol, event = event.event_type_label(), state = %self.state, "Handling feed event");

        let result = match event {
            FeedEvent::Snapshot(snapshot) => self.on_snapshot(&snapshot),
            FeedEvent::SnapshotFailed { reason } => {
                SyncMetrics::incr(&self.metrics.snapshot_failures);
                warn!(symbol = %self.symbol, %reason, "Snapshot fetch failed, transport retrying");
                Ok(SyncAction::None)
            }
            FeedEvent::Delta(delta) => self.on_delta(delta),
            FeedEvent::Tick(tick) => {
                self.on_tick(&tick);
                Ok(SyncAction::None)
            }
            FeedEvent::Ticker { tick, stats } => {
                match self.validator.validate_ticker(&tick, &stats) {
                    Ok(()) => {
                        self.ticker = Some(stats);
                        self.on_tick(&tick);
                    }
                    Err(e) => {
                        warn!(symbol = %self.symbol, error = %e, "Dropping malformed ticker");
                        SyncMetrics::incr(&self.metrics.malformed_events);
                    }
                }
                Ok(SyncAction::None)
            }
            FeedEvent::CandleHistory { candles } => {
                self.on_history(&candles);
                Ok(SyncAction::None)
            }
            FeedEvent::ConfigureCandles {
                interval_ms,
                capacity,
            } => {
                if let Err(e) =
                    self.configure_candles(Duration::from_millis(interval_ms), capacity)
                {
                    warn!(symbol = %self.symbol, error = %e, "Rejected candle reconfiguration");
                    SyncMetrics::incr(&self.metrics.malformed_events);
                }
                Ok(SyncAction::None)
            }
        };

        self.metrics
            .record_handling(started.elapsed().as_nanos().min(u64::MAX as u128) as u64);
        result
    }

    fn on_snapshot(&mut self, snapshot: &OrderBookSnapshot) -> Result<SyncAction, SyncError> {
        if self.state == SyncState::Resyncing {
            self.fetch_outstanding = false;
        }

        if let Err(e) = self.validator.validate_snapshot(snapshot) {
            warn!(symbol = %self.symbol, error = %e, "Dropping malformed snapshot");
            SyncMetrics::incr(&self.metrics.malformed_events);
            return Ok(self.reject_snapshot());
        }

        match self.book.apply_snapshot(snapshot) {
            Ok(SnapshotResult::Replaced) => {
                SyncMetrics::incr(&self.metrics.snapshots_applied);
                debug!(
                    symbol = %self.symbol,
                    sequence = snapshot.last_sequence,
                    pending = self.pending.len(),
                    "Snapshot applied"
                );
            }
            Ok(SnapshotResult::Stale {
                snapshot_sequence,
                applied_sequence,
            }) => {
                warn!(
                    symbol = %self.symbol,
                    snapshot_sequence,
                    applied_sequence,
                    "Discarding snapshot older than book"
                );
                return Ok(self.reject_snapshot());
            }
            Err(BookError::Crossed {
                sequence,
                best_bid,
                best_ask,
            }) => {
                error!(
                    symbol = %self.symbol,
                    sequence,
                    %best_bid,
                    %best_ask,
                    "Snapshot would cross the book"
                );
                SyncMetrics::incr(&self.metrics.book_corruptions);
                return Ok(self.reject_snapshot());
            }
            Err(BookError::InvariantViolation(detail)) => return Err(self.halt(detail)),
        }

        let drained = self.drain_pending()?;
        self.verify_book()?;

        match drained {
            Drain::Complete => {
                if self.state == SyncState::Resyncing {
                    self.state = SyncState::Synced;
                    SyncMetrics::incr(&self.metrics.resyncs_completed);
                    info!(
                        symbol = %self.symbol,
                        sequence = self.book.last_applied_sequence(),
                        "Book synced"
                    );
                }
                Ok(SyncAction::None)
            }
            Drain::Interrupted => Ok(self.enter_resync()),
        }
    }

    /// A snapshot was thrown away. While resyncing we still need one.
    fn reject_snapshot(&mut self) -> SyncAction {
        SyncMetrics::incr(&self.metrics.snapshots_rejected);
        match self.state {
            SyncState::Resyncing => self.request_snapshot(),
            SyncState::Synced => SyncAction::None,
        }
    }

    fn on_delta(&mut self, delta: OrderBookDelta) -> Result<SyncAction, SyncError> {
        if let Err(e) = self.validator.validate_delta(&delta) {
            warn!(symbol = %self.symbol, error = %e, "Dropping malformed delta");
            SyncMetrics::incr(&self.metrics.malformed_events);
            return Ok(SyncAction::None);
        }

        if self.state == SyncState::Resyncing {
            self.enqueue(delta);
            return Ok(self.request_snapshot());
        }

        match self.book.apply_delta(&delta) {
            Ok(ApplyResult::Applied) => {
                SyncMetrics::incr(&self.metrics.deltas_applied);
                self.verify_book()?;
                Ok(SyncAction::None)
            }
            Ok(ApplyResult::Stale) => {
                SyncMetrics::incr(&self.metrics.deltas_stale);
                debug!(
                    symbol = %self.symbol,
                    final_sequence = delta.final_sequence,
                    applied = self.book.last_applied_sequence(),
                    "Stale delta dropped"
                );
                Ok(SyncAction::None)
            }
            Ok(ApplyResult::Gap {
                expected,
                first_sequence,
            }) => {
                SyncMetrics::incr(&self.metrics.gaps_detected);
                warn!(symbol = %self.symbol, expected, first_sequence, "Sequence gap, resyncing");
                // Kept: it may bridge onto the next snapshot.
                self.enqueue(delta);
                Ok(self.enter_resync())
            }
            Err(BookError::Crossed {
                sequence,
                best_bid,
                best_ask,
            }) => {
                SyncMetrics::incr(&self.metrics.book_corruptions);
                error!(
                    symbol = %self.symbol,
                    sequence,
                    %best_bid,
                    %best_ask,
                    "Delta would cross the book, resyncing"
                );
                Ok(self.enter_resync())
            }
            Err(BookError::InvariantViolation(detail)) => Err(self.halt(detail)),
        }
    }

    fn on_tick(&mut self, tick: &PriceTick) {
        if let Err(e) = self.validator.validate_tick(tick) {
            warn!(symbol = %self.symbol, error = %e, "Dropping malformed tick");
            SyncMetrics::incr(&self.metrics.malformed_events);
            return;
        }

        match self.candles.ingest(tick) {
            CandleEvent::Started(candle) => {
                SyncMetrics::incr(&self.metrics.ticks_ingested);
                SyncMetrics::incr(&self.metrics.candles_started);
                debug!(symbol = %self.symbol, bucket_start = candle.bucket_start, "Candle started");
            }
            CandleEvent::Updated(_) => {
                SyncMetrics::incr(&self.metrics.ticks_ingested);
            }
            CandleEvent::Ignored(reason) => {
                SyncMetrics::incr(&self.metrics.ticks_ignored);
                debug!(
                    symbol = %self.symbol,
                    timestamp_ms = tick.timestamp_ms,
                    ?reason,
                    "Tick ignored"
                );
            }
        }
    }

    fn on_history(&mut self, history: &[Candle]) {
        match self.candles.seed(history) {
            Ok(kept) => {
                info!(symbol = %self.symbol, received = history.len(), kept, "Candle history loaded");
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Dropping malformed candle history");
                SyncMetrics::incr(&self.metrics.malformed_events);
            }
        }
    }

    /// Switch the chart interval. The series is cleared until new history
    /// arrives; the book is untouched.
    pub fn configure_candles(&mut self, interval: Duration, capacity: usize) -> Result<(), CandleError> {
        self.candles.configure(interval, capacity)?;
        info!(
            symbol = %self.symbol,
            interval_ms = self.candles.interval_ms(),
            capacity,
            "Candle series reconfigured"
        );
        Ok(())
    }

    /// Queue a delta for the next snapshot, dropping the oldest when full.
    fn enqueue(&mut self, delta: OrderBookDelta) {
        if self.pending.len() >= self.pending_capacity {
            if let Some(dropped) = self.pending.pop_front() {
                SyncMetrics::incr(&self.metrics.deltas_dropped);
                warn!(
                    symbol = %self.symbol,
                    first_sequence = dropped.first_sequence,
                    final_sequence = dropped.final_sequence,
                    capacity = self.pending_capacity,
                    "Pending queue full, dropped oldest delta"
                );
            }
        }
        self.pending.push_back(delta);
        SyncMetrics::incr(&self.metrics.deltas_queued);
    }

    /// Replay queued deltas in arrival order onto a fresh snapshot.
    ///
    /// Stops at the first gap, leaving that delta and the rest queued. A
    /// delta that would cross the book is dropped and also stops the drain.
    fn drain_pending(&mut self) -> Result<Drain, SyncError> {
        while let Some(delta) = self.pending.pop_front() {
            match self.book.apply_delta(&delta) {
                Ok(ApplyResult::Applied) => SyncMetrics::incr(&self.metrics.deltas_applied),
                Ok(ApplyResult::Stale) => SyncMetrics::incr(&self.metrics.deltas_stale),
                Ok(ApplyResult::Gap {
                    expected,
                    first_sequence,
                }) => {
                    SyncMetrics::incr(&self.metrics.gaps_detected);
                    warn!(
                        symbol = %self.symbol,
                        expected,
                        first_sequence,
                        remaining = self.pending.len() + 1,
                        "Gap while draining pending deltas"
                    );
                    self.pending.push_front(delta);
                    return Ok(Drain::Interrupted);
                }
                Err(BookError::Crossed { sequence, .. }) => {
                    SyncMetrics::incr(&self.metrics.book_corruptions);
                    error!(symbol = %self.symbol, sequence, "Queued delta would cross the book");
                    return Ok(Drain::Interrupted);
                }
                Err(BookError::InvariantViolation(detail)) => return Err(self.halt(detail)),
            }
        }
        Ok(Drain::Complete)
    }

    fn enter_resync(&mut self) -> SyncAction {
        if self.state == SyncState::Synced {
            self.state = SyncState::Resyncing;
            SyncMetrics::incr(&self.metrics.resyncs_started);
            info!(symbol = %self.symbol, sequence = self.book.last_applied_sequence(), "Entering resync");
        }
        self.request_snapshot()
    }

    fn request_snapshot(&mut self) -> SyncAction {
        if self.fetch_outstanding {
            return SyncAction::None;
        }
        self.fetch_outstanding = true;
        SyncAction::RequestSnapshot(SnapshotRequest {
            symbol: self.symbol.clone(),
            depth: self.book.depth_limit(),
        })
    }

    fn verify_book(&mut self) -> Result<(), SyncError> {
        match self.book.check_invariants() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.halt(e.to_string())),
        }
    }

    fn halt(&mut self, detail: String) -> SyncError {
        self.halted = true;
        error!(symbol = %self.symbol, %detail, "Fatal book invariant violation, halting symbol");
        SyncError::InvariantViolation {
            symbol: self.symbol.clone(),
            detail,
        }
    }

    pub fn symbol(&self) -> &MarketId {
        &self.symbol
    }

    pub fn sync_state(&self) -> SyncState {
        self.state
    }

    pub fn book(&self) -> &LocalOrderBook {
        &self.book
    }

    pub fn book_view(&self) -> BookView {
        self.book.view()
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.candles.candles()
    }

    pub fn ticker(&self) -> Option<TickerStats> {
        self.ticker
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn fetch_outstanding(&self) -> bool {
        self.fetch_outstanding
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }
}
