//! Per-symbol feed tasks and the multi-symbol query surface
//!
//! Each subscribed symbol gets one tokio task that owns its
//! `SyncCoordinator`. The transport pushes events through a bounded `mpsc`
//! channel; the task handles them strictly in order and publishes a fresh
//! `MarketView` on a `watch` channel after every event. Readers only ever
//! see those owned copies.
//!
//! Snapshot fetches flow the other way: the task forwards each
//! `SnapshotRequest` to a channel the transport owns, and the transport
//! answers with `FeedEvent::Snapshot` or `FeedEvent::SnapshotFailed`. The
//! task never blocks on that channel: when it is full the request waits
//! while events are still consumed, so a transport that is itself blocked
//! pushing events cannot deadlock against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::ids::MarketId;

use crate::candles::{Candle, ChartPeriod};
use crate::config::{ConfigError, SyncConfig};
use crate::coordinator::{SyncAction, SyncCoordinator, SyncError, SyncState};
use crate::events::{FeedEvent, SnapshotRequest, TickerStats};
use crate::metrics::SyncMetrics;
use crate::snapshot::BookView;

/// Everything the presentation layer reads for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketView {
    pub book: BookView,
    /// Ascending by bucket start.
    pub candles: Vec<Candle>,
    /// Latest 24h ticker window, once one has arrived.
    pub ticker: Option<TickerStats>,
    pub state: SyncState,
}

impl MarketView {
    fn capture(coordinator: &SyncCoordinator) -> Self {
        Self {
            book: coordinator.book_view(),
            candles: coordinator.candles(),
            ticker: coordinator.ticker(),
            state: coordinator.sync_state(),
        }
    }
}

/// How a feed task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedExit {
    /// Every event sender was dropped.
    Closed,
    /// The transport dropped its snapshot request receiver.
    TransportGone,
    /// A fatal invariant violation stopped the symbol.
    Halted(SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("{0} is not subscribed")]
    NotSubscribed(MarketId),

    #[error("{0} is already subscribed")]
    AlreadySubscribed(MarketId),

    #[error("feed for {0} has stopped")]
    FeedClosed(MarketId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Owner's side of a running feed task.
pub struct FeedHandle {
    symbol: MarketId,
    events: mpsc::Sender<FeedEvent>,
    view: watch::Receiver<MarketView>,
    metrics: Arc<SyncMetrics>,
    task: JoinHandle<FeedExit>,
}

impl FeedHandle {
    pub fn symbol(&self) -> &MarketId {
        &self.symbol
    }

    /// A sender for the transport. The task ends once every sender is gone.
    pub fn sender(&self) -> mpsc::Sender<FeedEvent> {
        self.events.clone()
    }

    pub async fn push(&self, event: FeedEvent) -> Result<(), HubError> {
        self.events
            .send(event)
            .await
            .map_err(|_| HubError::FeedClosed(self.symbol.clone()))
    }

    /// Latest published view.
    pub fn view(&self) -> MarketView {
        self.view.borrow().clone()
    }

    /// A receiver that is notified on every publish.
    pub fn watch(&self) -> watch::Receiver<MarketView> {
        self.view.clone()
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the event channel and wait for the task to drain and exit.
    pub async fn close(self) -> Option<FeedExit> {
        drop(self.events);
        self.task.await.ok()
    }

    /// Stop the task without draining.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Spawn the feed task for one symbol.
pub fn spawn_feed(
    symbol: MarketId,
    config: &SyncConfig,
    requests: mpsc::Sender<SnapshotRequest>,
) -> Result<FeedHandle, SyncError> {
    let coordinator = SyncCoordinator::new(symbol.clone(), config)?;
    let metrics = coordinator.metrics();
    let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
    let (view_tx, view_rx) = watch::channel(MarketView::capture(&coordinator));

    let task = tokio::spawn(run_feed(coordinator, events_rx, view_tx, requests));

    Ok(FeedHandle {
        symbol,
        events: events_tx,
        view: view_rx,
        metrics,
        task,
    })
}

async fn run_feed(
    mut coordinator: SyncCoordinator,
    mut events: mpsc::Receiver<FeedEvent>,
    view: watch::Sender<MarketView>,
    requests: mpsc::Sender<SnapshotRequest>,
) -> FeedExit {
    let symbol = coordinator.symbol().clone();
    info!(symbol = %symbol, "Feed task started");

    // A request the transport had no room for yet. Events keep flowing
    // while it waits.
    let mut deferred: Option<SnapshotRequest> = None;

    let initial = coordinator.start();
    if !dispatch(&symbol, initial, &requests, &mut deferred) {
        return FeedExit::TransportGone;
    }

    loop {
        tokio::select! {
            permit = requests.reserve(), if deferred.is_some() => {
                let Ok(permit) = permit else {
                    warn!(symbol = %symbol, "Snapshot request channel closed");
                    return FeedExit::TransportGone;
                };
                if let Some(request) = deferred.take() {
                    debug!(symbol = %symbol, depth = request.depth, "Deferred snapshot request sent");
                    permit.send(request);
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match coordinator.handle(event) {
                    Ok(action) => {
                        view.send_replace(MarketView::capture(&coordinator));
                        if !dispatch(&symbol, action, &requests, &mut deferred) {
                            return FeedExit::TransportGone;
                        }
                    }
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "Feed task halted");
                        view.send_replace(MarketView::capture(&coordinator));
                        return FeedExit::Halted(e);
                    }
                }
            }
        }
    }

    info!(symbol = %symbol, "Feed task stopped, event channel closed");
    FeedExit::Closed
}

/// Hand a snapshot request to the transport without waiting on it. A full
/// request channel parks the request in `deferred`. Returns false if the
/// transport is gone.
fn dispatch(
    symbol: &MarketId,
    action: SyncAction,
    requests: &mpsc::Sender<SnapshotRequest>,
    deferred: &mut Option<SnapshotRequest>,
) -> bool {
    let SyncAction::RequestSnapshot(request) = action else {
        return true;
    };
    debug!(symbol = %symbol, depth = request.depth, "Requesting snapshot");
    match requests.try_send(request) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(request)) => {
            warn!(symbol = %symbol, "Snapshot request channel full, deferring");
            *deferred = Some(request);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(symbol = %symbol, "Snapshot request channel closed");
            false
        }
    }
}

/// Registry of running feeds, keyed by symbol.
pub struct MarketDataHub {
    config: SyncConfig,
    requests: mpsc::Sender<SnapshotRequest>,
    feeds: BTreeMap<MarketId, FeedHandle>,
}

impl MarketDataHub {
    /// `requests` receives every snapshot fetch from every symbol.
    pub fn new(
        config: SyncConfig,
        requests: mpsc::Sender<SnapshotRequest>,
    ) -> Result<Self, HubError> {
        config.validate()?;
        Ok(Self {
            config,
            requests,
            feeds: BTreeMap::new(),
        })
    }

    /// Start syncing `symbol`. Returns the sender the transport pushes into.
    pub fn subscribe(&mut self, symbol: MarketId) -> Result<mpsc::Sender<FeedEvent>, HubError> {
        self.subscribe_with(symbol, self.config.clone())
    }

    /// Like `subscribe`, with settings for this symbol only.
    pub fn subscribe_with(
        &mut self,
        symbol: MarketId,
        config: SyncConfig,
    ) -> Result<mpsc::Sender<FeedEvent>, HubError> {
        if self.feeds.contains_key(&symbol) {
            return Err(HubError::AlreadySubscribed(symbol));
        }
        let handle = spawn_feed(symbol.clone(), &config, self.requests.clone())?;
        let sender = handle.sender();
        self.feeds.insert(symbol, handle);
        Ok(sender)
    }

    /// Stop syncing `symbol` and discard its state.
    pub fn unsubscribe(&mut self, symbol: &MarketId) -> Result<(), HubError> {
        let handle = self
            .feeds
            .remove(symbol)
            .ok_or_else(|| HubError::NotSubscribed(symbol.clone()))?;
        info!(symbol = %symbol, "Unsubscribed");
        handle.abort();
        Ok(())
    }

    pub async fn push(&self, symbol: &MarketId, event: FeedEvent) -> Result<(), HubError> {
        self.feed(symbol)?.push(event).await
    }

    pub fn current_book(&self, symbol: &MarketId) -> Result<BookView, HubError> {
        Ok(self.feed(symbol)?.view.borrow().book.clone())
    }

    /// Switch the symbol's chart to a preset range. The candle series is
    /// cleared and refills from the next `CandleHistory`; the book is kept.
    pub async fn set_chart_period(&self, symbol: &MarketId, period: ChartPeriod) -> Result<(), HubError> {
        let event = FeedEvent::ConfigureCandles {
            interval_ms: period.timeframe().duration_ms(),
            capacity: period.capacity(),
        };
        self.feed(symbol)?.push(event).await
    }

    pub fn current_ticker(&self, symbol: &MarketId) -> Result<Option<TickerStats>, HubError> {
        Ok(self.feed(symbol)?.view.borrow().ticker)
    }

    pub fn current_candles(&self, symbol: &MarketId) -> Result<Vec<Candle>, HubError> {
        Ok(self.feed(symbol)?.view.borrow().candles.clone())
    }

    pub fn sync_state(&self, symbol: &MarketId) -> Result<SyncState, HubError> {
        Ok(self.feed(symbol)?.view.borrow().state)
    }

    pub fn view(&self, symbol: &MarketId) -> Result<MarketView, HubError> {
        Ok(self.feed(symbol)?.view())
    }

    pub fn watch(&self, symbol: &MarketId) -> Result<watch::Receiver<MarketView>, HubError> {
        Ok(self.feed(symbol)?.watch())
    }

    pub fn metrics(&self, symbol: &MarketId) -> Result<BTreeMap<String, u64>, HubError> {
        Ok(self.feed(symbol)?.metrics.export())
    }

    /// Subscribed symbols, sorted.
    pub fn symbols(&self) -> Vec<MarketId> {
        self.feeds.keys().cloned().collect()
    }

    /// Whether the symbol's task is still consuming events.
    pub fn is_running(&self, symbol: &MarketId) -> bool {
        self.feeds
            .get(symbol)
            .is_some_and(|handle| !handle.is_finished())
    }

    fn feed(&self, symbol: &MarketId) -> Result<&FeedHandle, HubError> {
        self.feeds
            .get(symbol)
            .ok_or_else(|| HubError::NotSubscribed(symbol.clone()))
    }
}

impl Drop for MarketDataHub {
    fn drop(&mut self) {
        for handle in self.feeds.values() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::Candle;
    use crate::events::{OrderBookDelta, OrderBookSnapshot, PriceLevel, PriceTick};
    use std::time::Duration;
    use types::numeric::{Price, Quantity};

    fn apt() -> MarketId {
        MarketId::new("APT/USDC")
    }

    fn level(price: u64, qty: u64) -> PriceLevel {
        PriceLevel::new(Price::from_u64(price), Quantity::from_u64(qty))
    }

    fn snapshot(symbol: MarketId, seq: u64) -> FeedEvent {
        FeedEvent::Snapshot(OrderBookSnapshot {
            symbol,
            last_sequence: seq,
            bids: vec![level(100, 5)],
            asks: vec![level(101, 5)],
        })
    }

    async fn wait_until(rx: &mut watch::Receiver<MarketView>, pred: impl Fn(&MarketView) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pred(&rx.borrow_and_update()) {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("view never reached expected state");
    }

    #[tokio::test]
    async fn test_feed_requests_snapshot_on_start() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let handle = spawn_feed(apt(), &SyncConfig::default(), req_tx).unwrap();

        let request = req_rx.recv().await.unwrap();
        assert_eq!(request.symbol, apt());
        assert_eq!(request.depth, 20);
        assert_eq!(handle.view().state, SyncState::Resyncing);
        assert!(handle.view().book.is_empty());
    }

    #[tokio::test]
    async fn test_feed_publishes_synced_view() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let handle = spawn_feed(apt(), &SyncConfig::default(), req_tx).unwrap();
        req_rx.recv().await.unwrap();

        handle.push(snapshot(apt(), 50)).await.unwrap();
        handle
            .push(FeedEvent::Delta(OrderBookDelta {
                symbol: apt(),
                first_sequence: 51,
                final_sequence: 52,
                bid_changes: vec![level(100, 0), level(99, 3)],
                ask_changes: vec![],
            }))
            .await
            .unwrap();

        let mut rx = handle.watch();
        wait_until(&mut rx, |v| v.book.last_sequence == 52).await;

        let view = handle.view();
        assert_eq!(view.state, SyncState::Synced);
        assert_eq!(view.book.bids, vec![level(99, 3)]);
        assert_eq!(view.book.asks, vec![level(101, 5)]);
    }

    #[tokio::test]
    async fn test_feed_closes_when_senders_dropped() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let handle = spawn_feed(apt(), &SyncConfig::default(), req_tx).unwrap();
        assert_eq!(handle.close().await, Some(FeedExit::Closed));
    }

    #[tokio::test]
    async fn test_feed_stops_when_transport_gone() {
        let (req_tx, req_rx) = mpsc::channel(8);
        drop(req_rx);
        let handle = spawn_feed(apt(), &SyncConfig::default(), req_tx).unwrap();
        assert_eq!(handle.close().await, Some(FeedExit::TransportGone));
    }

    #[tokio::test]
    async fn test_hub_subscribe_and_query() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let mut hub = MarketDataHub::new(SyncConfig::default(), req_tx).unwrap();

        let apt_tx = hub.subscribe(apt()).unwrap();
        hub.subscribe(MarketId::new("BTC/USDT")).unwrap();
        assert_eq!(
            hub.subscribe(apt()).unwrap_err(),
            HubError::AlreadySubscribed(apt())
        );
        assert_eq!(hub.symbols(), vec![apt(), MarketId::new("BTC/USDT")]);

        req_rx.recv().await.unwrap();
        req_rx.recv().await.unwrap();

        apt_tx.send(snapshot(apt(), 7)).await.unwrap();
        let mut rx = hub.watch(&apt()).unwrap();
        wait_until(&mut rx, |v| v.state == SyncState::Synced).await;

        assert_eq!(hub.sync_state(&apt()).unwrap(), SyncState::Synced);
        assert_eq!(hub.current_book(&apt()).unwrap().last_sequence, 7);
        assert!(hub.current_candles(&apt()).unwrap().is_empty());
        assert_eq!(
            hub.sync_state(&MarketId::new("BTC/USDT")).unwrap(),
            SyncState::Resyncing
        );
        assert_eq!(hub.metrics(&apt()).unwrap()["snapshots_applied"], 1);
    }

    #[tokio::test]
    async fn test_hub_unsubscribe() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let mut hub = MarketDataHub::new(SyncConfig::default(), req_tx).unwrap();
        let tx = hub.subscribe(apt()).unwrap();

        hub.unsubscribe(&apt()).unwrap();
        assert!(hub.symbols().is_empty());
        assert_eq!(
            hub.current_book(&apt()).unwrap_err(),
            HubError::NotSubscribed(apt())
        );
        assert_eq!(
            hub.unsubscribe(&apt()).unwrap_err(),
            HubError::NotSubscribed(apt())
        );

        // The aborted task no longer receives.
        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_feed_keeps_consuming_when_request_channel_full() {
        let (req_tx, mut req_rx) = mpsc::channel(1);
        req_tx.try_send(SnapshotRequest { symbol: MarketId::new("BTC/USDT"), depth: 5 }).unwrap();

        let handle = spawn_feed(apt(), &SyncConfig::default(), req_tx).unwrap();
        handle
            .push(FeedEvent::CandleHistory {
                candles: vec![Candle::new(Price::from_u64(10), 0)],
            })
            .await
            .unwrap();

        let mut rx = handle.watch();
        wait_until(&mut rx, |v| v.candles.len() == 1).await;
        assert_eq!(handle.view().state, SyncState::Resyncing);

        let first = req_rx.recv().await.unwrap();
        assert_eq!(first.symbol, MarketId::new("BTC/USDT"));
        let deferred = tokio::time::timeout(Duration::from_secs(5), req_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deferred.symbol, apt());
        assert_eq!(deferred.depth, 20);
    }

    #[tokio::test]
    async fn test_feed_publishes_ticker_stats() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let handle = spawn_feed(apt(), &SyncConfig::default(), req_tx).unwrap();
        assert_eq!(handle.view().ticker, None);

        let stats = TickerStats {
            change: "-0.25".parse().unwrap(),
            change_percent: "-2.4".parse().unwrap(),
            high: Price::from_u64(11),
            low: Price::from_u64(9),
            quote_volume: Quantity::from_u64(1_000),
        };
        handle
            .push(FeedEvent::Ticker {
                tick: PriceTick::new(Price::from_u64(10), 60_000),
                stats,
            })
            .await
            .unwrap();

        let mut rx = handle.watch();
        wait_until(&mut rx, |v| v.ticker.is_some()).await;
        assert_eq!(handle.view().ticker, Some(stats));
    }

    #[tokio::test]
    async fn test_hub_set_chart_period() {
        const HOUR: u64 = 3_600_000;
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let mut hub = MarketDataHub::new(SyncConfig::default(), req_tx).unwrap();
        let tx = hub.subscribe(apt()).unwrap();
        req_rx.recv().await.unwrap();

        tx.send(snapshot(apt(), 7)).await.unwrap();
        tx.send(FeedEvent::CandleHistory {
            candles: vec![Candle::new(Price::from_u64(10), 0), Candle::new(Price::from_u64(11), HOUR)],
        })
        .await
        .unwrap();
        let mut rx = hub.watch(&apt()).unwrap();
        wait_until(&mut rx, |v| v.candles.len() == 2).await;

        hub.set_chart_period(&apt(), ChartPeriod::Week).await.unwrap();
        wait_until(&mut rx, |v| v.candles.is_empty()).await;
        assert_eq!(hub.sync_state(&apt()).unwrap(), SyncState::Synced);
        assert_eq!(hub.current_book(&apt()).unwrap().last_sequence, 7);

        tx.send(FeedEvent::CandleHistory {
            candles: vec![Candle::new(Price::from_u64(10), 0), Candle::new(Price::from_u64(12), 4 * HOUR)],
        })
        .await
        .unwrap();
        // Hour 6 falls in the 4h bucket that opened at hour 4.
        tx.send(FeedEvent::Tick(PriceTick::new(Price::from_u64(15), 6 * HOUR)))
            .await
            .unwrap();
        wait_until(&mut rx, |v| v.candles.last().is_some_and(|c| c.high == Price::from_u64(15))).await;

        let candles = hub.current_candles(&apt()).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].bucket_start, 4 * HOUR);
        assert_eq!(candles[1].open, Price::from_u64(12));
        assert_eq!(candles[1].close, Price::from_u64(15));

        assert_eq!(
            hub.set_chart_period(&MarketId::new("BTC/USDT"), ChartPeriod::Day)
                .await
                .unwrap_err(),
            HubError::NotSubscribed(MarketId::new("BTC/USDT"))
        );
    }

    #[tokio::test]
    async fn test_hub_rejects_invalid_config() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let config = SyncConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            MarketDataHub::new(config, req_tx),
            Err(HubError::Config(_))
        ));
    }
}
