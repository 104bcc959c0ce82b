//! OHLC candle aggregation from price ticks
//!
//! Folds last-trade ticks into a bounded, time-bucketed candle series.
//! Bucket boundaries are aligned to the epoch (1h candles open on the hour).
//! All prices are `Decimal`-backed, so high/low comparisons are exact.
//!
//! The aggregator never fabricates the first candle: the series has to be
//! seeded from historical candles before ticks are accepted. Only the last
//! candle is ever updated in place; a tick for an earlier bucket is ignored
//! rather than rewriting history.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use types::numeric::Price;

use crate::events::PriceTick;

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute
    M1,
    /// 5 minutes
    M5,
    /// 15 minutes
    M15,
    /// 30 minutes
    M30,
    /// 1 hour
    H1,
    /// 4 hours
    H4,
    /// 1 day
    D1,
    /// 1 week
    W1,
}

impl Timeframe {
    /// Duration of this timeframe in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        match self {
            Timeframe::M1 => 60 * 1_000,
            Timeframe::M5 => 5 * 60 * 1_000,
            Timeframe::M15 => 15 * 60 * 1_000,
            Timeframe::M30 => 30 * 60 * 1_000,
            Timeframe::H1 => 3600 * 1_000,
            Timeframe::H4 => 4 * 3600 * 1_000,
            Timeframe::D1 => 86400 * 1_000,
            Timeframe::W1 => 7 * 86400 * 1_000,
        }
    }

    /// Align a timestamp to this timeframe's boundary (floor).
    pub fn align_to_boundary(&self, timestamp_ms: u64) -> u64 {
        align(timestamp_ms, self.duration_ms())
    }
}

/// Chart ranges offered by the token detail screen, each mapped to a
/// candle timeframe and the number of candles that cover the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChartPeriod {
    /// 24 hourly candles
    Day,
    /// 42 four-hour candles
    Week,
    /// 30 daily candles
    Month,
    /// Up to 365 daily candles
    YearToDate,
}

impl ChartPeriod {
    pub fn timeframe(&self) -> Timeframe {
        match self {
            ChartPeriod::Day => Timeframe::H1,
            ChartPeriod::Week => Timeframe::H4,
            ChartPeriod::Month => Timeframe::D1,
            ChartPeriod::YearToDate => Timeframe::D1,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            ChartPeriod::Day => 24,
            ChartPeriod::Week => 42,
            ChartPeriod::Month => 30,
            ChartPeriod::YearToDate => 365,
        }
    }
}

/// What to do with buckets skipped between two ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapFill {
    /// Leave skipped buckets out of the series.
    #[default]
    None,
    /// Insert flat candles at the previous close for skipped buckets.
    Flat,
}

/// A single OHLC candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time, Unix milliseconds aligned to the interval.
    pub bucket_start: u64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
}

impl Candle {
    /// Create a new candle from the first tick in this bucket.
    pub fn new(price: Price, bucket_start: u64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// Create a flat (no-trade) candle for backfill.
    fn flat(prev_close: Price, bucket_start: u64) -> Self {
        Self::new(prev_close, bucket_start)
    }

    /// Update the candle with a new tick.
    fn update(&mut self, price: Price) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
    }

    /// Validate candle integrity (OHLC invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// Why a tick did not touch the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No historical candles have been seeded yet.
    NoHistory,
    /// The tick falls in a bucket before the open one.
    PastBucket,
    /// The tick is older than one already accepted.
    OutOfOrder,
}

/// Result of ingesting one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleEvent {
    /// A new candle was appended.
    Started(Candle),
    /// The open candle was updated in place.
    Updated(Candle),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandleError {
    #[error("candle interval must be at least 1ms")]
    ZeroInterval,

    #[error("candle capacity must be at least 1")]
    ZeroCapacity,

    #[error("candle at {bucket_start} is not aligned to {interval_ms}ms")]
    Misaligned { bucket_start: u64, interval_ms: u64 },

    #[error("candle at {bucket_start} does not follow the previous bucket")]
    NotAscending { bucket_start: u64 },

    #[error("candle at {bucket_start} has inconsistent OHLC values")]
    InvalidOhlc { bucket_start: u64 },
}

/// Bounded OHLC series for one symbol at one interval.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    interval_ms: u64,
    capacity: usize,
    gap_fill: GapFill,
    /// Ascending by bucket_start; the back is the open candle.
    candles: VecDeque<Candle>,
    /// Timestamp of the newest accepted tick.
    last_tick_ms: Option<u64>,
}

impl CandleAggregator {
    pub fn new(interval: Duration, capacity: usize) -> Result<Self, CandleError> {
        let interval_ms = interval_to_ms(interval)?;
        if capacity == 0 {
            return Err(CandleError::ZeroCapacity);
        }
        Ok(Self {
            interval_ms,
            capacity,
            gap_fill: GapFill::None,
            candles: VecDeque::with_capacity(capacity),
            last_tick_ms: None,
        })
    }

    pub fn with_gap_fill(mut self, gap_fill: GapFill) -> Self {
        self.gap_fill = gap_fill;
        self
    }

    /// Change interval and capacity. The series is cleared and the gap
    /// fill policy is kept.
    pub fn configure(&mut self, interval: Duration, capacity: usize) -> Result<(), CandleError> {
        let interval_ms = interval_to_ms(interval)?;
        if capacity == 0 {
            return Err(CandleError::ZeroCapacity);
        }
        self.interval_ms = interval_ms;
        self.capacity = capacity;
        self.candles = VecDeque::with_capacity(capacity);
        self.last_tick_ms = None;
        Ok(())
    }

    /// Replace the series with historical candles.
    ///
    /// Candles must be aligned to the interval, OHLC-consistent and strictly
    /// ascending. Only the newest `capacity` are kept. Returns the number kept.
    pub fn seed(&mut self, history: &[Candle]) -> Result<usize, CandleError> {
        let mut prev: Option<u64> = None;
        for candle in history {
            if candle.bucket_start % self.interval_ms != 0 {
                return Err(CandleError::Misaligned {
                    bucket_start: candle.bucket_start,
                    interval_ms: self.interval_ms,
                });
            }
            if !candle.is_valid() {
                return Err(CandleError::InvalidOhlc {
                    bucket_start: candle.bucket_start,
                });
            }
            if prev.is_some_and(|p| candle.bucket_start <= p) {
                return Err(CandleError::NotAscending {
                    bucket_start: candle.bucket_start,
                });
            }
            prev = Some(candle.bucket_start);
        }

        let skip = history.len().saturating_sub(self.capacity);
        self.candles = history[skip..].iter().copied().collect();
        self.last_tick_ms = None;
        Ok(self.candles.len())
    }

    /// Fold one tick into the series.
    pub fn ingest(&mut self, tick: &PriceTick) -> CandleEvent {
        let Some(last) = self.candles.back().copied() else {
            return CandleEvent::Ignored(IgnoreReason::NoHistory);
        };

        if self.last_tick_ms.is_some_and(|t| tick.timestamp_ms < t) {
            return CandleEvent::Ignored(IgnoreReason::OutOfOrder);
        }

        let bucket_start = align(tick.timestamp_ms, self.interval_ms);
        if bucket_start < last.bucket_start {
            return CandleEvent::Ignored(IgnoreReason::PastBucket);
        }
        self.last_tick_ms = Some(tick.timestamp_ms);

        if bucket_start == last.bucket_start {
            let open = self.candles.back_mut().map(|candle| {
                candle.update(tick.price);
                *candle
            });
            return match open {
                Some(candle) => CandleEvent::Updated(candle),
                None => CandleEvent::Ignored(IgnoreReason::NoHistory),
            };
        }

        if self.gap_fill == GapFill::Flat {
            self.backfill(last, bucket_start);
        }

        let candle = Candle::new(tick.price, bucket_start);
        self.candles.push_back(candle);
        self.trim_history();
        CandleEvent::Started(candle)
    }

    /// Insert flat candles for buckets strictly between `last` and
    /// `next_bucket`, skipping any that would be evicted immediately.
    fn backfill(&mut self, last: Candle, next_bucket: u64) {
        let keep_span = (self.capacity as u64 - 1).saturating_mul(self.interval_ms);
        let earliest_kept = next_bucket.saturating_sub(keep_span);
        let mut t = (last.bucket_start + self.interval_ms).max(earliest_kept);

        while t < next_bucket {
            self.candles.push_back(Candle::flat(last.close, t));
            t += self.interval_ms;
        }
    }

    /// Trim history to capacity, oldest first.
    fn trim_history(&mut self) {
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    /// Point-in-time copy, ascending by bucket_start.
    pub fn candles(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    /// The open (most recent) candle.
    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn gap_fill(&self) -> GapFill {
        self.gap_fill
    }
}

fn align(timestamp_ms: u64, interval_ms: u64) -> u64 {
    (timestamp_ms / interval_ms) * interval_ms
}

fn interval_to_ms(interval: Duration) -> Result<u64, CandleError> {
    match u64::try_from(interval.as_millis()) {
        Ok(0) => Err(CandleError::ZeroInterval),
        Ok(ms) => Ok(ms),
        Err(_) => Ok(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000;

    fn price(v: u64) -> Price {
        Price::from_u64(v)
    }

    fn tick(ts: u64, p: u64) -> PriceTick {
        PriceTick::new(price(p), ts)
    }

    fn hourly(capacity: usize) -> CandleAggregator {
        CandleAggregator::new(Duration::from_millis(HOUR), capacity).unwrap()
    }

    fn seeded(capacity: usize) -> CandleAggregator {
        let mut agg = hourly(capacity);
        agg.seed(&[Candle::new(price(10), 0)]).unwrap();
        agg
    }

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::M1.duration_ms(), 60_000);
        assert_eq!(Timeframe::H1.duration_ms(), 3_600_000);
        assert_eq!(Timeframe::D1.duration_ms(), 86_400_000);
    }

    #[test]
    fn test_timeframe_alignment() {
        let ts = 5 * 60_000 + 30_000; // 5m30s
        assert_eq!(Timeframe::M1.align_to_boundary(ts), 5 * 60_000);
        assert_eq!(Timeframe::M5.align_to_boundary(ts), 5 * 60_000);
        assert_eq!(Timeframe::M15.align_to_boundary(ts), 0);
    }

    #[test]
    fn test_chart_period_presets() {
        assert_eq!(ChartPeriod::Week.timeframe().duration_ms(), 4 * HOUR);
        assert_eq!(ChartPeriod::Week.capacity(), 42);
        assert_eq!(ChartPeriod::YearToDate.capacity(), 365);
        assert_eq!(ChartPeriod::Day.timeframe(), Timeframe::H1);
    }

    #[test]
    fn test_empty_series_ignores_ticks() {
        let mut agg = hourly(24);
        assert_eq!(agg.ingest(&tick(1_000, 5)), CandleEvent::Ignored(IgnoreReason::NoHistory));
        assert!(agg.is_empty());
    }

    #[test]
    fn test_bucketing_scenario() {
        let mut agg = seeded(24);

        let event = agg.ingest(&tick(1_800_000, 12));
        let expected = Candle {
            bucket_start: 0,
            open: price(10),
            high: price(12),
            low: price(10),
            close: price(12),
        };
        assert_eq!(event, CandleEvent::Updated(expected));

        let event = agg.ingest(&tick(3_700_000, 8));
        assert_eq!(event, CandleEvent::Started(Candle::new(price(8), HOUR)));
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.candles()[0], expected);
    }

    #[test]
    fn test_capacity_eviction() {
        let mut agg = seeded(2);
        for i in 1..=3u64 {
            let event = agg.ingest(&tick(i * HOUR + 1, 10 + i));
            assert!(matches!(event, CandleEvent::Started(_)));
            assert!(agg.len() <= 2);
        }
        let buckets: Vec<u64> = agg.candles().iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![2 * HOUR, 3 * HOUR]);
    }

    #[test]
    fn test_past_bucket_ignored() {
        let mut agg = hourly(24);
        agg.seed(&[Candle::new(price(10), 0), Candle::new(price(11), HOUR)])
            .unwrap();
        assert_eq!(
            agg.ingest(&tick(HOUR - 1, 99)),
            CandleEvent::Ignored(IgnoreReason::PastBucket)
        );
        assert_eq!(agg.candles()[0], Candle::new(price(10), 0));
    }

    #[test]
    fn test_out_of_order_tick_ignored() {
        let mut agg = seeded(24);
        agg.ingest(&tick(2_000, 11));
        assert_eq!(
            agg.ingest(&tick(1_000, 50)),
            CandleEvent::Ignored(IgnoreReason::OutOfOrder)
        );
        assert_eq!(agg.last().unwrap().close, price(11));
        // Equal timestamps are fine.
        assert!(matches!(agg.ingest(&tick(2_000, 9)), CandleEvent::Updated(_)));
    }

    #[test]
    fn test_no_filler_candles_by_default() {
        let mut agg = seeded(24);
        agg.ingest(&tick(5 * HOUR, 20));
        let buckets: Vec<u64> = agg.candles().iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![0, 5 * HOUR]);
    }

    #[test]
    fn test_flat_gap_fill() {
        let mut agg = seeded(24).with_gap_fill(GapFill::Flat);
        agg.ingest(&tick(3 * HOUR + 5, 20));
        let candles = agg.candles();
        assert_eq!(candles.len(), 4);
        assert_eq!(candles[1], Candle::new(price(10), HOUR));
        assert_eq!(candles[2], Candle::new(price(10), 2 * HOUR));
        assert_eq!(candles[3], Candle::new(price(20), 3 * HOUR));
    }

    #[test]
    fn test_flat_gap_fill_bounded_by_capacity() {
        let mut agg = seeded(3).with_gap_fill(GapFill::Flat);
        agg.ingest(&tick(1_000 * HOUR, 20));
        let buckets: Vec<u64> = agg.candles().iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![998 * HOUR, 999 * HOUR, 1_000 * HOUR]);
    }

    #[test]
    fn test_seed_keeps_newest() {
        let mut agg = hourly(2);
        let history: Vec<Candle> = (0..5).map(|i| Candle::new(price(10 + i), i * HOUR)).collect();
        assert_eq!(agg.seed(&history).unwrap(), 2);
        assert_eq!(agg.candles()[0].bucket_start, 3 * HOUR);
    }

    #[test]
    fn test_seed_validation() {
        let mut agg = hourly(24);
        assert_eq!(
            agg.seed(&[Candle::new(price(10), 5)]),
            Err(CandleError::Misaligned {
                bucket_start: 5,
                interval_ms: HOUR
            })
        );
        assert_eq!(
            agg.seed(&[Candle::new(price(10), HOUR), Candle::new(price(10), HOUR)]),
            Err(CandleError::NotAscending { bucket_start: HOUR })
        );
        let invalid = Candle {
            bucket_start: 0,
            open: price(10),
            high: price(9),
            low: price(8),
            close: price(9),
        };
        assert_eq!(
            agg.seed(&[invalid]),
            Err(CandleError::InvalidOhlc { bucket_start: 0 })
        );
    }

    #[test]
    fn test_configure_resets_series() {
        let mut agg = seeded(24).with_gap_fill(GapFill::Flat);
        agg.configure(Duration::from_secs(60), 10).unwrap();
        assert!(agg.is_empty());
        assert_eq!(agg.interval_ms(), 60_000);
        assert_eq!(agg.capacity(), 10);
        assert_eq!(agg.gap_fill(), GapFill::Flat);
        assert_eq!(agg.configure(Duration::ZERO, 10), Err(CandleError::ZeroInterval));
        assert_eq!(agg.configure(Duration::from_secs(1), 0), Err(CandleError::ZeroCapacity));
    }

    #[test]
    fn test_candle_integrity_after_updates() {
        let mut agg = seeded(24);
        for (ts, p) in [(10, 15), (20, 7), (30, 12)] {
            agg.ingest(&tick(ts, p));
        }
        let candle = *agg.last().unwrap();
        assert!(candle.is_valid());
        assert_eq!(candle.high, price(15));
        assert_eq!(candle.low, price(7));
        assert_eq!(candle.close, price(12));
        assert_eq!(candle.open, price(10));
    }
}
