//! Per-symbol synchronization settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::candles::{CandleAggregator, CandleError, ChartPeriod, GapFill, Timeframe};
use crate::order_book::DEFAULT_DEPTH_LIMIT;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    ZeroValue { field: &'static str },

    #[error("invalid config json: {0}")]
    Parse(String),
}

/// Settings for one symbol's book, queue and chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Max price levels kept per side.
    pub depth_limit: usize,
    /// Max deltas buffered while resyncing; oldest dropped first.
    pub pending_capacity: usize,
    /// Bound of the inbound event channel.
    pub channel_capacity: usize,
    pub candle: CandleConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            depth_limit: DEFAULT_DEPTH_LIMIT,
            pending_capacity: 1000,
            channel_capacity: 1024,
            candle: CandleConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth_limit == 0 {
            return Err(ConfigError::ZeroValue { field: "depth_limit" });
        }
        if self.pending_capacity == 0 {
            return Err(ConfigError::ZeroValue {
                field: "pending_capacity",
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroValue {
                field: "channel_capacity",
            });
        }
        self.candle.validate()
    }

    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_candle(mut self, candle: CandleConfig) -> Self {
        self.candle = candle;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandleConfig {
    pub interval_ms: u64,
    pub capacity: usize,
    pub gap_fill: GapFill,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self::for_period(ChartPeriod::Day)
    }
}

impl CandleConfig {
    pub fn for_period(period: ChartPeriod) -> Self {
        Self {
            interval_ms: period.timeframe().duration_ms(),
            capacity: period.capacity(),
            gap_fill: GapFill::None,
        }
    }

    pub fn for_timeframe(timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            interval_ms: timeframe.duration_ms(),
            capacity,
            gap_fill: GapFill::None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::ZeroValue {
                field: "candle.interval_ms",
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroValue {
                field: "candle.capacity",
            });
        }
        Ok(())
    }

    pub fn build(&self) -> Result<CandleAggregator, CandleError> {
        Ok(
            CandleAggregator::new(Duration::from_millis(self.interval_ms), self.capacity)?
                .with_gap_fill(self.gap_fill),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.depth_limit, 20);
        assert_eq!(config.pending_capacity, 1000);
        assert_eq!(config.candle.interval_ms, 3_600_000);
        assert_eq!(config.candle.capacity, 24);
        assert_eq!(config.candle.gap_fill, GapFill::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = SyncConfig {
            depth_limit: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue { field: "depth_limit" })
        );

        let config = SyncConfig::default().with_candle(CandleConfig {
            capacity: 0,
            ..Default::default()
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue {
                field: "candle.capacity"
            })
        );
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            SyncConfig::from_json(r#"{"depth_limit": 50, "candle": {"gap_fill": "flat"}}"#).unwrap();
        assert_eq!(config.depth_limit, 50);
        assert_eq!(config.pending_capacity, 1000);
        assert_eq!(config.candle.gap_fill, GapFill::Flat);
        assert_eq!(config.candle.capacity, 24);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            SyncConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SyncConfig::from_json(r#"{"channel_capacity": 0}"#),
            Err(ConfigError::ZeroValue { .. })
        ));
    }

    #[test]
    fn test_period_presets() {
        let week = CandleConfig::for_period(ChartPeriod::Week);
        assert_eq!(week.interval_ms, 4 * 3_600_000);
        assert_eq!(week.capacity, 42);

        let agg = CandleConfig::for_timeframe(Timeframe::M15, 96).build().unwrap();
        assert_eq!(agg.interval_ms(), 900_000);
        assert_eq!(agg.capacity(), 96);
    }
}
