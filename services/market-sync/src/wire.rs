//! Exchange payload decoding
//!
//! Turns Binance-style JSON into feed events for one market. Numbers on the
//! wire are decimal strings; they are parsed exactly, never through `f64`.
//!
//! - REST depth snapshot: `{"lastUpdateId":..,"bids":[[p,q]..],"asks":[[p,q]..]}`
//! - Diff depth stream: `{"e":"depthUpdate","E":..,"s":..,"U":..,"u":..,"b":..,"a":..}`
//! - Ticker stream: `{"e":"24hrTicker","E":..,"s":..,"p":..,"P":..,"c":..,"h":..,"l":..,"q":..}`
//! - REST klines: `[[openTime,"o","h","l","c",...], ...]`

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use types::ids::MarketId;
use types::numeric::{Price, Quantity};

use crate::candles::Candle;
use crate::events::{
    FeedEvent, OrderBookDelta, OrderBookSnapshot, PriceLevel, PriceTick, TickerStats,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("invalid json: {0}")]
    Json(String),

    #[error("unexpected event type {0:?}")]
    UnexpectedEvent(String),

    #[error("payload is for {actual}, decoder is for {expected}")]
    SymbolMismatch { expected: String, actual: String },

    #[error("bad {field} value {value:?}")]
    BadNumber { field: &'static str, value: String },

    #[error("kline row {row}: {reason}")]
    BadKline { row: usize, reason: &'static str },
}

/// Binance depth snapshot (REST API)
#[derive(Debug, Deserialize)]
struct DepthSnapshotDto {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Binance diff depth stream message
#[derive(Debug, Deserialize)]
struct DepthUpdateDto {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/// Binance ticker stream message; only the fields used here.
#[derive(Debug, Deserialize)]
struct TickerDto {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price_change: String,
    #[serde(rename = "P")]
    price_change_percent: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "h")]
    high_price: String,
    #[serde(rename = "l")]
    low_price: String,
    #[serde(rename = "q")]
    quote_volume: String,
}

/// Decodes payloads for a single market.
#[derive(Debug, Clone)]
pub struct WireDecoder {
    market: MarketId,
    /// Exchange spelling of the market, e.g. `APTUSDC`.
    exchange_symbol: String,
}

impl WireDecoder {
    pub fn new(market: MarketId) -> Self {
        let exchange_symbol = market.compact().to_ascii_uppercase();
        Self {
            market,
            exchange_symbol,
        }
    }

    pub fn exchange_symbol(&self) -> &str {
        &self.exchange_symbol
    }

    pub fn decode_snapshot(&self, json: &str) -> Result<FeedEvent, WireError> {
        let dto: DepthSnapshotDto = parse(json)?;
        Ok(FeedEvent::Snapshot(OrderBookSnapshot {
            symbol: self.market.clone(),
            last_sequence: dto.last_update_id,
            bids: parse_levels(&dto.bids)?,
            asks: parse_levels(&dto.asks)?,
        }))
    }

    pub fn decode_depth_update(&self, json: &str) -> Result<FeedEvent, WireError> {
        let dto: DepthUpdateDto = parse(json)?;
        if dto.event_type != "depthUpdate" {
            return Err(WireError::UnexpectedEvent(dto.event_type));
        }
        self.check_symbol(&dto.symbol)?;

        Ok(FeedEvent::Delta(OrderBookDelta {
            symbol: self.market.clone(),
            first_sequence: dto.first_update_id,
            final_sequence: dto.final_update_id,
            bid_changes: parse_levels(&dto.bids)?,
            ask_changes: parse_levels(&dto.asks)?,
        }))
    }

    pub fn decode_ticker(&self, json: &str) -> Result<FeedEvent, WireError> {
        let dto: TickerDto = parse(json)?;
        if dto.event_type != "24hrTicker" {
            return Err(WireError::UnexpectedEvent(dto.event_type));
        }
        self.check_symbol(&dto.symbol)?;

        let tick = PriceTick::new(parse_price("price", &dto.last_price)?, dto.event_time);
        let stats = TickerStats {
            change: parse_decimal("price change", &dto.price_change)?,
            change_percent: parse_decimal("price change percent", &dto.price_change_percent)?,
            high: parse_price("high", &dto.high_price)?,
            low: parse_price("low", &dto.low_price)?,
            quote_volume: parse_quantity("quote volume", &dto.quote_volume)?,
        };
        Ok(FeedEvent::Ticker { tick, stats })
    }

    /// Decode a kline array into a candle history event.
    pub fn decode_klines(&self, json: &str) -> Result<FeedEvent, WireError> {
        let rows: Vec<Vec<Value>> = parse(json)?;
        let candles = rows
            .iter()
            .enumerate()
            .map(|(row, fields)| parse_kline(row, fields))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeedEvent::CandleHistory { candles })
    }

    /// Route a stream message by its `e` field.
    pub fn decode_stream(&self, json: &str) -> Result<FeedEvent, WireError> {
        let value: Value = parse(json)?;
        match value.get("e").and_then(Value::as_str) {
            Some("depthUpdate") => self.decode_depth_update(json),
            Some("24hrTicker") => self.decode_ticker(json),
            Some(other) => Err(WireError::UnexpectedEvent(other.to_string())),
            None => Err(WireError::UnexpectedEvent(String::new())),
        }
    }

    fn check_symbol(&self, actual: &str) -> Result<(), WireError> {
        if !actual.eq_ignore_ascii_case(&self.exchange_symbol) {
            return Err(WireError::SymbolMismatch {
                expected: self.exchange_symbol.clone(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

fn parse<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, WireError> {
    serde_json::from_str(json).map_err(|e| WireError::Json(e.to_string()))
}

fn parse_price(field: &'static str, value: &str) -> Result<Price, WireError> {
    value.parse().map_err(|_| WireError::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_quantity(field: &'static str, value: &str) -> Result<Quantity, WireError> {
    value.parse().map_err(|_| WireError::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, WireError> {
    Decimal::from_str_exact(value.trim()).map_err(|_| WireError::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, WireError> {
    raw.iter()
        .map(|[price, qty]| Ok(PriceLevel::new(parse_price("price", price)?, parse_quantity("quantity", qty)?)))
        .collect()
}

fn parse_kline(row: usize, fields: &[Value]) -> Result<Candle, WireError> {
    if fields.len() < 5 {
        return Err(WireError::BadKline {
            row,
            reason: "fewer than 5 fields",
        });
    }
    let open_time = fields[0].as_u64().ok_or(WireError::BadKline {
        row,
        reason: "open time is not an integer",
    })?;

    let mut ohlc = [Price::from_u64(1); 4];
    for (slot, (field, value)) in ohlc
        .iter_mut()
        .zip(["open", "high", "low", "close"].into_iter().zip(&fields[1..5]))
    {
        let text = value.as_str().ok_or(WireError::BadKline {
            row,
            reason: "price is not a string",
        })?;
        *slot = parse_price(field, text)?;
    }
    let [open, high, low, close] = ohlc;

    Ok(Candle {
        bucket_start: open_time,
        open,
        high,
        low,
        close,
    })
}
