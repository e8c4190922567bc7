//! Parsed market updates
//!
//! The relay forwards exchange frames untouched. Consumers that want typed
//! data parse them here: ticker frames into [`TickerUpdate`] and level-2
//! book frames into [`OrderBookUpdate`]. Every field is optional because
//! the exchange sends partial frames.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::normalize_symbol;
use crate::error::RelayResult;
use crate::serde_util::{decimal, decimal_opt};

/// Channels carrying ticker frames
pub const TICKER_CHANNELS: &[&str] = &["v2/ticker", "ticker"];

/// Channels carrying level-2 book frames
pub const ORDERBOOK_CHANNELS: &[&str] = &["l2_orderbook"];

// ============================================================================
// Exchange frame shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeltaQuotes {
    #[serde(default, deserialize_with = "decimal_opt")]
    best_bid: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    best_ask: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    bid_size: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    ask_size: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct DeltaTickerFrame {
    symbol: String,
    #[serde(default, deserialize_with = "decimal_opt")]
    close: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    mark_price: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    spot_price: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    open: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    high: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    low: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    volume: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    turnover: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    mark_change_24h: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    ltp_change_24h: Option<Decimal>,
    #[serde(default)]
    quotes: Option<DeltaQuotes>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DeltaBookLevel {
    #[serde(deserialize_with = "decimal")]
    limit_price: Decimal,
    #[serde(deserialize_with = "decimal")]
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct DeltaBookFrame {
    symbol: String,
    #[serde(default)]
    buy: Option<Vec<DeltaBookLevel>>,
    #[serde(default)]
    sell: Option<Vec<DeltaBookLevel>>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Exchange timestamps are microseconds since the epoch
fn from_micros(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(DateTime::from_timestamp_micros)
}

// ============================================================================
// Normalized updates
// ============================================================================

/// Partial ticker update; `None` means "not present in this frame"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: String,
    pub last_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub spot_price: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub bid_size: Option<Decimal>,
    pub ask_size: Option<Decimal>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub turnover: Option<Decimal>,
    pub change_24h: Option<Decimal>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TickerUpdate {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// Parse a ticker frame
    pub fn from_value(data: &Value) -> RelayResult<Self> {
        let frame = DeltaTickerFrame::deserialize(data)?;
        let quotes = frame.quotes;

        Ok(Self {
            symbol: normalize_symbol(&frame.symbol),
            last_price: frame.close,
            mark_price: frame.mark_price,
            spot_price: frame.spot_price,
            best_bid: quotes.as_ref().and_then(|q| q.best_bid),
            best_ask: quotes.as_ref().and_then(|q| q.best_ask),
            bid_size: quotes.as_ref().and_then(|q| q.bid_size),
            ask_size: quotes.as_ref().and_then(|q| q.ask_size),
            open: frame.open,
            high: frame.high,
            low: frame.low,
            volume: frame.volume,
            turnover: frame.turnover,
            change_24h: frame.mark_change_24h.or(frame.ltp_change_24h),
            timestamp: from_micros(frame.timestamp),
        })
    }
}

/// A price level in the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl OrderBookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Order book frame; a missing side leaves the previous side untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    pub symbol: String,
    pub bids: Option<Vec<OrderBookLevel>>,
    pub asks: Option<Vec<OrderBookLevel>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderBookUpdate {
    /// Parse a level-2 book frame, sorting bids descending and asks ascending
    pub fn from_value(data: &Value) -> RelayResult<Self> {
        let frame = DeltaBookFrame::deserialize(data)?;

        let convert = |levels: Vec<DeltaBookLevel>| -> Vec<OrderBookLevel> {
            levels
                .into_iter()
                .map(|l| OrderBookLevel::new(l.limit_price, l.size))
                .collect()
        };

        let bids = frame.buy.map(convert).map(|mut levels| {
            levels.sort_by(|a, b| b.price.cmp(&a.price));
            levels
        });
        let asks = frame.sell.map(convert).map(|mut levels| {
            levels.sort_by(|a, b| a.price.cmp(&b.price));
            levels
        });

        Ok(Self {
            symbol: normalize_symbol(&frame.symbol),
            bids,
            asks,
            timestamp: from_micros(frame.timestamp),
        })
    }
}

/// A typed market update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketUpdate {
    Ticker(TickerUpdate),
    OrderBook(OrderBookUpdate),
}

impl MarketUpdate {
    /// Parse `data` according to `channel`.
    ///
    /// Returns `None` for channels that carry neither tickers nor books.
    pub fn parse(channel: &str, data: &Value) -> Option<RelayResult<Self>> {
        if TICKER_CHANNELS.contains(&channel) {
            Some(TickerUpdate::from_value(data).map(Self::Ticker))
        } else if ORDERBOOK_CHANNELS.contains(&channel) {
            Some(OrderBookUpdate::from_value(data).map(Self::OrderBook))
        } else {
            None
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::OrderBook(b) => &b.symbol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_ticker_frame() {
        let frame = json!({
            "type": "v2/ticker",
            "symbol": "BTCUSD",
            "close": 64012.5,
            "mark_price": "64010.1",
            "volume": "1520.25",
            "mark_change_24h": "-1.25",
            "quotes": {"best_bid": "64012", "best_ask": "64013", "bid_size": "12", "ask_size": "7"},
            "timestamp": 1_700_000_000_000_000i64
        });

        let ticker = TickerUpdate::from_value(&frame).unwrap();
        assert_eq!(ticker.symbol, "BTCUSD");
        assert_eq!(ticker.last_price, Some(dec!(64012.5)));
        assert_eq!(ticker.mark_price, Some(dec!(64010.1)));
        assert_eq!(ticker.best_bid, Some(dec!(64012)));
        assert_eq!(ticker.ask_size, Some(dec!(7)));
        assert_eq!(ticker.change_24h, Some(dec!(-1.25)));
        assert_eq!(ticker.high, None);
        assert_eq!(ticker.timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_parse_partial_ticker() {
        let ticker = TickerUpdate::from_value(&json!({"symbol": "ETHUSD", "close": "3100"})).unwrap();
        assert_eq!(ticker.last_price, Some(dec!(3100)));
        assert_eq!(ticker.best_bid, None);
        assert_eq!(ticker.volume, None);
    }

    #[test]
    fn test_symbol_normalized() {
        let ticker = TickerUpdate::from_value(&json!({"symbol": " btcusd", "close": "1"})).unwrap();
        assert_eq!(ticker.symbol, "BTCUSD");

        let book = OrderBookUpdate::from_value(&json!({"symbol": "ethusd", "buy": []})).unwrap();
        assert_eq!(book.symbol, "ETHUSD");
    }

    #[test]
    fn test_ticker_requires_symbol() {
        assert!(TickerUpdate::from_value(&json!({"close": "1"})).is_err());
    }

    #[test]
    fn test_parse_orderbook_sorted() {
        let frame = json!({
            "type": "l2_orderbook",
            "symbol": "BTCUSD",
            "buy": [{"limit_price": "100", "size": 5}, {"limit_price": "101", "size": 2}],
            "sell": [{"limit_price": "103", "size": 1}, {"limit_price": "102", "size": 4}]
        });

        let book = OrderBookUpdate::from_value(&frame).unwrap();
        let bids = book.bids.unwrap();
        let asks = book.asks.unwrap();
        assert_eq!(bids[0].price, dec!(101));
        assert_eq!(asks[0].price, dec!(102));
    }

    #[test]
    fn test_market_update_dispatch() {
        let data = json!({"symbol": "BTCUSD", "close": "1"});
        assert!(matches!(
            MarketUpdate::parse("v2/ticker", &data),
            Some(Ok(MarketUpdate::Ticker(_)))
        ));
        assert!(MarketUpdate::parse("all_trades", &data).is_none());
    }
}
