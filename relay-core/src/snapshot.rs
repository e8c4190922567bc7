//! Client-side market snapshot
//!
//! Keeps the latest known state per symbol and merges partial updates into
//! it. Only fields present in an update are overwritten, so applying the
//! same update twice leaves the snapshot unchanged. The exchange carries no
//! sequence numbers: updates win in arrival order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::market::{MarketUpdate, OrderBookLevel, OrderBookUpdate, TickerUpdate};

/// Latest ticker fields for a symbol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickerState {
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
    pub updated_at: Option<DateTime<Utc>>,
}

/// Overwrite `dst` only when the update carries a value
fn merge<T: Copy>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

impl TickerState {
    fn apply(&mut self, update: &TickerUpdate) {
        merge(&mut self.last_price, update.last_price);
        merge(&mut self.mark_price, update.mark_price);
        merge(&mut self.spot_price, update.spot_price);
        merge(&mut self.best_bid, update.best_bid);
        merge(&mut self.best_ask, update.best_ask);
        merge(&mut self.bid_size, update.bid_size);
        merge(&mut self.ask_size, update.ask_size);
        merge(&mut self.open, update.open);
        merge(&mut self.high, update.high);
        merge(&mut self.low, update.low);
        merge(&mut self.volume, update.volume);
        merge(&mut self.turnover, update.turnover);
        merge(&mut self.change_24h, update.change_24h);
        merge(&mut self.updated_at, update.timestamp);
    }

    /// Mid price when both sides of the quote are known
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Bid/ask spread when both sides of the quote are known
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

/// Latest order book sides for a symbol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BookState {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BookState {
    fn apply(&mut self, update: &OrderBookUpdate) {
        if let Some(bids) = &update.bids {
            self.bids = bids.clone();
        }
        if let Some(asks) = &update.asks {
            self.asks = asks.clone();
        }
        merge(&mut self.updated_at, update.timestamp);
    }

    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }
}

/// Symbol -> latest state, mutated in place by incoming updates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarketSnapshot {
    tickers: HashMap<String, TickerState>,
    books: HashMap<String, BookState>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a ticker update into the symbol's entry, creating it if needed
    pub fn apply_ticker(&mut self, update: &TickerUpdate) -> &TickerState {
        let entry = self.tickers.entry(update.symbol.clone()).or_default();
        entry.apply(update);
        entry
    }

    /// Merge a book update into the symbol's entry, creating it if needed
    pub fn apply_orderbook(&mut self, update: &OrderBookUpdate) -> &BookState {
        let entry = self.books.entry(update.symbol.clone()).or_default();
        entry.apply(update);
        entry
    }

    pub fn apply(&mut self, update: &MarketUpdate) {
        match update {
            MarketUpdate::Ticker(t) => {
                self.apply_ticker(t);
            }
            MarketUpdate::OrderBook(b) => {
                self.apply_orderbook(b);
            }
        }
    }

    pub fn ticker(&self, symbol: &str) -> Option<&TickerState> {
        self.tickers.get(symbol)
    }

    pub fn book(&self, symbol: &str) -> Option<&BookState> {
        self.books.get(symbol)
    }

    /// Drop all state for a symbol (on unsubscribe)
    pub fn remove(&mut self, symbol: &str) {
        self.tickers.remove(symbol);
        self.books.remove(symbol);
    }

    /// Drop ticker state only
    pub fn remove_ticker(&mut self, symbol: &str) {
        self.tickers.remove(symbol);
    }

    /// Drop book state only
    pub fn remove_book(&mut self, symbol: &str) {
        self.books.remove(symbol);
    }

    /// Symbols with ticker state, sorted
    pub fn symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.tickers.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty() && self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(symbol: &str) -> TickerUpdate {
        TickerUpdate::new(symbol)
    }

    #[test]
    fn test_partial_update_preserves_fields() {
        let mut snapshot = MarketSnapshot::new();

        snapshot.apply_ticker(&TickerUpdate {
            last_price: Some(dec!(100)),
            volume: Some(dec!(50)),
            ..ticker("BTCUSD")
        });
        let state = snapshot.apply_ticker(&TickerUpdate {
            best_bid: Some(dec!(99)),
            best_ask: Some(dec!(101)),
            ..ticker("BTCUSD")
        });

        assert_eq!(state.last_price, Some(dec!(100)));
        assert_eq!(state.volume, Some(dec!(50)));
        assert_eq!(state.mid_price(), Some(dec!(100)));
        assert_eq!(state.spread(), Some(dec!(2)));
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let update = TickerUpdate {
            last_price: Some(dec!(3100)),
            change_24h: Some(dec!(-0.5)),
            ..ticker("ETHUSD")
        };

        let mut once = MarketSnapshot::new();
        once.apply_ticker(&update);

        let mut twice = MarketSnapshot::new();
        twice.apply_ticker(&update);
        twice.apply_ticker(&update);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_last_write_wins_in_arrival_order() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.apply_ticker(&TickerUpdate {
            last_price: Some(dec!(1)),
            ..ticker("BTCUSD")
        });
        snapshot.apply_ticker(&TickerUpdate {
            last_price: Some(dec!(2)),
            ..ticker("BTCUSD")
        });

        assert_eq!(snapshot.ticker("BTCUSD").unwrap().last_price, Some(dec!(2)));
    }

    #[test]
    fn test_book_side_replaced_only_when_present() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.apply_orderbook(&OrderBookUpdate {
            symbol: "BTCUSD".to_string(),
            bids: Some(vec![OrderBookLevel::new(dec!(99), dec!(1))]),
            asks: Some(vec![OrderBookLevel::new(dec!(101), dec!(2))]),
            timestamp: None,
        });
        let book = snapshot.apply_orderbook(&OrderBookUpdate {
            symbol: "BTCUSD".to_string(),
            bids: Some(vec![OrderBookLevel::new(dec!(100), dec!(3))]),
            asks: None,
            timestamp: None,
        });

        assert_eq!(book.best_bid().unwrap().price, dec!(100));
        assert_eq!(book.best_ask().unwrap().price, dec!(101));
    }

    #[test]
    fn test_remove_on_unsubscribe() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.apply(&MarketUpdate::Ticker(TickerUpdate {
            last_price: Some(dec!(1)),
            ..ticker("BTCUSD")
        }));
        assert_eq!(snapshot.symbols(), vec!["BTCUSD"]);

        snapshot.remove("BTCUSD");
        assert!(snapshot.ticker("BTCUSD").is_none());
        assert!(snapshot.is_empty());
    }
}
