//! Channel subscriptions
//!
//! A channel is a named upstream topic (`v2/ticker`, `l2_orderbook`, ...)
//! scoped to a set of symbols. Internally every `(channel, symbol)` pair is
//! tracked as its own [`SubscriptionKey`] so interest can be reference
//! counted per symbol.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Symbol that subscribes a channel to every instrument on the exchange
pub const ALL_SYMBOLS: &str = "ALL";

/// A channel name with the symbols requested on it (wire format)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl ChannelSpec {
    pub fn new<I, S>(name: impl Into<String>, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    /// Reject specs that cannot be mapped onto upstream keys
    pub fn validate(&self) -> RelayResult<()> {
        if self.name.trim().is_empty() {
            return Err(RelayError::invalid_request("channel name cannot be empty"));
        }
        if self.symbols.is_empty() {
            return Err(RelayError::invalid_request(format!(
                "channel '{}' has no symbols",
                self.name
            )));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(RelayError::invalid_request(format!(
                "channel '{}' contains an empty symbol",
                self.name
            )));
        }
        Ok(())
    }

    /// Expand into one key per symbol (normalized, deduplicated)
    pub fn keys(&self) -> BTreeSet<SubscriptionKey> {
        self.symbols
            .iter()
            .map(|symbol| SubscriptionKey::new(&self.name, symbol))
            .collect()
    }
}

/// Canonical form of an exchange symbol: trimmed, upper case
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Unique key for a single-symbol subscription (used for reference counting)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: String,
    pub symbol: String,
}

impl SubscriptionKey {
    pub fn new(channel: &str, symbol: &str) -> Self {
        Self {
            channel: channel.trim().to_string(),
            symbol: normalize_symbol(symbol),
        }
    }

    /// Key matching every symbol on `channel`
    pub fn all_symbols(channel: &str) -> Self {
        Self::new(channel, ALL_SYMBOLS)
    }

    pub fn is_all_symbols(&self) -> bool {
        self.symbol == ALL_SYMBOLS
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.symbol)
    }
}

/// Fold keys back into wire-format channel specs, one per channel name.
///
/// Output is sorted by channel then symbol so frames are deterministic.
pub fn group_keys<'a, I>(keys: I) -> Vec<ChannelSpec>
where
    I: IntoIterator<Item = &'a SubscriptionKey>,
{
    let mut grouped: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for key in keys {
        grouped
            .entry(key.channel.as_str())
            .or_default()
            .insert(key.symbol.as_str());
    }

    grouped
        .into_iter()
        .map(|(name, symbols)| ChannelSpec::new(name, symbols))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_normalize_symbols() {
        let spec = ChannelSpec::new("v2/ticker", ["btcusd", " BTCUSD ", "ETHUSD"]);
        let keys: Vec<_> = spec.keys().into_iter().collect();

        assert_eq!(
            keys,
            vec![
                SubscriptionKey::new("v2/ticker", "BTCUSD"),
                SubscriptionKey::new("v2/ticker", "ETHUSD"),
            ]
        );
    }

    #[test]
    fn test_validate_rejects_malformed_specs() {
        assert!(ChannelSpec::new("", ["BTCUSD"]).validate().is_err());
        assert!(ChannelSpec::new("v2/ticker", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(ChannelSpec::new("v2/ticker", ["BTCUSD", " "]).validate().is_err());
        assert!(ChannelSpec::new("v2/ticker", ["BTCUSD"]).validate().is_ok());
    }

    #[test]
    fn test_group_keys_by_channel() {
        let keys = [
            SubscriptionKey::new("v2/ticker", "ETHUSD"),
            SubscriptionKey::new("l2_orderbook", "BTCUSD"),
            SubscriptionKey::new("v2/ticker", "BTCUSD"),
        ];

        let grouped = group_keys(keys.iter());
        assert_eq!(
            grouped,
            vec![
                ChannelSpec::new("l2_orderbook", ["BTCUSD"]),
                ChannelSpec::new("v2/ticker", ["BTCUSD", "ETHUSD"]),
            ]
        );
    }

    #[test]
    fn test_spec_wire_format() {
        let spec: ChannelSpec =
            serde_json::from_str(r#"{"name":"v2/ticker","symbols":["BTCUSD"]}"#).unwrap();
        assert_eq!(spec, ChannelSpec::new("v2/ticker", ["BTCUSD"]));
    }
}
