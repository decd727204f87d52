//! OHLCV bar and subscription/instance key types.
//!
//! Grounded on `models.rs`'s plain serde-derived domain structs (`Signal`, `Config`).

use serde::{Deserialize, Serialize};

/// A single OHLCV bar. `ts_ms` is UTC epoch milliseconds, aligned to the bucket start
/// for the bar's timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_ms: i64,
    #[serde(with = "finite_f64")]
    pub open: f64,
    #[serde(with = "finite_f64")]
    pub high: f64,
    #[serde(with = "finite_f64")]
    pub low: f64,
    #[serde(with = "finite_f64")]
    pub close: f64,
    #[serde(with = "finite_f64")]
    pub volume: f64,
}

impl Bar {
    /// True iff the bar satisfies the persisted-bar invariant from §3: `low <= open,close <=
    /// high` and `volume >= 0`.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

/// Serializes `f64` so `NaN`/`Infinity`/`-Infinity` round-trip as the literal strings the
/// cache layer (§4.3) requires, while ordinary values stay numeric JSON.
pub mod finite_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            "NaN".serialize(serializer)
        } else if value.is_infinite() {
            if *value > 0.0 {
                "Infinity".serialize(serializer)
            } else {
                "-Infinity".serialize(serializer)
            }
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other
                    .parse::<f64>()
                    .map_err(|_| serde::de::Error::custom(format!("invalid float: {other}"))),
            },
        }
    }
}

/// Identifies a unique client-facing data feed: market, provider, symbol, and timeframe.
///
/// Equality is case-sensitive on `provider`/`symbol` per §3; plugins are responsible for any
/// case normalization before a key reaches this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub market: String,
    pub provider: String,
    pub symbol: String,
    pub timeframe: crate::timeframe::Timeframe,
}

impl SubscriptionKey {
    pub fn new(
        market: impl Into<String>,
        provider: impl Into<String>,
        symbol: impl Into<String>,
        timeframe: crate::timeframe::Timeframe,
    ) -> Self {
        Self {
            market: market.into(),
            provider: provider.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }
}

/// The marker used for `credential_fingerprint` when a plugin instance requires no credentials.
pub const PUBLIC_CREDENTIAL_MARKER: &str = "public";

/// Identifies a cached plugin instance: the plugin implementation, the provider it's configured
/// for, a fingerprint of the credential material in use (or [`PUBLIC_CREDENTIAL_MARKER`]), and
/// whether it targets the provider's testnet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceCacheKey {
    pub plugin_key: String,
    pub provider_id: String,
    pub credential_fingerprint: String,
    pub testnet: bool,
}

impl InstanceCacheKey {
    pub fn public(plugin_key: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            plugin_key: plugin_key.into(),
            provider_id: provider_id.into(),
            credential_fingerprint: PUBLIC_CREDENTIAL_MARKER.to_string(),
            testnet: false,
        }
    }

    /// Short stable fingerprint of API key material, per §3. Not reversible; just a cache key.
    pub fn fingerprint_credential(api_key: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_validity() {
        let ok = Bar {
            ts_ms: 0,
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 1.0,
        };
        assert!(ok.is_valid());

        let bad_high = Bar {
            high: 8.0,
            ..ok.clone()
        };
        assert!(!bad_high.is_valid());

        let bad_volume = Bar {
            volume: -1.0,
            ..ok
        };
        assert!(!bad_volume.is_valid());
    }

    #[test]
    fn nan_inf_round_trip() {
        let bar = Bar {
            ts_ms: 0,
            open: f64::NAN,
            high: f64::INFINITY,
            low: f64::NEG_INFINITY,
            close: 1.0,
            volume: 0.0,
        };
        let json = serde_json::to_string(&bar).unwrap();
        assert!(json.contains("\"NaN\""));
        assert!(json.contains("\"Infinity\""));
        assert!(json.contains("\"-Infinity\""));
        let back: Bar = serde_json::from_str(&json).unwrap();
        assert!(back.open.is_nan());
        assert_eq!(back.high, f64::INFINITY);
        assert_eq!(back.low, f64::NEG_INFINITY);
        assert_eq!(back.close, 1.0);
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = InstanceCacheKey::fingerprint_credential("api-key-material");
        let b = InstanceCacheKey::fingerprint_credential("api-key-material");
        let c = InstanceCacheKey::fingerprint_credential("different");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
