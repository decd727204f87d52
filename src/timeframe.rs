//! Timeframe algebra: parsing `{N}{m,h,d,w}` strings and bucket-size arithmetic.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Minute,
    Hour,
    Day,
    Week,
}

impl Unit {
    fn ms(self) -> u64 {
        match self {
            Unit::Minute => 60_000,
            Unit::Hour => 3_600_000,
            Unit::Day => 86_400_000,
            Unit::Week => 604_800_000,
        }
    }

    fn suffix(self) -> char {
        match self {
            Unit::Minute => 'm',
            Unit::Hour => 'h',
            Unit::Day => 'd',
            Unit::Week => 'w',
        }
    }
}

/// A bucket size: a multiplier (>= 1) over a unit. The canonical string form is `"1m"`, `"5m"`,
/// `"1h"`, `"1d"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    pub multiplier: u32,
    pub unit: Unit,
}

pub const ONE_MINUTE: Timeframe = Timeframe {
    multiplier: 1,
    unit: Unit::Minute,
};

impl Timeframe {
    /// Parses `^([1-9][0-9]*)([mhdw])$`. Any other input is `InvalidTimeframe`.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let invalid = || EngineError::InvalidTimeframe(s.to_string());

        let bytes = s.as_bytes();
        if bytes.is_empty() {
            return Err(invalid());
        }
        let (digits, suffix) = s.split_at(s.len() - 1);
        if digits.is_empty() {
            return Err(invalid());
        }
        if digits.starts_with('0') {
            return Err(invalid());
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let multiplier: u32 = digits.parse().map_err(|_| invalid())?;
        if multiplier == 0 {
            return Err(invalid());
        }
        let unit = match suffix {
            "m" => Unit::Minute,
            "h" => Unit::Hour,
            "d" => Unit::Day,
            "w" => Unit::Week,
            _ => return Err(invalid()),
        };
        Ok(Timeframe { multiplier, unit })
    }

    /// Bucket size in milliseconds.
    pub fn ms(self) -> u64 {
        self.unit.ms() * self.multiplier as u64
    }

    /// Only `1m` is persisted raw; everything else is derived or materialized.
    pub fn is_one_minute(self) -> bool {
        self.multiplier == 1 && self.unit == Unit::Minute
    }

    /// Whether this timeframe is strictly coarser than 1 minute.
    pub fn is_coarser_than_1m(self) -> bool {
        self.ms() > ONE_MINUTE.ms()
    }

    /// The start of the bucket containing `ts_ms`.
    pub fn bucket_start(self, ts_ms: i64) -> i64 {
        let bucket = self.ms() as i64;
        ts_ms.div_euclid(bucket) * bucket
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.multiplier, self.unit.suffix())
    }
}

impl TryFrom<String> for Timeframe {
    type Error = EngineError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> String {
        tf.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_forms() {
        assert_eq!(Timeframe::parse("1m").unwrap().ms(), 60_000);
        assert_eq!(Timeframe::parse("5m").unwrap().ms(), 300_000);
        assert_eq!(Timeframe::parse("1h").unwrap().ms(), 3_600_000);
        assert_eq!(Timeframe::parse("1d").unwrap().ms(), 86_400_000);
        assert_eq!(Timeframe::parse("2w").unwrap().ms(), 1_209_600_000);
    }

    #[test]
    fn rejects_invalid_forms() {
        for bad in ["", "0m", "m", "5", "5x", "-5m", "05m", "5M"] {
            assert!(Timeframe::parse(bad).is_err(), "expected {bad} to fail");
        }
    }

    #[test]
    fn round_trips_canonical_string() {
        for s in ["1m", "15m", "1h", "4h", "1d", "1w"] {
            let tf = Timeframe::parse(s).unwrap();
            assert_eq!(tf.to_string(), s);
        }
    }

    #[test]
    fn bucket_alignment() {
        let five_m = Timeframe::parse("5m").unwrap();
        assert_eq!(five_m.bucket_start(0), 0);
        assert_eq!(five_m.bucket_start(299_999), 0);
        assert_eq!(five_m.bucket_start(300_000), 300_000);
        assert_eq!(five_m.bucket_start(-1), -300_000);
    }

    #[test]
    fn coarseness() {
        assert!(!ONE_MINUTE.is_coarser_than_1m());
        assert!(Timeframe::parse("5m").unwrap().is_coarser_than_1m());
        assert!(ONE_MINUTE.is_one_minute());
    }
}
