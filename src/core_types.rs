//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User ID - primary key of `users` and the field name in the `user_balance` hash.
///
/// Signed so it binds directly to a Postgres `BIGINT`.
pub type UserId = i64;

/// Instrument ticker, e.g. `"AAPL"`.
pub type Symbol = String;

/// Offset of a record inside an event-log topic.
pub type LogOffset = u64;

/// Stream entry ID - `<millis>-<seq>`, strictly increasing within a stream.
///
/// Ordering is `(ms, seq)` so IDs compare the same way the store hands them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next ID after `self` given the current wall clock.
    ///
    /// Clock going backwards never yields a smaller ID.
    pub fn next_after(self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct ParseStreamIdError(pub String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseStreamIdError(s.to_string()))?;
        let ms = ms.parse().map_err(|_| ParseStreamIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| ParseStreamIdError(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

impl Serialize for StreamId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_ordering() {
        let a = StreamId::new(10, 5);
        let b = StreamId::new(11, 0);
        assert!(a < b);
        assert!(StreamId::new(10, 5) < StreamId::new(10, 6));
    }

    #[test]
    fn test_stream_id_parse_and_display() {
        let id: StreamId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, StreamId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert!("garbage".parse::<StreamId>().is_err());
        assert!("1-x".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_next_after_is_monotonic() {
        let id = StreamId::new(100, 7);
        assert_eq!(id.next_after(100), StreamId::new(100, 8));
        assert_eq!(id.next_after(50), StreamId::new(100, 8));
        assert_eq!(id.next_after(101), StreamId::new(101, 0));
    }
}
