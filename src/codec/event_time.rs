//! Timestamps accepted by the forward protocol.

use chrono::{DateTime, Utc};
use rmpv::Value;
use serde::{Serialize, Serializer};

/// MessagePack extension type code carrying an [`EventTime`].
pub const EVENT_TIME_EXT_CODE: i8 = 0;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Second plus nanosecond timestamp, encoded as MessagePack ext type 0 with
/// 4 bytes of big-endian seconds followed by 4 bytes of big-endian
/// nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTime {
    seconds: u32,
    nanoseconds: u32,
}

impl EventTime {
    /// Build an event time, carrying excess nanoseconds into the seconds.
    pub fn new(seconds: u32, nanoseconds: u32) -> Self {
        Self {
            seconds: seconds.saturating_add(nanoseconds / NANOS_PER_SEC),
            nanoseconds: nanoseconds % NANOS_PER_SEC,
        }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Split a fractional Unix timestamp into seconds and nanoseconds.
    ///
    /// The sub-second part is truncated, not rounded, so
    /// `1490061367.8616468906402588` yields `(1490061367, 861646890)`.
    /// Negative and non-finite inputs saturate.
    pub fn from_secs_f64(timestamp: f64) -> Self {
        let whole = timestamp.trunc();
        let nanoseconds = ((timestamp - whole) * f64::from(NANOS_PER_SEC)) as u32;
        Self::new(whole as u32, nanoseconds)
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    /// The 8 extension data bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&self.seconds.to_be_bytes());
        data[4..].copy_from_slice(&self.nanoseconds.to_be_bytes());
        data
    }

    /// Parse extension data bytes, rejecting anything but exactly 8 bytes.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let data: &[u8; 8] = data.try_into().ok()?;
        let (secs, nanos) = data.split_at(4);
        Some(Self {
            seconds: u32::from_be_bytes(secs.try_into().ok()?),
            nanoseconds: u32::from_be_bytes(nanos.try_into().ok()?),
        })
    }
}

impl From<DateTime<Utc>> for EventTime {
    fn from(time: DateTime<Utc>) -> Self {
        let seconds = u32::try_from(time.timestamp().max(0)).unwrap_or(u32::MAX);
        Self::new(seconds, time.timestamp_subsec_nanos())
    }
}

struct ExtData<'a>(&'a [u8]);

impl Serialize for ExtData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

impl Serialize for EventTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.to_bytes();
        serializer.serialize_newtype_struct(
            rmp_serde::MSGPACK_EXT_STRUCT_NAME,
            &(EVENT_TIME_EXT_CODE, ExtData(&data)),
        )
    }
}

/// Timestamp attached to an event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Timestamp {
    /// Whole seconds since the Unix epoch.
    Seconds(u64),
    /// Fractional seconds; resolved by the sender before encoding.
    Fractional(f64),
    /// Nanosecond precision time.
    EventTime(EventTime),
}

impl Timestamp {
    /// Current time in the representation selected by `nanosecond_precision`.
    pub fn now(nanosecond_precision: bool) -> Self {
        let now = Utc::now();
        if nanosecond_precision {
            Timestamp::EventTime(EventTime::from(now))
        } else {
            Timestamp::Seconds(u64::try_from(now.timestamp()).unwrap_or_default())
        }
    }

    /// Coerce fractional timestamps into the wire representation.
    pub fn resolve(self, nanosecond_precision: bool) -> Self {
        match self {
            Timestamp::Fractional(secs) if nanosecond_precision => {
                Timestamp::EventTime(EventTime::from_secs_f64(secs))
            }
            Timestamp::Fractional(secs) => Timestamp::Seconds(truncate_secs(secs)),
            other => other,
        }
    }

    /// Interpret a decoded MessagePack value as a timestamp.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(int) => int.as_u64().map(Timestamp::Seconds),
            Value::F64(secs) => Some(Timestamp::Fractional(*secs)),
            Value::F32(secs) => Some(Timestamp::Fractional(f64::from(*secs))),
            Value::Ext(EVENT_TIME_EXT_CODE, data) => {
                EventTime::from_bytes(data).map(Timestamp::EventTime)
            }
            _ => None,
        }
    }
}

fn truncate_secs(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        secs.trunc() as u64
    } else {
        0
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Timestamp::Seconds(secs)
    }
}

impl From<f64> for Timestamp {
    fn from(secs: f64) -> Self {
        Timestamp::Fractional(secs)
    }
}

impl From<EventTime> for Timestamp {
    fn from(time: EventTime) -> Self {
        Timestamp::EventTime(time)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Timestamp::Seconds(secs) => serializer.serialize_u64(*secs),
            Timestamp::Fractional(secs) => serializer.serialize_u64(truncate_secs(*secs)),
            Timestamp::EventTime(time) => time.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn fractional_time_splits_into_expected_bytes() {
        let time = EventTime::from_secs_f64(1490061367.8616468906402588);
        assert_eq!(time.seconds(), 1490061367);
        assert_eq!(time.nanoseconds(), 861646890);
        assert_eq!(
            time.to_bytes(),
            [0x58, 0xD0, 0x88, 0x37, 0x33, 0x5B, 0xB0, 0x2A]
        );
    }

    #[rstest]
    fn new_carries_excess_nanoseconds() {
        let time = EventTime::new(10, 2_500_000_000);
        assert_eq!(time, EventTime::new(12, 500_000_000));
    }

    #[rstest]
    #[case(&[0u8; 7])]
    #[case(&[0u8; 9])]
    fn from_bytes_rejects_wrong_length(#[case] data: &[u8]) {
        assert!(EventTime::from_bytes(data).is_none());
    }

    #[rstest]
    #[case(true, Timestamp::EventTime(EventTime::new(5, 250_000_000)))]
    #[case(false, Timestamp::Seconds(5))]
    fn resolve_respects_precision(#[case] nanos: bool, #[case] expected: Timestamp) {
        assert_eq!(Timestamp::Fractional(5.25).resolve(nanos), expected);
    }

    #[rstest]
    fn resolve_keeps_explicit_representations() {
        let time = Timestamp::EventTime(EventTime::new(1, 2));
        assert_eq!(time.resolve(false), time);
        assert_eq!(Timestamp::Seconds(7).resolve(true), Timestamp::Seconds(7));
    }

    #[rstest]
    fn now_uses_requested_representation() {
        assert!(matches!(Timestamp::now(true), Timestamp::EventTime(_)));
        assert!(matches!(Timestamp::now(false), Timestamp::Seconds(s) if s > 0));
    }
}
