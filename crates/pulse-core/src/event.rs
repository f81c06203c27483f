//! Activity events exchanged with the event store.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;
use crate::value::{EventData, Value};

/// A span of activity in a bucket.
///
/// On the wire `duration` is a floating-point number of seconds, matching the
/// event store's REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Server-assigned ID, only present on events read back from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// When the activity started.
    pub timestamp: DateTime<Utc>,
    /// How long the activity lasted. Never negative.
    #[serde(with = "duration_secs")]
    pub duration: TimeDelta,
    /// What the activity was (e.g. app name, window title).
    #[serde(default)]
    pub data: EventData,
}

impl Event {
    /// Creates an event after validating the duration.
    pub fn new(
        timestamp: DateTime<Utc>,
        duration: TimeDelta,
        data: EventData,
    ) -> Result<Self, ValidationError> {
        let event = Self {
            id: None,
            timestamp,
            duration,
            data,
        };
        event.validate()?;
        Ok(event)
    }

    /// Checks that the duration is one the wire format can carry back.
    ///
    /// Fields are public, so events built by hand should be validated before
    /// they are persisted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_duration(self.duration)?;
        if self.timestamp.checked_add_signed(self.duration).is_none() {
            return Err(ValidationError::InvalidDuration {
                seconds: seconds(self.duration),
            });
        }
        Ok(())
    }

    /// Creates an instantaneous (zero-duration) event.
    pub fn heartbeat(timestamp: DateTime<Utc>, data: EventData) -> Self {
        Self {
            id: None,
            timestamp,
            duration: TimeDelta::zero(),
            data,
        }
    }

    /// Adds a payload entry, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// When the activity ended. Saturates at the latest representable time.
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp
            .checked_add_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Longest duration accepted, in seconds.
///
/// Anything beyond ~292k years of microseconds is not a real span.
const MAX_DURATION_SECS: f64 = 9.2e12;

/// Rejects durations that are negative or too long to be read back.
pub fn check_duration(duration: TimeDelta) -> Result<(), ValidationError> {
    let secs = seconds(duration);
    if duration < TimeDelta::zero() || secs >= MAX_DURATION_SECS {
        return Err(ValidationError::InvalidDuration { seconds: secs });
    }
    Ok(())
}

/// Converts a duration to fractional seconds.
#[expect(
    clippy::cast_precision_loss,
    reason = "microsecond counts fit comfortably in an f64 mantissa for realistic spans"
)]
pub fn seconds(duration: TimeDelta) -> f64 {
    duration.num_microseconds().map_or_else(
        || duration.num_milliseconds() as f64 / 1_000.0,
        |us| us as f64 / 1_000_000.0,
    )
}

/// Converts fractional seconds to a non-negative duration.
#[expect(
    clippy::cast_possible_truncation,
    reason = "value is range-checked before the cast"
)]
pub fn from_seconds(secs: f64) -> Result<TimeDelta, ValidationError> {
    if !secs.is_finite() || !(0.0..MAX_DURATION_SECS).contains(&secs) {
        return Err(ValidationError::InvalidDuration { seconds: secs });
    }
    Ok(TimeDelta::microseconds((secs * 1_000_000.0).round() as i64))
}

mod duration_secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(duration: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(super::seconds(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TimeDelta, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        super::from_seconds(secs).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use insta::assert_snapshot;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn serializes_duration_as_seconds() {
        let event = Event::new(at(0), TimeDelta::milliseconds(2_500), EventData::new())
            .unwrap()
            .with("app", "Firefox");

        let json = serde_json::to_string(&event).unwrap();
        assert_snapshot!(json, @r#"{"timestamp":"2023-11-14T22:13:20Z","duration":2.5,"data":{"app":"Firefox"}}"#);
    }

    #[test]
    fn parses_server_event_with_id() {
        let json = r#"{"id":42,"timestamp":"2023-11-14T22:13:20Z","duration":3.0,"data":{"app":"X"}}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        assert_eq!(event.id, Some(42));
        assert_eq!(event.duration, TimeDelta::seconds(3));
        assert_eq!(event.end(), at(3));
    }

    #[test]
    fn rejects_negative_duration() {
        assert!(Event::new(at(0), TimeDelta::seconds(-1), EventData::new()).is_err());

        let json = r#"{"timestamp":"2023-11-14T22:13:20Z","duration":-1.0,"data":{}}"#;
        let result: Result<Event, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_durations_that_cannot_be_read_back() {
        let too_long = TimeDelta::seconds(9_300_000_000_000);
        assert!(Event::new(at(0), too_long, EventData::new()).is_err());

        let by_hand = Event {
            duration: too_long,
            ..Event::heartbeat(at(0), EventData::new())
        };
        assert!(by_hand.validate().is_err());
        assert_eq!(by_hand.end(), DateTime::<Utc>::MAX_UTC);

        let past_the_end = Event {
            duration: TimeDelta::days(365),
            ..Event::heartbeat(DateTime::<Utc>::MAX_UTC, EventData::new())
        };
        assert!(past_the_end.validate().is_err());
        assert_eq!(past_the_end.end(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn heartbeat_has_zero_duration() {
        let event = Event::heartbeat(at(5), EventData::new());
        assert_eq!(event.duration, TimeDelta::zero());
        assert_eq!(event.end(), event.timestamp);
    }

    #[test]
    fn seconds_conversion_keeps_sub_second_precision() {
        let delta = from_seconds(0.25).unwrap();
        assert_eq!(delta, TimeDelta::milliseconds(250));
        assert!((seconds(delta) - 0.25).abs() < f64::EPSILON);
        assert!(from_seconds(f64::NAN).is_err());
    }
}
