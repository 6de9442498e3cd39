//! Telemetry event model.
//!
//! A [`TelemetryEvent`] is what a partition receiver produces for every
//! message that passes its cursor filter. Events are immutable once built and
//! are shared between subscribers behind an `Arc`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known system property (message annotation) names.
pub mod properties {
    /// Identity of the device that sent the message.
    pub const CONNECTION_DEVICE_ID: &str = "iothub-connection-device-id";
    /// Time the service enqueued the message.
    pub const ENQUEUED_TIME: &str = "x-opt-enqueued-time";
    /// Offset of the message within its partition.
    pub const OFFSET: &str = "x-opt-offset";
    /// Sequence number of the message within its partition.
    pub const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
}

/// Decoded message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    /// Body that parsed as JSON.
    Json(Value),
    /// Body kept as raw bytes.
    Bytes(Vec<u8>),
}

impl EventBody {
    /// Decode a raw body, preferring JSON.
    pub fn decode(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => EventBody::Json(value),
            Err(_) => EventBody::Bytes(raw.to_vec()),
        }
    }

    /// The JSON body, if the body decoded as JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            EventBody::Json(value) => Some(value),
            EventBody::Bytes(_) => None,
        }
    }

    /// Look up a top-level attribute of a JSON object body.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.as_json().and_then(|v| v.get(name))
    }

    /// Render the body for logs.
    pub fn render_pretty(&self) -> String {
        match self {
            EventBody::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            EventBody::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// One telemetry message received from a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Sending device, taken from the connection device id property.
    /// `None` when the message carries no device identity.
    pub device_id: Option<String>,
    /// Partition the message was read from
    pub partition_id: String,
    /// Decoded body
    pub body: EventBody,
    /// All system properties as received
    pub system_properties: Map<String, Value>,
    /// Service enqueue time
    pub enqueued_time: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Build an event from a raw message body and its annotations.
    ///
    /// The enqueued time is read from [`properties::ENQUEUED_TIME`], which may
    /// be epoch milliseconds or an RFC 3339 string. When it is missing the
    /// receive time is used.
    pub fn from_raw(
        partition_id: impl Into<String>,
        body: &[u8],
        system_properties: Map<String, Value>,
    ) -> Self {
        let device_id = system_properties
            .get(properties::CONNECTION_DEVICE_ID)
            .and_then(Value::as_str)
            .map(str::to_string);

        let enqueued_time = system_properties
            .get(properties::ENQUEUED_TIME)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        Self {
            device_id,
            partition_id: partition_id.into(),
            body: EventBody::decode(body),
            system_properties,
            enqueued_time,
        }
    }

    /// Whether this event was sent by `device_id`.
    pub fn is_from(&self, device_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id)
    }

    /// Partition offset, if the service reported one.
    pub fn offset(&self) -> Option<String> {
        self.system_properties
            .get(properties::OFFSET)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    /// Partition sequence number, if the service reported one.
    pub fn sequence_number(&self) -> Option<i64> {
        self.system_properties
            .get(properties::SEQUENCE_NUMBER)
            .and_then(Value::as_i64)
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn annotations(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_raw_reads_device_and_time() {
        let props = annotations(json!({
            "iothub-connection-device-id": "rpi2",
            "x-opt-enqueued-time": 1_456_000_000_000i64,
            "x-opt-offset": "4096",
            "x-opt-sequence-number": 17,
        }));
        let event = TelemetryEvent::from_raw("1", br#"{"Led":true,"LcdText":"RPi2"}"#, props);

        assert_eq!(event.device_id.as_deref(), Some("rpi2"));
        assert!(event.is_from("rpi2"));
        assert_eq!(event.enqueued_time.timestamp_millis(), 1_456_000_000_000);
        assert_eq!(event.offset().as_deref(), Some("4096"));
        assert_eq!(event.sequence_number(), Some(17));
        assert_eq!(event.body.attribute("Led"), Some(&json!(true)));
    }

    #[test]
    fn test_rfc3339_enqueued_time() {
        let props = annotations(json!({
            "x-opt-enqueued-time": "2016-03-01T10:00:00Z",
        }));
        let event = TelemetryEvent::from_raw("0", b"{}", props);
        assert_eq!(event.enqueued_time.to_rfc3339(), "2016-03-01T10:00:00+00:00");
        assert!(event.device_id.is_none());
    }

    #[test]
    fn test_non_json_body_kept_as_bytes() {
        let event = TelemetryEvent::from_raw("0", b"led:on", Map::new());
        assert_eq!(event.body, EventBody::Bytes(b"led:on".to_vec()));
        assert!(event.body.attribute("led").is_none());
        assert_eq!(event.body.render_pretty(), "led:on");
    }
}
