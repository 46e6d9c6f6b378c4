// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry records accepted from producers.
//!
//! A [`Record`] is opaque to the pipeline: it only carries its kind, the time
//! it was produced and a JSON payload. Records are immutable once created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// The kind of telemetry a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Request,
    Dependency,
    Trace,
    Event,
    Metric,
    Exception,
    PageView,
    Availability,
}

impl RecordKind {
    /// Envelope name used on the wire.
    #[must_use]
    pub fn envelope_name(self) -> &'static str {
        match self {
            RecordKind::Request => "Request",
            RecordKind::Dependency => "RemoteDependency",
            RecordKind::Trace => "Message",
            RecordKind::Event => "Event",
            RecordKind::Metric => "Metric",
            RecordKind::Exception => "Exception",
            RecordKind::PageView => "PageView",
            RecordKind::Availability => "Availability",
        }
    }

    /// Type tag of the payload inside the envelope.
    #[must_use]
    pub fn base_type(self) -> &'static str {
        match self {
            RecordKind::Request => "RequestData",
            RecordKind::Dependency => "RemoteDependencyData",
            RecordKind::Trace => "MessageData",
            RecordKind::Event => "EventData",
            RecordKind::Metric => "MetricData",
            RecordKind::Exception => "ExceptionData",
            RecordKind::PageView => "PageViewData",
            RecordKind::Availability => "AvailabilityData",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: RecordKind,
    timestamp: DateTime<Utc>,
    payload: Value,
}

impl Record {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(kind: RecordKind, payload: Value) -> Self {
        Self::with_timestamp(kind, Utc::now(), payload)
    }

    #[must_use]
    pub fn with_timestamp(kind: RecordKind, timestamp: DateTime<Utc>, payload: Value) -> Self {
        Record {
            kind,
            timestamp,
            payload,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Only JSON objects are accepted as payloads.
    pub fn validate(&self) -> Result<(), ChannelError> {
        match &self.payload {
            Value::Object(_) => Ok(()),
            Value::Null => Err(ChannelError::InvalidArgument(
                "record payload is null".to_string(),
            )),
            other => Err(ChannelError::InvalidArgument(format!(
                "record payload must be a JSON object, got {}",
                json_type_name(other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_payload_is_valid() {
        let record = Record::new(RecordKind::Event, json!({"name": "checkout"}));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_null_payload_is_rejected() {
        let record = Record::new(RecordKind::Trace, Value::Null);
        let err = record.validate().unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));
        assert!(err.to_string().contains("null"));
    }

    #[test]
    fn test_scalar_payload_is_rejected() {
        let record = Record::new(RecordKind::Metric, json!(42));
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn test_kind_deserializes_from_snake_case() {
        let kind: RecordKind = serde_json::from_str("\"page_view\"").unwrap();
        assert_eq!(kind, RecordKind::PageView);
        assert_eq!(kind.envelope_name(), "PageView");
        assert_eq!(RecordKind::Dependency.base_type(), "RemoteDependencyData");
    }
}
