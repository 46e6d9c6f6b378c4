// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::serializer::Payload;

/// One serialized batch on its way to a destination.
///
/// Everything but the attempt counter is fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    endpoint: Url,
    payload: Bytes,
    content_type: String,
    content_encoding: Option<String>,
    created_at: DateTime<Utc>,
    attempt: u32,
}

impl Transmission {
    #[must_use]
    pub fn new(endpoint: Url, payload: Payload) -> Self {
        Transmission {
            endpoint,
            payload: payload.bytes,
            content_type: payload.content_type.to_string(),
            content_encoding: payload.content_encoding.map(str::to_string),
            created_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Rebuilds a transmission read back from durable storage.
    #[must_use]
    pub fn from_parts(
        endpoint: Url,
        payload: Bytes,
        content_type: String,
        content_encoding: Option<String>,
        created_at: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Transmission {
            endpoint,
            payload,
            content_type,
            content_encoding,
            created_at,
            attempt,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Key under which retry cadence is shared: scheme, host and port.
    #[must_use]
    pub fn destination(&self) -> String {
        destination_key(&self.endpoint)
    }

    pub(crate) fn next_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }
}

pub(crate) fn destination_key(endpoint: &Url) -> String {
    endpoint.origin().ascii_serialization()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Payload {
        Payload {
            bytes: Bytes::from_static(b"{\"name\":\"Event\"}"),
            content_type: "application/x-json-stream",
            content_encoding: Some("gzip"),
            record_count: 1,
        }
    }

    #[test]
    fn test_new_transmission_starts_at_attempt_zero() {
        let endpoint = Url::parse("https://dc.example.com/v2/track").unwrap();
        let transmission = Transmission::new(endpoint.clone(), payload());

        assert_eq!(transmission.attempt(), 0);
        assert_eq!(transmission.endpoint(), &endpoint);
        assert_eq!(transmission.content_encoding(), Some("gzip"));
        assert_eq!(transmission.size(), 16);
    }

    #[test]
    fn test_next_attempt_increments() {
        let endpoint = Url::parse("https://dc.example.com/v2/track").unwrap();
        let mut transmission = Transmission::new(endpoint, payload());
        assert_eq!(transmission.next_attempt(), 1);
        assert_eq!(transmission.next_attempt(), 2);
        assert_eq!(transmission.attempt(), 2);
    }

    #[test]
    fn test_destination_ignores_path() {
        let a = Url::parse("https://dc.example.com/v2/track").unwrap();
        let b = Url::parse("https://dc.example.com/other").unwrap();
        let c = Url::parse("https://dc.example.com:8443/v2/track").unwrap();
        assert_eq!(destination_key(&a), destination_key(&b));
        assert_ne!(destination_key(&a), destination_key(&c));
        assert_eq!(destination_key(&a), "https://dc.example.com");
    }
}
