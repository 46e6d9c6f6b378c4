// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns drained records into wire payloads.
//!
//! The wire format is JSON lines: one envelope per record, in the order the
//! records were enqueued. A batch is split into several payloads when it
//! exceeds either the byte bound or the record bound; each payload is then
//! compressed on its own.

use bytes::Bytes;
use chrono::SecondsFormat;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use tracing::warn;

use crate::config::{ChannelConfig, Compression};
use crate::error::SerializationError;
use crate::record::Record;

pub const CONTENT_TYPE: &str = "application/x-json-stream";

/// One compressed, length-bounded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
    pub record_count: usize,
}

#[derive(Debug, Default)]
pub struct SerializedBatch {
    pub payloads: Vec<Payload>,
    /// Records skipped because a single envelope exceeded the byte bound.
    pub oversized: usize,
}

#[derive(Serialize)]
struct Envelope<'a> {
    name: &'a str,
    time: String,
    #[serde(rename = "iKey")]
    i_key: &'a str,
    data: EnvelopeData<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeData<'a> {
    base_type: &'a str,
    base_data: &'a Value,
}

#[derive(Debug, Clone)]
pub struct Serializer {
    instrumentation_key: String,
    compression: Compression,
    compression_level: i32,
    max_payload_bytes: usize,
    max_batch_records: usize,
}

impl Serializer {
    #[must_use]
    pub fn new(config: &ChannelConfig) -> Self {
        Serializer {
            instrumentation_key: config.instrumentation_key.clone(),
            compression: config.compression,
            compression_level: config.compression_level,
            max_payload_bytes: config.max_payload_bytes,
            max_batch_records: config.max_batch_records,
        }
    }

    pub fn serialize(&self, records: &[Record]) -> Result<SerializedBatch, SerializationError> {
        if records.is_empty() {
            return Err(SerializationError::EmptyBatch);
        }

        let mut batch = SerializedBatch::default();
        let mut chunk: Vec<u8> = Vec::new();
        let mut chunk_records = 0;

        for record in records {
            let line = self.envelope(record)?;
            if line.len() > self.max_payload_bytes {
                warn!(
                    "CHANNEL | Dropping {:?} record of {} bytes, larger than the {} byte payload limit",
                    record.kind(),
                    line.len(),
                    self.max_payload_bytes
                );
                batch.oversized += 1;
                continue;
            }

            let separator = usize::from(chunk_records > 0);
            if chunk_records > 0
                && (chunk_records >= self.max_batch_records
                    || chunk.len() + separator + line.len() > self.max_payload_bytes)
            {
                batch
                    .payloads
                    .push(self.finish(std::mem::take(&mut chunk), chunk_records)?);
                chunk_records = 0;
            }

            if chunk_records > 0 {
                chunk.push(b'\n');
            }
            chunk.extend_from_slice(&line);
            chunk_records += 1;
        }

        if chunk_records > 0 {
            batch.payloads.push(self.finish(chunk, chunk_records)?);
        }
        Ok(batch)
    }

    fn envelope(&self, record: &Record) -> Result<Vec<u8>, SerializationError> {
        let kind = record.kind();
        let envelope = Envelope {
            name: kind.envelope_name(),
            time: record
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            i_key: &self.instrumentation_key,
            data: EnvelopeData {
                base_type: kind.base_type(),
                base_data: record.payload(),
            },
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn finish(&self, content: Vec<u8>, record_count: usize) -> Result<Payload, SerializationError> {
        let bytes = match self.compression {
            Compression::Gzip => {
                let level = u32::try_from(self.compression_level).unwrap_or(6);
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(level));
                encoder.write_all(&content)?;
                encoder.finish()?
            }
            Compression::Zstd => {
                let mut encoder =
                    zstd::stream::write::Encoder::new(Vec::new(), self.compression_level)?;
                encoder.write_all(&content)?;
                encoder.finish()?
            }
            Compression::None => content,
        };
        Ok(Payload {
            bytes: Bytes::from(bytes),
            content_type: CONTENT_TYPE,
            content_encoding: self.compression.content_encoding(),
            record_count,
        })
    }
}
