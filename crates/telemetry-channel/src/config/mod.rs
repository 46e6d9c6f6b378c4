// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline context handed to a [`Channel`](crate::channel::Channel) at
//! construction. Nothing in the crate reads process-wide state; two channels
//! built from two configs are fully independent.

pub mod connection_string;

use reqwest::Url;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::credential::TokenSupplier;
use crate::error::ChannelError;
use connection_string::{track_endpoint, ConnectionString, DEFAULT_INGESTION_BASE};

pub const DEFAULT_SENDING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BUFFER_CAPACITY: usize = 500;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 3 * 1024 * 1024;
pub const DEFAULT_MAX_BATCH_RECORDS: usize = 1_000;

pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_STORAGE_TTL: Duration = Duration::from_secs(48 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Buffer capacity while developer mode is on.
pub const DEVELOPER_MODE_CAPACITY: usize = 15;
/// Sending interval while developer mode is on.
pub const DEVELOPER_MODE_INTERVAL: Duration = Duration::from_secs(5);

const ENV_PREFIX: &str = "TELEMETRY_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
    None,
}

impl Compression {
    /// Value of the `Content-Encoding` header, `None` when uncompressed.
    #[must_use]
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Compression::Gzip => Some("gzip"),
            Compression::Zstd => Some("zstd"),
            Compression::None => None,
        }
    }
}

impl FromStr for Compression {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "none" | "identity" => Ok(Compression::None),
            other => Err(ChannelError::InvalidConfig(format!(
                "unknown compression '{other}', expected gzip, zstd or none"
            ))),
        }
    }
}

/// Durable fallback store settings. The fallback is disabled when
/// [`ChannelConfig::storage`] is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Upper bound on the sum of stored payload bytes.
    pub quota_bytes: u64,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl StorageConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            path: path.into(),
            quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            ttl: DEFAULT_STORAGE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Full URL transmissions are posted to.
    pub endpoint: Url,
    pub instrumentation_key: String,
    pub sending_interval: Duration,
    pub buffer_capacity: usize,
    /// Upper bound on concurrent sends.
    pub max_in_flight: usize,
    /// In-memory attempts before a transmission is spilled or dropped.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub request_timeout: Duration,
    pub compression: Compression,
    pub compression_level: i32,
    pub max_payload_bytes: usize,
    pub max_batch_records: usize,
    pub storage: Option<StorageConfig>,
    pub developer_mode: bool,
    pub https_proxy: Option<String>,
    pub token_supplier: Option<Arc<TokenSupplier>>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            endpoint: default_endpoint(),
            instrumentation_key: String::new(),
            sending_interval: DEFAULT_SENDING_INTERVAL,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compression: Compression::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
            storage: None,
            developer_mode: false,
            https_proxy: None,
            token_supplier: None,
        }
    }
}

#[allow(clippy::expect_used)]
fn default_endpoint() -> Url {
    track_endpoint(DEFAULT_INGESTION_BASE).expect("default ingestion endpoint is a valid URL")
}

impl ChannelConfig {
    /// Builds a config from `TELEMETRY_*` environment variables.
    pub fn from_env() -> Result<Self, ChannelError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`ChannelConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChannelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = ChannelConfig::default();

        if let Some(raw) = var("CONNECTION_STRING") {
            let connection_string = ConnectionString::parse(&raw)?;
            config.endpoint = connection_string.track_endpoint()?;
            if let Some(key) = connection_string.instrumentation_key {
                config.instrumentation_key = key;
            }
        }
        if let Some(base) = var("ENDPOINT") {
            config.endpoint = track_endpoint(&base)?;
        }
        if let Some(key) = var("INSTRUMENTATION_KEY") {
            config.instrumentation_key = key;
        }

        if let Some(ms) = parse_var::<u64>(&var, "SENDING_INTERVAL_MS")? {
            config.sending_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&var, "BUFFER_CAPACITY")? {
            config.buffer_capacity = capacity;
        }
        if let Some(max_in_flight) = parse_var(&var, "MAX_IN_FLIGHT")? {
            config.max_in_flight = max_in_flight;
        }
        if let Some(max_retries) = parse_var(&var, "MAX_RETRIES")? {
            config.max_retries = max_retries;
        }
        if let Some(ms) = parse_var::<u64>(&var, "BACKOFF_BASE_MS")? {
            config.backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "BACKOFF_MAX_MS")? {
            config.backoff.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = parse_var(&var, "BACKOFF_JITTER")? {
            config.backoff.jitter_fraction = jitter;
        }
        if let Some(ms) = parse_var::<u64>(&var, "REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(compression) = parse_var(&var, "COMPRESSION")? {
            config.compression = compression;
        }
        if let Some(level) = parse_var(&var, "COMPRESSION_LEVEL")? {
            config.compression_level = level;
        }
        if let Some(max_payload_bytes) = parse_var(&var, "MAX_PAYLOAD_BYTES")? {
            config.max_payload_bytes = max_payload_bytes;
        }
        if let Some(max_batch_records) = parse_var(&var, "MAX_BATCH_RECORDS")? {
            config.max_batch_records = max_batch_records;
        }

        if let Some(path) = var("STORAGE_PATH") {
            let mut storage = StorageConfig::new(path);
            if let Some(quota) = parse_var(&var, "STORAGE_QUOTA_BYTES")? {
                storage.quota_bytes = quota;
            }
            if let Some(secs) = parse_var::<u64>(&var, "STORAGE_TTL_SECS")? {
                storage.ttl = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_var::<u64>(&var, "STORAGE_SWEEP_INTERVAL_SECS")? {
                storage.sweep_interval = Duration::from_secs(secs);
            }
            config.storage = Some(storage);
        }

        if let Some(raw) = var("DEVELOPER_MODE") {
            config.developer_mode = parse_bool(&raw).ok_or_else(|| {
                ChannelError::InvalidConfig(format!(
                    "{ENV_PREFIX}DEVELOPER_MODE must be true or false, got '{raw}'"
                ))
            })?;
        }

        config.https_proxy = var("PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY"));

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        let invalid = |msg: &str| Err(ChannelError::InvalidConfig(msg.to_string()));

        if self.instrumentation_key.trim().is_empty() {
            return invalid("instrumentation key is required");
        }
        if self.sending_interval.is_zero() {
            return invalid("sending interval must be greater than 0");
        }
        if self.buffer_capacity == 0 {
            return invalid("buffer capacity must be greater than 0");
        }
        if self.max_in_flight == 0 {
            return invalid("max in-flight sends must be greater than 0");
        }
        if self.request_timeout.is_zero() {
            return invalid("request timeout must be greater than 0");
        }
        if self.max_payload_bytes == 0 || self.max_batch_records == 0 {
            return invalid("payload limits must be greater than 0");
        }
        match self.compression {
            Compression::Gzip if !(0..=9).contains(&self.compression_level) => {
                return invalid("gzip compression level must be within [0, 9]");
            }
            Compression::Zstd if !(1..=22).contains(&self.compression_level) => {
                return invalid("zstd compression level must be within [1, 22]");
            }
            _ => {}
        }
        if !matches!(self.endpoint.scheme(), "http" | "https") {
            return invalid("endpoint must use http or https");
        }
        self.backoff.validate()?;

        if let Some(storage) = &self.storage {
            if storage.quota_bytes == 0 {
                return invalid("storage quota must be greater than 0");
            }
            if storage.ttl.is_zero() || storage.sweep_interval.is_zero() {
                return invalid("storage ttl and sweep interval must be greater than 0");
            }
        }
        Ok(())
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ChannelError>
where
    T: FromStr,
    T::Err: Display,
{
    var(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                ChannelError::InvalidConfig(format!("{ENV_PREFIX}{name}='{raw}': {e}"))
            })
        })
        .transpose()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
