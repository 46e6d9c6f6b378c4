// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::Url;

use crate::error::ChannelError;

pub const DEFAULT_INGESTION_BASE: &str = "https://dc.services.visualstudio.com/";
pub const TRACK_PATH: &str = "v2/track";

/// Parsed `Key=Value;Key=Value` connection string.
///
/// Keys are case-insensitive and unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pub instrumentation_key: Option<String>,
    pub ingestion_endpoint: Option<String>,
    pub endpoint_suffix: Option<String>,
    pub location: Option<String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, ChannelError> {
        if input.trim().is_empty() {
            return Err(ChannelError::InvalidConfig(
                "connection string is empty".to_string(),
            ));
        }

        let mut parsed = ConnectionString::default();
        for pair in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ChannelError::InvalidConfig(format!(
                    "connection string segment '{pair}' is not a Key=Value pair"
                )));
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.trim().to_ascii_lowercase().as_str() {
                "instrumentationkey" => &mut parsed.instrumentation_key,
                "ingestionendpoint" => &mut parsed.ingestion_endpoint,
                "endpointsuffix" => &mut parsed.endpoint_suffix,
                "location" => &mut parsed.location,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        Ok(parsed)
    }

    /// Base URL of the ingestion service, always ending with `/`.
    ///
    /// An explicit endpoint wins over one derived from the suffix.
    #[must_use]
    pub fn ingestion_base(&self) -> String {
        if let Some(endpoint) = &self.ingestion_endpoint {
            return with_trailing_slash(endpoint);
        }
        match &self.endpoint_suffix {
            Some(suffix) => {
                let suffix = suffix.trim_matches('.');
                match &self.location {
                    Some(location) => format!("https://{location}.dc.{suffix}/"),
                    None => format!("https://dc.{suffix}/"),
                }
            }
            None => DEFAULT_INGESTION_BASE.to_string(),
        }
    }

    pub fn track_endpoint(&self) -> Result<Url, ChannelError> {
        track_endpoint(&self.ingestion_base())
    }
}

/// Resolves `<base>/v2/track`.
pub fn track_endpoint(base: &str) -> Result<Url, ChannelError> {
    let base = Url::parse(&with_trailing_slash(base)).map_err(|e| {
        ChannelError::InvalidConfig(format!("invalid ingestion endpoint '{base}': {e}"))
    })?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(ChannelError::InvalidConfig(format!(
            "ingestion endpoint must use http or https, got '{}'",
            base.scheme()
        )));
    }
    base.join(TRACK_PATH).map_err(|e| {
        ChannelError::InvalidConfig(format!("invalid ingestion endpoint '{base}': {e}"))
    })
}

fn with_trailing_slash(url: &str) -> String {
    let url = url.trim();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}
