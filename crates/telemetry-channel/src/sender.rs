// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network exchange for a single [`Transmission`].
//!
//! A [`Sender`] never returns an error for ordinary network or server
//! failures. It classifies the exchange into a [`SendOutcome`] and leaves
//! the retry decision to the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::credential::TokenSupplier;
use crate::http;
use crate::transmission::Transmission;

/// Legacy throttling status still returned by the ingestion service.
pub const STATUS_THROTTLED_LEGACY: u16 = 439;

/// Longest server-requested delay honored before a retry.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

const MAX_REASON_BODY_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success {
        status: u16,
    },
    /// The server asked to slow down, optionally with a minimum delay.
    RetryableThrottled {
        status: u16,
        retry_after: Option<Duration>,
    },
    RetryableTransient {
        status: Option<u16>,
        reason: String,
    },
    Terminal {
        status: Option<u16>,
        reason: String,
    },
    /// The send was aborted by shutdown. Neither success nor failure.
    Cancelled,
}

impl SendOutcome {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendOutcome::RetryableThrottled { .. } | SendOutcome::RetryableTransient { .. }
        )
    }
}

/// Maps a response status onto an outcome.
#[must_use]
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> SendOutcome {
    let code = status.as_u16();
    if status.is_success() {
        return SendOutcome::Success { status: code };
    }
    match code {
        429 | STATUS_THROTTLED_LEGACY => SendOutcome::RetryableThrottled {
            status: code,
            retry_after,
        },
        408 | 500..=599 => SendOutcome::RetryableTransient {
            status: Some(code),
            reason: format!("server responded with {status}"),
        },
        _ => SendOutcome::Terminal {
            status: Some(code),
            reason: format!("server responded with {status}"),
        },
    }
}

/// Reads `Retry-After` as either delta-seconds or an HTTP date, capped at
/// [`MAX_RETRY_AFTER`].
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let delay = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?;
            at.with_timezone(&Utc)
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        }
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

#[async_trait]
pub trait Sender: Send + Sync + Debug {
    /// Performs one exchange. Must return [`SendOutcome::Cancelled`]
    /// promptly once `cancel` fires.
    async fn send(&self, transmission: &Transmission, cancel: &CancellationToken) -> SendOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    timeout: Duration,
    token_supplier: Option<Arc<TokenSupplier>>,
}

impl HttpSender {
    #[must_use]
    pub fn new(config: &ChannelConfig) -> Self {
        HttpSender {
            client: http::get_client(config),
            timeout: config.request_timeout,
            token_supplier: config.token_supplier.clone(),
        }
    }

    async fn exchange(&self, transmission: &Transmission) -> SendOutcome {
        let mut request = self
            .client
            .post(transmission.endpoint().clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, transmission.content_type())
            .body(transmission.payload().clone());
        if let Some(encoding) = transmission.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(supplier) = &self.token_supplier {
            match supplier.get_token().await {
                Some(token) => request = request.bearer_auth(token),
                None => {
                    return SendOutcome::RetryableTransient {
                        status: None,
                        reason: "token supplier returned no token".to_string(),
                    }
                }
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return classify_error(&e),
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let outcome = classify_status(status, retry_after);
        match outcome {
            SendOutcome::Terminal { status, reason } => {
                let body = response.text().await.unwrap_or_default();
                SendOutcome::Terminal {
                    status,
                    reason: with_body(reason, &body),
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, transmission: &Transmission, cancel: &CancellationToken) -> SendOutcome {
        debug!(
            "CHANNEL | Sending {} bytes to {} (attempt {})",
            transmission.size(),
            transmission.endpoint(),
            transmission.attempt()
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => SendOutcome::Cancelled,
            outcome = self.exchange(transmission) => outcome,
        }
    }
}

fn classify_error(e: &reqwest::Error) -> SendOutcome {
    if e.is_builder() {
        return SendOutcome::Terminal {
            status: None,
            reason: format!("invalid request: {e}"),
        };
    }
    let reason = if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    SendOutcome::RetryableTransient {
        status: None,
        reason,
    }
}

fn with_body(reason: String, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return reason;
    }
    let mut end = body.len().min(MAX_REASON_BODY_BYTES);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{reason}: {}", &body[..end])
}
