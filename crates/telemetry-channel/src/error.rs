// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors surfaced synchronously to callers of the channel.
///
/// Delivery failures never show up here: they are handled inside the
/// pipeline and only reported through diagnostics and counters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A batch that can never be sent, no matter how often it is retried.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("One or more telemetry records are expected")]
    EmptyBatch,

    #[error("Failed to encode record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to compress payload: {0}")]
    Compression(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt entry {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
