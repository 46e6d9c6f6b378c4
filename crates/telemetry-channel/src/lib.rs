// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process buffering and delivery of telemetry records.
//!
//! Producers hand [`Record`]s to a [`Channel`] from any thread. The channel
//! batches them, serializes them into compressed JSON-lines payloads and posts
//! them to the ingestion endpoint, retrying with per-destination backoff and
//! spilling to an optional on-disk store when retries run out.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod http;
pub mod persistence;
pub mod record;
pub mod scheduler;
pub mod sender;
pub mod serializer;
pub mod stats;
pub mod transmission;

pub use backoff::{BackoffConfig, BackoffPhase, BackoffPolicy, BackoffState};
pub use channel::Channel;
pub use config::connection_string::ConnectionString;
pub use config::{ChannelConfig, Compression, StorageConfig};
pub use credential::{TokenResolverFn, TokenSupplier};
pub use error::{ChannelError, SerializationError, StorageError};
pub use record::{Record, RecordKind};
pub use scheduler::{FlushOutcome, SweepReport};
pub use sender::{HttpSender, SendOutcome, Sender};
pub use stats::StatsSnapshot;
pub use transmission::Transmission;
