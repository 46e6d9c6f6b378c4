// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use serde::Deserialize;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_channel::{Channel, ChannelConfig, FlushOutcome, Record, RecordKind};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// One line of input: `{"kind": "event", "payload": {...}}`.
#[derive(Debug, Deserialize)]
struct InputLine {
    kind: RecordKind,
    payload: serde_json::Value,
}

fn parse_line(line: &str) -> Result<Option<Record>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let input: InputLine = serde_json::from_str(line)?;
    Ok(Some(Record::new(input.kind, input.payload)))
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TELEMETRY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ChannelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}. Shutting down forwarder.");
            return;
        }
    };

    let channel = match Channel::start(config).await {
        Ok(channel) => channel,
        Err(e) => {
            error!("Error starting telemetry channel: {e}. Shutting down forwarder.");
            return;
        }
    };
    info!("Forwarding telemetry read from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stats_interval = interval(STATS_INTERVAL);
    stats_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Received interrupt, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(record)) => {
                        if let Err(e) = channel.enqueue(record) {
                            warn!("Rejected record: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Skipping malformed input line: {e}"),
                },
                Ok(None) => {
                    debug!("Input closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {e}");
                    break;
                }
            },
            _ = stats_interval.tick() => {
                debug!("Channel stats: {:?}", channel.stats());
            }
        }
    }

    match channel.shutdown(SHUTDOWN_TIMEOUT).await {
        FlushOutcome::Completed => info!("All telemetry delivered"),
        FlushOutcome::Partial { undelivered } => {
            warn!("{undelivered} transmissions were not delivered");
        }
        FlushOutcome::TimedOut { in_flight } => {
            warn!("Shutdown timed out with {in_flight} transmissions in flight");
        }
    }
    match serde_json::to_string(&channel.stats()) {
        Ok(stats) => info!("Final channel stats: {stats}"),
        Err(e) => debug!("Failed to serialize channel stats: {e}"),
    }
}
