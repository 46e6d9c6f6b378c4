// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_channel::sender::classify_status;
use telemetry_channel::{
    BackoffConfig, Channel, ChannelConfig, Record, RecordKind, SendOutcome, Sender, Transmission,
};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct Call {
    pub at: Instant,
    pub attempt: u32,
    pub size: usize,
}

/// Sender replaying a fixed list of outcomes, then `Success`.
///
/// A gated sender holds every send until [`ScriptedSender::release`] hands
/// out a permit, or until the send is cancelled.
#[derive(Debug)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<SendOutcome>>,
    calls: Mutex<Vec<Call>>,
    called: Notify,
    gate: Option<Semaphore>,
}

impl ScriptedSender {
    pub fn new(script: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(ScriptedSender {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            called: Notify::new(),
            gate: None,
        })
    }

    pub fn statuses(statuses: &[u16]) -> Arc<Self> {
        Self::new(
            statuses
                .iter()
                .map(|s| classify_status(StatusCode::from_u16(*s).unwrap(), None))
                .collect(),
        )
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(ScriptedSender {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            called: Notify::new(),
            gate: Some(Semaphore::new(0)),
        })
    }

    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.called.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.calls.lock().unwrap().len() >= n {
                return;
            }
            notified.await;
        }
    }

    /// Time between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        self.calls()
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn send(&self, transmission: &Transmission, cancel: &CancellationToken) -> SendOutcome {
        self.calls.lock().unwrap().push(Call {
            at: Instant::now(),
            attempt: transmission.attempt(),
            size: transmission.size(),
        });
        self.called.notify_waiters();

        if let Some(gate) = &self.gate {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SendOutcome::Cancelled,
                permit = gate.acquire() => permit.unwrap().forget(),
            }
        }

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Success { status: 200 })
    }
}

pub fn config() -> ChannelConfig {
    ChannelConfig {
        instrumentation_key: "test-ikey".to_string(),
        sending_interval: Duration::from_secs(3600),
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter_fraction: 0.0,
        },
        ..ChannelConfig::default()
    }
}

pub async fn channel(config: ChannelConfig, sender: Arc<ScriptedSender>) -> Channel {
    Channel::with_sender(config, sender)
        .await
        .expect("failed to start channel")
}

pub fn event(n: usize) -> Record {
    Record::new(RecordKind::Event, json!({ "name": format!("event-{n}") }))
}
