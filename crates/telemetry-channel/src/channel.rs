// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::BackoffState;
use crate::buffer::TelemetryBuffer;
use crate::config::{ChannelConfig, DEVELOPER_MODE_CAPACITY, DEVELOPER_MODE_INTERVAL};
use crate::error::ChannelError;
use crate::persistence::PersistenceFallback;
use crate::record::Record;
use crate::scheduler::{FlushOutcome, Scheduler, SchedulerHandle, SweepReport};
use crate::sender::{HttpSender, Sender};
use crate::stats::{ChannelStats, StatsSnapshot};

/// Sending interval and capacity chosen by the caller. Developer mode
/// overrides them without forgetting them.
#[derive(Debug)]
struct Settings {
    developer_mode: bool,
    capacity: usize,
    sending_interval: Duration,
}

impl Settings {
    fn effective_capacity(&self) -> usize {
        if self.developer_mode {
            DEVELOPER_MODE_CAPACITY
        } else {
            self.capacity
        }
    }

    fn effective_interval(&self) -> Duration {
        if self.developer_mode {
            DEVELOPER_MODE_INTERVAL
        } else {
            self.sending_interval
        }
    }
}

/// Entry point of the pipeline: one buffer, one scheduler loop and an
/// optional fallback store.
///
/// Producers only ever call [`Channel::enqueue`], which never waits on the
/// network. Lifecycle code calls [`Channel::shutdown`] before exit.
#[derive(Debug)]
pub struct Channel {
    buffer: Arc<TelemetryBuffer>,
    scheduler: SchedulerHandle,
    fallback: Option<Arc<PersistenceFallback>>,
    stats: Arc<ChannelStats>,
    settings: Mutex<Settings>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Starts a channel posting over HTTP. Must be called within a Tokio
    /// runtime.
    pub async fn start(config: ChannelConfig) -> Result<Self, ChannelError> {
        config.validate()?;
        let sender = Arc::new(HttpSender::new(&config));
        Self::with_sender(config, sender).await
    }

    /// Starts a channel with a custom [`Sender`].
    pub async fn with_sender(
        mut config: ChannelConfig,
        sender: Arc<dyn Sender>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;

        let settings = Settings {
            developer_mode: config.developer_mode,
            capacity: config.buffer_capacity,
            sending_interval: config.sending_interval,
        };
        config.buffer_capacity = settings.effective_capacity();
        config.sending_interval = settings.effective_interval();

        let stats = Arc::new(ChannelStats::default());
        let buffer = Arc::new(TelemetryBuffer::new(
            config.buffer_capacity,
            Arc::clone(&stats),
        )?);
        let fallback = match &config.storage {
            Some(storage) => Some(Arc::new(
                PersistenceFallback::open(storage, Arc::clone(&stats)).await?,
            )),
            None => None,
        };

        let (scheduler, handle) = Scheduler::new(
            &config,
            Arc::clone(&buffer),
            sender,
            fallback.clone(),
            Arc::clone(&stats),
        );
        let task = tokio::spawn(scheduler.run());

        debug!(
            "CHANNEL | Started channel to {} (capacity {}, interval {:?}, fallback {})",
            config.endpoint,
            config.buffer_capacity,
            config.sending_interval,
            if fallback.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Channel {
            buffer,
            scheduler: handle,
            fallback,
            stats,
            settings: Mutex::new(settings),
            task: Mutex::new(Some(task)),
        })
    }

    /// Hands a record to the pipeline without blocking.
    ///
    /// Only an invalid record or a stopped channel is reported; records
    /// dropped for lack of room are visible in [`Channel::stats`].
    pub fn enqueue(&self, record: Record) -> Result<(), ChannelError> {
        if self.scheduler.is_shutting_down() {
            return Err(ChannelError::ShuttingDown);
        }
        self.buffer.enqueue(record)
    }

    pub async fn flush(&self, timeout: Duration) -> FlushOutcome {
        self.scheduler.flush(timeout).await
    }

    pub fn set_capacity(&self, capacity: usize) -> Result<(), ChannelError> {
        let mut settings = self.settings();
        self.buffer.set_capacity(capacity)?;
        settings.capacity = capacity;
        Ok(())
    }

    pub fn set_sending_interval(&self, interval: Duration) -> Result<(), ChannelError> {
        let mut settings = self.settings();
        self.scheduler.set_sending_interval(interval)?;
        settings.sending_interval = interval;
        Ok(())
    }

    /// Switches to a small buffer and a short interval for near-immediate
    /// feedback. Turning it off restores the configured values.
    pub fn set_developer_mode(&self, enabled: bool) -> Result<(), ChannelError> {
        let mut settings = self.settings();
        if settings.developer_mode == enabled {
            return Ok(());
        }
        settings.developer_mode = enabled;
        self.buffer.set_capacity(settings.effective_capacity())?;
        self.scheduler
            .set_sending_interval(settings.effective_interval())?;
        debug!(
            "CHANNEL | Developer mode {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    #[must_use]
    pub fn developer_mode(&self) -> bool {
        self.settings().developer_mode
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    #[must_use]
    pub fn sending_interval(&self) -> Duration {
        self.settings().effective_interval()
    }

    /// Records waiting in the buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Flushes with `timeout`, then stops the pipeline. Later calls to
    /// [`Channel::enqueue`] fail with [`ChannelError::ShuttingDown`].
    pub async fn shutdown(&self, timeout: Duration) -> FlushOutcome {
        let outcome = self.scheduler.shutdown(timeout).await;

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match tokio::time::timeout(Duration::from_secs(1), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("CHANNEL | Scheduler task failed: {e}"),
                Err(_) => warn!("CHANNEL | Scheduler task did not stop in time"),
            }
        }

        let stats = self.stats();
        debug!(
            "CHANNEL | Shut down after delivering {} transmissions ({} dropped, {} spilled)",
            stats.transmissions_delivered,
            stats.dropped_terminal + stats.dropped_exhausted + stats.dropped_cancelled,
            stats.spilled
        );
        outcome
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn backoff_state(&self) -> BackoffState {
        self.scheduler.backoff_state()
    }

    /// Retries stored transmissions now instead of waiting for the next
    /// periodic sweep.
    pub async fn sweep_persisted(&self) -> Result<SweepReport, ChannelError> {
        Ok(self.scheduler.sweep().await?)
    }

    /// Number of transmissions held by the fallback store.
    pub async fn persisted(&self) -> usize {
        match &self.fallback {
            Some(fallback) => fallback.len().await,
            None => 0,
        }
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::sender::SendOutcome;
    use crate::transmission::Transmission;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct AlwaysOk;

    #[async_trait]
    impl Sender for AlwaysOk {
        async fn send(&self, _: &Transmission, _: &CancellationToken) -> SendOutcome {
            SendOutcome::Success { status: 200 }
        }
    }

    fn config() -> ChannelConfig {
        ChannelConfig {
            instrumentation_key: "ikey".to_string(),
            buffer_capacity: 100,
            sending_interval: Duration::from_secs(60),
            ..ChannelConfig::default()
        }
    }

    async fn channel(config: ChannelConfig) -> Channel {
        Channel::with_sender(config, Arc::new(AlwaysOk)).await.unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Channel::with_sender(ChannelConfig::default(), Arc::new(AlwaysOk)).await;
        assert!(matches!(result, Err(ChannelError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_developer_mode_overrides_and_restores() {
        let channel = channel(config()).await;
        assert_eq!(channel.capacity(), 100);

        channel.set_developer_mode(true).unwrap();
        assert!(channel.developer_mode());
        assert_eq!(channel.capacity(), DEVELOPER_MODE_CAPACITY);
        assert_eq!(channel.sending_interval(), DEVELOPER_MODE_INTERVAL);

        channel.set_developer_mode(false).unwrap();
        assert_eq!(channel.capacity(), 100);
        assert_eq!(channel.sending_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_capacity_set_in_developer_mode_survives_it() {
        let channel = channel(ChannelConfig {
            developer_mode: true,
            ..config()
        })
        .await;
        assert_eq!(channel.capacity(), DEVELOPER_MODE_CAPACITY);

        channel.set_capacity(42).unwrap();
        assert_eq!(channel.capacity(), 42);
        channel.set_developer_mode(false).unwrap();
        assert_eq!(channel.capacity(), 42);
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let channel = channel(config()).await;
        assert!(matches!(
            channel.set_capacity(0),
            Err(ChannelError::InvalidArgument(_))
        ));
        assert!(matches!(
            channel.set_sending_interval(Duration::ZERO),
            Err(ChannelError::InvalidArgument(_))
        ));
        assert_eq!(channel.capacity(), 100);
        assert_eq!(channel.sending_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let channel = channel(config()).await;
        channel
            .enqueue(Record::new(RecordKind::Event, json!({ "name": "a" })))
            .unwrap();

        let outcome = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, FlushOutcome::Completed);
        assert_eq!(channel.stats().transmissions_delivered, 1);

        let err = channel
            .enqueue(Record::new(RecordKind::Event, json!({ "name": "b" })))
            .unwrap_err();
        assert!(matches!(err, ChannelError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_invalid_record_is_reported_to_producer() {
        let channel = channel(config()).await;
        let err = channel
            .enqueue(Record::new(RecordKind::Event, serde_json::Value::Null))
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));
        assert_eq!(channel.buffered(), 0);
    }
}
