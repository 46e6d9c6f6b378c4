// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The loop that moves records from the buffer to the network.
//!
//! [`Scheduler::run`] wakes on its sending interval, on a buffer-full
//! signal, on a command from its [`SchedulerHandle`] and, when the fallback
//! store is enabled, on its sweep interval. Every wake-up that drains
//! records hands the resulting transmissions to delivery tasks; a semaphore
//! bounds how many of them talk to the network at once.
//!
//! Delivery failures never leave this module as errors. They end up as
//! retries, spills to the fallback store, drops, and the matching counters.

use chrono::Utc;
use reqwest::Url;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore, SemaphorePermit};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::{BackoffPolicy, BackoffRegistry, BackoffState};
use crate::buffer::TelemetryBuffer;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, StorageError};
use crate::persistence::{PersistenceFallback, SpillOutcome};
use crate::sender::{SendOutcome, Sender};
use crate::serializer::Serializer;
use crate::stats::{self, ChannelStats};
use crate::transmission::{destination_key, Transmission};

/// How long shutdown waits for cancelled deliveries to reach the fallback.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum SchedulerCommand {
    SetSendingInterval(Duration),
    Shutdown,
}

/// Result of a bounded wait for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything drained was delivered.
    Completed,
    /// Nothing is left in flight, but some transmissions were dropped or
    /// spilled to the fallback store while waiting.
    Partial { undelivered: u64 },
    /// The timeout elapsed with deliveries still running. They keep going.
    TimedOut { in_flight: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub remaining: usize,
    /// The sweep stopped early on a retryable failure, an armed backoff or
    /// shutdown.
    pub interrupted: bool,
}

enum Wake {
    Command(Option<SchedulerCommand>),
    Drain,
    Sweep,
    Stop,
}

/// Counts a delivery as in flight for as long as it is alive.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn start(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        InFlight(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug)]
struct Core {
    buffer: Arc<TelemetryBuffer>,
    serializer: Serializer,
    sender: Arc<dyn Sender>,
    endpoint: Url,
    backoff: BackoffRegistry,
    fallback: Option<Arc<PersistenceFallback>>,
    permits: Semaphore,
    max_retries: u32,
    in_flight: Arc<watch::Sender<usize>>,
    requeued: Mutex<Vec<Transmission>>,
    drain_lock: Mutex<()>,
    sweep_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    stats: Arc<ChannelStats>,
}

pub struct Scheduler {
    core: Arc<Core>,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    sending_interval: Duration,
    sweep_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    core: Arc<Core>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: &ChannelConfig,
        buffer: Arc<TelemetryBuffer>,
        sender: Arc<dyn Sender>,
        fallback: Option<Arc<PersistenceFallback>>,
        stats: Arc<ChannelStats>,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0usize);
        let sweep_interval = fallback
            .as_ref()
            .and(config.storage.as_ref())
            .map(|storage| storage.sweep_interval);

        let core = Arc::new(Core {
            buffer,
            serializer: Serializer::new(config),
            sender,
            endpoint: config.endpoint.clone(),
            backoff: BackoffRegistry::new(config.backoff),
            fallback,
            permits: Semaphore::new(config.max_in_flight),
            max_retries: config.max_retries,
            in_flight: Arc::new(in_flight),
            requeued: Mutex::new(Vec::new()),
            drain_lock: Mutex::new(()),
            sweep_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            stats,
        });

        let scheduler = Scheduler {
            core: Arc::clone(&core),
            rx,
            sending_interval: config.sending_interval,
            sweep_interval,
        };
        (scheduler, SchedulerHandle { tx, core })
    }

    pub async fn run(mut self) {
        debug!(
            "CHANNEL | Scheduler started, sending every {:?}",
            self.sending_interval
        );
        let mut ticker = new_ticker(self.sending_interval);
        let mut sweeper = self.sweep_interval.map(new_ticker);

        loop {
            let wake = tokio::select! {
                biased;
                () = self.core.cancel.cancelled() => Wake::Stop,
                command = self.rx.recv() => Wake::Command(command),
                () = self.core.buffer.full() => Wake::Drain,
                _ = ticker.tick() => Wake::Drain,
                () = tick_optional(&mut sweeper) => Wake::Sweep,
            };

            match wake {
                Wake::Drain => self.core.drain_and_dispatch(),
                Wake::Sweep => self.spawn_sweep(),
                Wake::Command(Some(SchedulerCommand::SetSendingInterval(interval))) => {
                    debug!("CHANNEL | Sending interval changed to {interval:?}");
                    self.sending_interval = interval;
                    ticker = new_ticker(interval);
                }
                Wake::Command(Some(SchedulerCommand::Shutdown) | None) | Wake::Stop => break,
            }
        }
        debug!("CHANNEL | Scheduler stopped");
    }

    fn spawn_sweep(&self) {
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let Ok(_guard) = core.sweep_lock.try_lock() else {
                debug!("CHANNEL | Previous sweep still running, skipping");
                return;
            };
            if let Err(e) = core.sweep_locked().await {
                error!("CHANNEL | Persistence sweep failed: {e}");
            }
        });
    }
}

impl SchedulerHandle {
    /// Drains the buffer and waits up to `timeout` for every in-flight
    /// delivery to finish.
    pub async fn flush(&self, timeout: Duration) -> FlushOutcome {
        self.core.flush(timeout).await
    }

    pub fn set_sending_interval(&self, interval: Duration) -> Result<(), ChannelError> {
        if interval.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "sending interval must be greater than 0".to_string(),
            ));
        }
        self.tx
            .send(SchedulerCommand::SetSendingInterval(interval))
            .map_err(|_| ChannelError::ShuttingDown)
    }

    /// Flushes, then stops the loop and cancels whatever is still running.
    /// Cancelled deliveries go to the fallback store when it is enabled.
    pub async fn shutdown(&self, timeout: Duration) -> FlushOutcome {
        let outcome = self.core.flush(timeout).await;

        if self.tx.send(SchedulerCommand::Shutdown).is_err() {
            debug!("CHANNEL | Scheduler already stopped");
        }
        self.core.cancel.cancel();
        self.core.release_requeued().await;

        let spilled = self.core.wait_idle(SHUTDOWN_GRACE).await;
        if !spilled {
            warn!(
                "CHANNEL | {} deliveries still running after shutdown",
                self.in_flight()
            );
        }
        outcome
    }

    /// Runs one persistence sweep now, waiting for a running one to finish.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        let _guard = self.core.sweep_lock.lock().await;
        self.core.sweep_locked().await
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.core.in_flight.borrow()
    }

    /// Backoff state of the channel's endpoint.
    #[must_use]
    pub fn backoff_state(&self) -> BackoffState {
        self.core
            .backoff
            .state(&destination_key(&self.core.endpoint))
            .unwrap_or_default()
    }
}

impl Core {
    fn drain_and_dispatch(self: &Arc<Self>) {
        let _drain = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let requeued = std::mem::take(
            &mut *self.requeued.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for transmission in requeued {
            self.spawn_delivery(transmission);
        }

        let records = self.buffer.drain();
        if records.is_empty() {
            return;
        }

        match self.serializer.serialize(&records) {
            Ok(batch) => {
                if batch.oversized > 0 {
                    stats::add(&self.stats.dropped_serialization, batch.oversized as u64);
                }
                debug!(
                    "CHANNEL | Drained {} records into {} transmissions",
                    records.len(),
                    batch.payloads.len()
                );
                for payload in batch.payloads {
                    self.spawn_delivery(Transmission::new(self.endpoint.clone(), payload));
                }
            }
            Err(e) => {
                stats::add(&self.stats.dropped_serialization, records.len() as u64);
                error!("CHANNEL | Dropping batch of {} records: {e}", records.len());
            }
        }
    }

    fn spawn_delivery(self: &Arc<Self>, transmission: Transmission) {
        let in_flight = InFlight::start(&self.in_flight);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            core.deliver(transmission).await;
        });
    }

    async fn deliver(&self, mut transmission: Transmission) {
        let policy = self.backoff.for_destination(&transmission.destination());

        loop {
            let Some(permit) = self.wait_turn(&policy).await else {
                return self.abandon(transmission).await;
            };

            stats::bump(&self.stats.transmissions_sent);
            let outcome = self.sender.send(&transmission, &self.cancel).await;
            drop(permit);

            let (server_delay, reason) = match outcome {
                SendOutcome::Success { status } => {
                    policy.on_success();
                    stats::bump(&self.stats.transmissions_delivered);
                    debug!(
                        "CHANNEL | Delivered {} bytes with status {status} after {} retries",
                        transmission.size(),
                        transmission.attempt()
                    );
                    return;
                }
                SendOutcome::Terminal { status, reason } => {
                    stats::bump(&self.stats.dropped_terminal);
                    error!(
                        "CHANNEL | Dropping transmission of {} bytes, not retryable (status {status:?}): {reason}",
                        transmission.size()
                    );
                    return;
                }
                SendOutcome::Cancelled => return self.abandon(transmission).await,
                SendOutcome::RetryableThrottled {
                    status,
                    retry_after,
                } => {
                    stats::bump(&self.stats.throttled);
                    (retry_after, format!("throttled with status {status}"))
                }
                SendOutcome::RetryableTransient { reason, .. } => (None, reason),
            };

            let delay = policy.on_failure(server_delay);
            let attempt = transmission.next_attempt();
            if attempt >= self.max_retries {
                warn!(
                    "CHANNEL | Giving up on transmission after {attempt} attempts: {reason}"
                );
                return self.exhausted(transmission).await;
            }
            stats::bump(&self.stats.retries);
            debug!("CHANNEL | Retrying transmission in {delay:?} (attempt {attempt}): {reason}");
        }
    }

    /// Waits until the destination's backoff gate is open and a send
    /// permit is free. `None` when cancelled first.
    async fn wait_turn(&self, policy: &BackoffPolicy) -> Option<SemaphorePermit<'_>> {
        loop {
            let wait = policy.ready_in();
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return None,
                    () = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = self.permits.acquire() => permit.ok(),
            }?;
            // Another delivery may have armed the gate while we queued.
            if policy.ready_in().is_zero() {
                return Some(permit);
            }
        }
    }

    async fn exhausted(&self, transmission: Transmission) {
        match &self.fallback {
            Some(fallback) => self.spill(fallback, &transmission).await,
            None => {
                stats::bump(&self.stats.dropped_exhausted);
                warn!(
                    "CHANNEL | Dropping transmission of {} bytes, retries exhausted and no fallback store",
                    transmission.size()
                );
            }
        }
    }

    /// A cancelled send is requeued while running, spilled or dropped once
    /// shutting down.
    async fn abandon(&self, transmission: Transmission) {
        if !self.cancel.is_cancelled() {
            self.requeued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(transmission);
            return;
        }
        match &self.fallback {
            Some(fallback) => self.spill(fallback, &transmission).await,
            None => {
                stats::bump(&self.stats.dropped_cancelled);
                debug!(
                    "CHANNEL | Dropping transmission of {} bytes cancelled by shutdown",
                    transmission.size()
                );
            }
        }
    }

    async fn spill(&self, fallback: &PersistenceFallback, transmission: &Transmission) {
        match fallback.spill(transmission).await {
            Ok(SpillOutcome::Stored { key, evicted }) => {
                stats::bump(&self.stats.spilled);
                debug!("CHANNEL | Spilled transmission as entry {key}, evicted {evicted}");
            }
            Ok(SpillOutcome::Dropped { .. }) => stats::bump(&self.stats.dropped_exhausted),
            Err(e) => {
                stats::bump(&self.stats.dropped_exhausted);
                error!("CHANNEL | Failed to spill transmission: {e}");
            }
        }
    }

    /// Sends cancelled while running are requeued, so they are dispatched
    /// again until nothing is in flight and nothing is waiting.
    async fn flush(self: &Arc<Self>, timeout: Duration) -> FlushOutcome {
        let undelivered_before = self.stats.undelivered();
        let deadline = Instant::now().checked_add(timeout);

        loop {
            self.drain_and_dispatch();
            let remaining =
                deadline.map_or(timeout, |at| at.saturating_duration_since(Instant::now()));
            if !self.wait_idle(remaining).await {
                return FlushOutcome::TimedOut {
                    in_flight: *self.in_flight.borrow(),
                };
            }
            if !self.has_requeued() || self.cancel.is_cancelled() {
                break;
            }
        }

        match self.stats.undelivered().saturating_sub(undelivered_before) {
            0 => FlushOutcome::Completed,
            undelivered => FlushOutcome::Partial { undelivered },
        }
    }

    /// Hands anything still requeued to the fallback, or drops it, once
    /// cancelled.
    async fn release_requeued(&self) {
        let requeued = std::mem::take(
            &mut *self.requeued.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for transmission in requeued {
            self.abandon(transmission).await;
        }
    }

    fn has_requeued(&self) -> bool {
        !self
            .requeued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// True once nothing is in flight, false if `timeout` elapsed first.
    async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|in_flight| *in_flight == 0).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Caller holds `sweep_lock`.
    async fn sweep_locked(&self) -> Result<SweepReport, StorageError> {
        let mut report = SweepReport::default();
        let Some(store) = &self.fallback else {
            return Ok(report);
        };

        report.expired = store.purge_expired(Utc::now()).await?;
        for key in store.keys().await {
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let Some(entry) = store.load(key).await? else {
                continue;
            };
            if entry.expires_at <= Utc::now() {
                store.remove(key).await?;
                stats::bump(&self.stats.dropped_expired);
                report.expired += 1;
                continue;
            }

            let policy = self.backoff.for_destination(&entry.transmission.destination());
            if !policy.ready_in().is_zero() {
                report.interrupted = true;
                break;
            }
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = self.permits.acquire() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.interrupted = true;
                break;
            };

            stats::bump(&self.stats.transmissions_sent);
            let outcome = self.sender.send(&entry.transmission, &self.cancel).await;
            drop(permit);

            match outcome {
                SendOutcome::Success { .. } => {
                    policy.on_success();
                    store.remove(key).await?;
                    stats::bump(&self.stats.transmissions_delivered);
                    stats::bump(&self.stats.restored);
                    report.delivered += 1;
                }
                SendOutcome::Terminal { status, reason } => {
                    store.remove(key).await?;
                    stats::bump(&self.stats.dropped_terminal);
                    error!(
                        "CHANNEL | Dropping stored entry {key}, not retryable (status {status:?}): {reason}"
                    );
                    report.dropped += 1;
                }
                SendOutcome::RetryableThrottled { retry_after, .. } => {
                    stats::bump(&self.stats.throttled);
                    policy.on_failure(retry_after);
                    report.interrupted = true;
                    break;
                }
                SendOutcome::RetryableTransient { reason, .. } => {
                    policy.on_failure(None);
                    debug!("CHANNEL | Stopping sweep at entry {key}: {reason}");
                    report.interrupted = true;
                    break;
                }
                SendOutcome::Cancelled => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        report.remaining = store.len().await;
        if report.delivered > 0 || report.expired > 0 || report.dropped > 0 {
            debug!(
                "CHANNEL | Sweep delivered {}, expired {}, dropped {}, {} remaining",
                report.delivered, report.expired, report.dropped, report.remaining
            );
        }
        Ok(report)
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
