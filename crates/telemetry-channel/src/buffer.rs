// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded holding area for records awaiting batching.
//!
//! Producers append with [`TelemetryBuffer::enqueue`] from any thread; the
//! scheduler takes everything at once with [`TelemetryBuffer::drain`]. The
//! append is the only critical section shared between the two.
//!
//! When an insert fills the buffer, the scheduler is woken through
//! [`TelemetryBuffer::full`] so it can drain before the next timer tick.
//! Records arriving while the buffer is already full are dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::ChannelError;
use crate::record::Record;
use crate::stats::{self, ChannelStats};

#[derive(Debug)]
pub struct TelemetryBuffer {
    items: Mutex<Vec<Record>>,
    capacity: AtomicUsize,
    full: Notify,
    stats: Arc<ChannelStats>,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize, stats: Arc<ChannelStats>) -> Result<Self, ChannelError> {
        validate_capacity(capacity)?;
        Ok(TelemetryBuffer {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
            full: Notify::new(),
            stats,
        })
    }

    /// Appends a record without blocking on anything but the append itself.
    ///
    /// Fails only for an invalid record. A record that does not fit is
    /// dropped and counted, never reported to the caller.
    pub fn enqueue(&self, record: Record) -> Result<(), ChannelError> {
        record.validate()?;

        let capacity = self.capacity();
        let len = {
            let mut items = self.lock();
            if items.len() >= capacity {
                None
            } else {
                items.push(record);
                Some(items.len())
            }
        };

        match len {
            Some(len) => {
                stats::bump(&self.stats.enqueued);
                if len >= capacity {
                    self.full.notify_one();
                }
            }
            None => {
                stats::bump(&self.stats.dropped_buffer_full);
                debug!("CHANNEL | Buffer full ({capacity} records), dropping incoming record");
                self.full.notify_one();
            }
        }
        Ok(())
    }

    /// Removes and returns every held record in insertion order.
    pub fn drain(&self) -> Vec<Record> {
        std::mem::take(&mut *self.lock())
    }

    /// Resolves once an insert has filled the buffer.
    pub fn full(&self) -> Notified<'_> {
        self.full.notified()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Applies to later inserts only; held records are never truncated.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ChannelError> {
        validate_capacity(capacity)?;
        self.capacity.store(capacity, Ordering::Release);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Record>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_capacity(capacity: usize) -> Result<(), ChannelError> {
    if capacity == 0 {
        return Err(ChannelError::InvalidArgument(
            "buffer capacity must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
