use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// epoch millis; zero means unset
const UNSET: i64 = 0;

/// Point-in-time copy of the stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStatistics {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub connection_start: Option<DateTime<Utc>>,
    pub last_message: Option<DateTime<Utc>>,
}

fn stamp(slot: &AtomicI64) {
    // clamp so a clock at the epoch still reads as set
    slot.store(Utc::now().timestamp_millis().max(1), Ordering::Release);
}

fn read_stamp(slot: &AtomicI64) -> Option<DateTime<Utc>> {
    match slot.load(Ordering::Acquire) {
        UNSET => None,
        millis => DateTime::from_timestamp_millis(millis),
    }
}

/// Lock-free counters shared between the read loop and callers.
///
/// Timestamps are stored as epoch milliseconds so neither side ever waits on
/// the other.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    messages_received: AtomicU64,
    messages_processed: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    connection_start: AtomicI64,
    last_message: AtomicI64,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a delivered event. Never lets `processed` overtake `received`,
    /// which can otherwise happen when a reset lands mid-frame.
    pub fn record_processed(&self) {
        let received = self.messages_received.load(Ordering::Acquire);
        let _ = self
            .messages_processed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |processed| {
                (processed < received).then_some(processed + 1)
            });
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_connected(&self) {
        stamp(&self.connection_start);
    }

    pub fn mark_message(&self) {
        stamp(&self.last_message);
    }

    pub fn snapshot(&self) -> StreamStatistics {
        // processed before received so the snapshot keeps processed <= received
        let messages_processed = self.messages_processed.load(Ordering::Acquire);
        let messages_received = self.messages_received.load(Ordering::Acquire);
        StreamStatistics {
            messages_received: messages_received.max(messages_processed),
            messages_processed,
            errors: self.errors.load(Ordering::Acquire),
            reconnects: self.reconnects.load(Ordering::Acquire),
            connection_start: read_stamp(&self.connection_start),
            last_message: read_stamp(&self.last_message),
        }
    }

    pub fn reset(&self) {
        self.messages_processed.store(0, Ordering::Release);
        self.messages_received.store(0, Ordering::Release);
        self.errors.store(0, Ordering::Release);
        self.reconnects.store(0, Ordering::Release);
        self.connection_start.store(UNSET, Ordering::Release);
        self.last_message.store(UNSET, Ordering::Release);
    }
}
