use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counters exposed by the `messengerStats`
/// service.
#[derive(Debug, Default)]
pub struct MessengerStats {
    total_message_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub total_message_count: u64,
}

impl MessengerStats {
    pub fn record_send(&self) {
        self.total_message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_message_count: self.total_message_count.load(Ordering::Relaxed),
        }
    }
}
