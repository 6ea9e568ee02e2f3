// src/bot/metrics.rs - Engine counters, injected where they are updated

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide moderation counters. One instance is created at startup and
/// shared by `Arc`; nothing here is global.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    events_processed: AtomicU64,
    spam_triggers: AtomicU64,
    raid_triggers: AtomicU64,
    escalation_triggers: AtomicU64,
    punishments_applied: AtomicU64,
    apply_failures: AtomicU64,
    reversals_scheduled: AtomicU64,
    reversals_completed: AtomicU64,
    reversals_failed: AtomicU64,
    reversals_cancelled: AtomicU64,
    messages_deleted: AtomicU64,
    sweeps: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub spam_triggers: u64,
    pub raid_triggers: u64,
    pub escalation_triggers: u64,
    pub punishments_applied: u64,
    pub apply_failures: u64,
    pub reversals_scheduled: u64,
    pub reversals_completed: u64,
    pub reversals_failed: u64,
    pub reversals_cancelled: u64,
    pub messages_deleted: u64,
    pub sweeps: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_event, events_processed);
    counter!(record_spam_trigger, spam_triggers);
    counter!(record_raid_trigger, raid_triggers);
    counter!(record_escalation_trigger, escalation_triggers);
    counter!(record_punishment_applied, punishments_applied);
    counter!(record_apply_failure, apply_failures);
    counter!(record_reversal_scheduled, reversals_scheduled);
    counter!(record_reversal_completed, reversals_completed);
    counter!(record_reversal_failed, reversals_failed);
    counter!(record_reversal_cancelled, reversals_cancelled);
    counter!(record_messages_deleted, messages_deleted);
    counter!(record_sweep, sweeps);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            spam_triggers: self.spam_triggers.load(Ordering::Relaxed),
            raid_triggers: self.raid_triggers.load(Ordering::Relaxed),
            escalation_triggers: self.escalation_triggers.load(Ordering::Relaxed),
            punishments_applied: self.punishments_applied.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            reversals_scheduled: self.reversals_scheduled.load(Ordering::Relaxed),
            reversals_completed: self.reversals_completed.load(Ordering::Relaxed),
            reversals_failed: self.reversals_failed.load(Ordering::Relaxed),
            reversals_cancelled: self.reversals_cancelled.load(Ordering::Relaxed),
            messages_deleted: self.messages_deleted.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}
