// src/bot/escalation.rs - Per-user violation counters with reset-on-trigger

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::types::{GuildId, PunishmentType, UserId};

type RecordKey = (GuildId, UserId, PunishmentType);

/// Violation count of one user towards one punishment type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub punishment: PunishmentType,
    pub violation_count: u32,
    pub last_violation_at: DateTime<Utc>,
}

/// Tracks banned-phrase violations per `(guild, user, punishment type)`.
///
/// Each punishment type counts independently. When a counter reaches its
/// limit it is reset to zero in the same critical section that reports the
/// trigger, so a crossing is reported exactly once even under concurrent
/// violations from the same user.
#[derive(Debug, Default)]
pub struct EscalationTracker {
    records: DashMap<RecordKey, PunishmentRecord>,
}

impl EscalationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one violation, returning the new count
    pub fn increment(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        punishment: PunishmentType,
        now: DateTime<Utc>,
    ) -> u32 {
        let mut record = self
            .records
            .entry((guild_id, user_id, punishment))
            .or_insert_with(|| PunishmentRecord {
                guild_id,
                user_id,
                punishment,
                violation_count: 0,
                last_violation_at: now,
            });
        record.violation_count = record.violation_count.saturating_add(1);
        record.last_violation_at = now;
        record.violation_count
    }

    /// Reset the counter and report a trigger when it has reached `limit`
    pub fn check_and_maybe_reset(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        punishment: PunishmentType,
        limit: u32,
    ) -> bool {
        match self.records.get_mut(&(guild_id, user_id, punishment)) {
            Some(mut record) if record.violation_count >= limit.max(1) => {
                record.violation_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Increment and check as one atomic step
    pub fn record_violation(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        punishment: PunishmentType,
        limit: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let mut record = self
            .records
            .entry((guild_id, user_id, punishment))
            .or_insert_with(|| PunishmentRecord {
                guild_id,
                user_id,
                punishment,
                violation_count: 0,
                last_violation_at: now,
            });
        record.violation_count = record.violation_count.saturating_add(1);
        record.last_violation_at = now;

        if record.violation_count >= limit.max(1) {
            debug!(
                "User {} in guild {} reached {} violations for {}",
                user_id, guild_id, record.violation_count, punishment
            );
            record.violation_count = 0;
            true
        } else {
            false
        }
    }

    pub fn count(&self, guild_id: GuildId, user_id: UserId, punishment: PunishmentType) -> u32 {
        self.records
            .get(&(guild_id, user_id, punishment))
            .map_or(0, |r| r.violation_count)
    }

    /// Forget one counter. Returns false when there was nothing to reset.
    pub fn reset(&self, guild_id: GuildId, user_id: UserId, punishment: PunishmentType) -> bool {
        let removed = self.records.remove(&(guild_id, user_id, punishment)).is_some();
        if !removed {
            debug!(
                "No {} violations to reset for user {} in guild {}",
                punishment, user_id, guild_id
            );
        }
        removed
    }

    /// Forget every counter of a user in a guild (moderator pardon)
    pub fn reset_all(&self, guild_id: GuildId, user_id: UserId) -> usize {
        let before = self.records.len();
        self.records
            .retain(|(g, u, _), _| !(*g == guild_id && *u == user_id));
        let removed = before.saturating_sub(self.records.len());
        if removed == 0 {
            debug!("No violations to reset for user {} in guild {}", user_id, guild_id);
        }
        removed
    }

    /// Drop records whose last violation is older than `ttl`
    pub fn decay(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let cutoff = now - ttl;
        let mut dropped = 0;
        self.records.retain(|_, record| {
            let keep = record.last_violation_at >= cutoff;
            if !keep {
                dropped += 1;
            }
            keep
        });
        if dropped > 0 {
            info!("Forgot {} idle violation record(s)", dropped);
        }
        dropped
    }

    pub fn records(&self) -> Vec<PunishmentRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Load records, replacing any existing counter for the same key
    pub fn restore(&self, records: impl IntoIterator<Item = PunishmentRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            self.records
                .insert((record.guild_id, record.user_id, record.punishment), record);
            restored += 1;
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_trigger_at_limit_resets_to_zero() {
        let tracker = EscalationTracker::new();

        assert!(!tracker.record_violation(1, 2, PunishmentType::Kick, 3, at(0)));
        assert!(!tracker.record_violation(1, 2, PunishmentType::Kick, 3, at(1)));
        assert!(tracker.record_violation(1, 2, PunishmentType::Kick, 3, at(2)));
        assert_eq!(tracker.count(1, 2, PunishmentType::Kick), 0);

        // Next crossing needs a fresh run
        assert!(!tracker.record_violation(1, 2, PunishmentType::Kick, 3, at(3)));
        assert_eq!(tracker.count(1, 2, PunishmentType::Kick), 1);
    }

    #[test]
    fn test_increment_then_check() {
        let tracker = EscalationTracker::new();
        assert_eq!(tracker.increment(1, 2, PunishmentType::Ban, at(0)), 1);
        assert!(!tracker.check_and_maybe_reset(1, 2, PunishmentType::Ban, 2));
        assert_eq!(tracker.increment(1, 2, PunishmentType::Ban, at(1)), 2);
        assert!(tracker.check_and_maybe_reset(1, 2, PunishmentType::Ban, 2));
        assert!(!tracker.check_and_maybe_reset(1, 2, PunishmentType::Ban, 2));
        assert_eq!(tracker.count(1, 2, PunishmentType::Ban), 0);
    }

    #[test]
    fn test_punishment_types_count_independently() {
        let tracker = EscalationTracker::new();
        tracker.increment(1, 2, PunishmentType::Kick, at(0));
        tracker.increment(1, 2, PunishmentType::Kick, at(0));
        tracker.increment(1, 2, PunishmentType::Deafen, at(0));

        assert_eq!(tracker.count(1, 2, PunishmentType::Kick), 2);
        assert_eq!(tracker.count(1, 2, PunishmentType::Deafen), 1);
        assert_eq!(tracker.count(1, 3, PunishmentType::Kick), 0);
    }

    #[test]
    fn test_reset_and_reset_all() {
        let tracker = EscalationTracker::new();
        tracker.increment(1, 2, PunishmentType::Kick, at(0));
        tracker.increment(1, 2, PunishmentType::Ban, at(0));
        tracker.increment(1, 3, PunishmentType::Ban, at(0));

        assert!(tracker.reset(1, 2, PunishmentType::Kick));
        assert!(!tracker.reset(1, 2, PunishmentType::Kick));
        assert_eq!(tracker.reset_all(1, 2), 1);
        assert_eq!(tracker.reset_all(1, 2), 0);
        assert_eq!(tracker.count(1, 3, PunishmentType::Ban), 1);
    }

    #[test]
    fn test_decay_drops_idle_records() {
        let tracker = EscalationTracker::new();
        tracker.increment(1, 2, PunishmentType::Kick, at(0));
        tracker.increment(1, 3, PunishmentType::Kick, at(5000));

        assert_eq!(tracker.decay(at(6000), Duration::seconds(3600)), 1);
        assert_eq!(tracker.count(1, 2, PunishmentType::Kick), 0);
        assert_eq!(tracker.count(1, 3, PunishmentType::Kick), 1);
    }

    #[test]
    fn test_concurrent_violations_trigger_once_per_crossing() {
        let tracker = Arc::new(EscalationTracker::new());
        let triggers = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let triggers = Arc::clone(&triggers);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if tracker.record_violation(1, 2, PunishmentType::Ban, 4, at(0)) {
                            triggers.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // 400 violations, limit 4
        assert_eq!(triggers.load(Ordering::SeqCst), 100);
        assert_eq!(tracker.count(1, 2, PunishmentType::Ban), 0);
    }

    #[test]
    fn test_restore_round_trip() {
        let tracker = EscalationTracker::new();
        tracker.increment(1, 2, PunishmentType::Kick, at(0));
        let records = tracker.records();

        let restored = EscalationTracker::new();
        assert_eq!(restored.restore(records), 1);
        assert_eq!(restored.count(1, 2, PunishmentType::Kick), 1);
    }
}
