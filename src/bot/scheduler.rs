// src/bot/scheduler.rs - Apply punishments and schedule their reversal

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use std::sync::Arc;

use crate::bot::metrics::EngineMetrics;
use crate::bot::registry::TimedActionRegistry;
use crate::platforms::{with_timeout, ModerationExecutor};
use crate::types::{
    Clock, EntryKey, GuildId, KeyCategory, ModerationError, PunishmentTarget, PunishmentType, RoleId,
    ScheduledPunishment, UserId,
};

/// What happened to the reversal schedule after a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A reversal is pending; `replaced` earlier reversals for the key were dropped
    Scheduled { expires_at: DateTime<Utc>, replaced: usize },
    /// Permanent punishment; `cancelled` pending reversals were superseded
    Permanent { cancelled: usize },
    /// Kick or soft-ban, nothing to reverse
    Completed,
}

/// Issues punishments through the executor and keeps at most one pending
/// reversal per `(guild, user, punishment type)`.
///
/// The latest call for a key always wins: a timed punishment replaces the
/// pending reversal, a permanent one cancels it. A permanent ban cancels
/// every pending reversal of the user in that guild.
pub struct PunishmentScheduler {
    executor: Arc<dyn ModerationExecutor>,
    reversals: Arc<TimedActionRegistry<ScheduledPunishment>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    call_timeout: std::time::Duration,
}

impl PunishmentScheduler {
    pub fn new(
        executor: Arc<dyn ModerationExecutor>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
        call_timeout: std::time::Duration,
    ) -> Self {
        Self {
            executor,
            reversals: Arc::new(TimedActionRegistry::new("punishment_reversals")),
            clock,
            metrics,
            call_timeout,
        }
    }

    /// Apply a punishment, then record or cancel its reversal.
    ///
    /// Nothing is scheduled when the executor call fails or times out.
    pub async fn apply_punishment(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        punishment: PunishmentType,
        duration: Option<Duration>,
        role_id: Option<RoleId>,
        reason: &str,
    ) -> Result<ScheduleOutcome, ModerationError> {
        if punishment == PunishmentType::RoleMute && role_id.is_none() {
            return Err(ModerationError::MissingMuteRole { guild_id, user_id });
        }

        let target = PunishmentTarget {
            guild_id,
            user_id,
            punishment,
            role_id,
        };

        if let Err(source) = with_timeout(self.call_timeout, self.executor.apply_punishment(&target, reason)).await {
            self.metrics.record_apply_failure(1);
            error!(
                "Failed to apply {} to user {} in guild {}: {}",
                punishment, user_id, guild_id, source
            );
            return Err(ModerationError::ApplyFailed {
                guild_id,
                user_id,
                punishment,
                source,
            });
        }
        self.metrics.record_punishment_applied(1);

        let outcome = match duration {
            Some(duration) if punishment.is_reversible() => {
                let now = self.clock.now();
                let expires_at = now.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
                let scheduled = ScheduledPunishment {
                    guild_id,
                    user_id,
                    punishment,
                    role_id,
                    expires_at,
                    failed_attempts: 0,
                };
                let replaced = self.reversals.replace(scheduled.key(), scheduled, expires_at);
                self.metrics.record_reversal_scheduled(1);
                info!(
                    "{} user {} in guild {} until {} ({})",
                    punishment, user_id, guild_id, expires_at, reason
                );
                ScheduleOutcome::Scheduled { expires_at, replaced }
            }
            Some(_) => {
                debug!("{} cannot be reversed, ignoring its duration", punishment);
                ScheduleOutcome::Completed
            }
            None if punishment == PunishmentType::Ban => {
                let cancelled = self.cancel_all(guild_id, user_id);
                info!(
                    "Permanently banned user {} in guild {} ({}), {} pending reversal(s) cancelled",
                    user_id, guild_id, reason, cancelled
                );
                ScheduleOutcome::Permanent { cancelled }
            }
            None if punishment.is_reversible() => {
                let cancelled = usize::from(self.cancel(guild_id, user_id, punishment));
                info!("{} user {} in guild {} permanently ({})", punishment, user_id, guild_id, reason);
                ScheduleOutcome::Permanent { cancelled }
            }
            None => {
                info!("{} user {} in guild {} ({})", punishment, user_id, guild_id, reason);
                ScheduleOutcome::Completed
            }
        };

        Ok(outcome)
    }

    /// Cancel the pending reversal for one key. Returns false when none was pending.
    pub fn cancel(&self, guild_id: GuildId, user_id: UserId, punishment: PunishmentType) -> bool {
        let removed = self
            .reversals
            .remove_where(&EntryKey::punishment(guild_id, user_id, punishment), |_| true);
        if removed == 0 {
            debug!(
                "No pending {} reversal for user {} in guild {}",
                punishment, user_id, guild_id
            );
            return false;
        }
        self.metrics.record_reversal_cancelled(removed as u64);
        true
    }

    /// Cancel every pending reversal of a user in a guild
    pub fn cancel_all(&self, guild_id: GuildId, user_id: UserId) -> usize {
        self.drain_user(guild_id, user_id).len()
    }

    /// Remove and return every pending reversal of a user in a guild
    pub fn drain_user(&self, guild_id: GuildId, user_id: UserId) -> Vec<ScheduledPunishment> {
        let removed = self.reversals.remove_keys_where(|key| {
            key.guild_id == guild_id
                && key.entity_id == user_id
                && matches!(key.category, KeyCategory::Punishment(_))
        });
        if removed.is_empty() {
            debug!("No pending reversals for user {} in guild {}", user_id, guild_id);
        } else {
            self.metrics.record_reversal_cancelled(removed.len() as u64);
        }
        removed.into_iter().map(|entry| entry.payload).collect()
    }

    /// Expiry of the pending reversal for a key
    pub fn pending(&self, guild_id: GuildId, user_id: UserId, punishment: PunishmentType) -> Option<DateTime<Utc>> {
        self.reversals
            .next_expiry(&EntryKey::punishment(guild_id, user_id, punishment))
    }

    /// Re-arm a reversal that failed. Skipped when a newer punishment already
    /// scheduled its own reversal for the key.
    pub fn reschedule_failed(&self, mut scheduled: ScheduledPunishment, retry_at: DateTime<Utc>) -> bool {
        scheduled.failed_attempts = scheduled.failed_attempts.saturating_add(1);
        scheduled.expires_at = retry_at;
        let key = scheduled.key();
        let added = self.reversals.add_if_absent(key, scheduled, retry_at);
        if !added {
            debug!("Reversal for {} was superseded while failing, not retrying", key);
        }
        added
    }

    /// Put restored reversals back, keeping at most one per key
    pub fn restore(&self, scheduled: impl IntoIterator<Item = ScheduledPunishment>) -> usize {
        let mut restored = 0;
        for entry in scheduled {
            let expires_at = entry.expires_at;
            self.reversals.replace(entry.key(), entry, expires_at);
            restored += 1;
        }
        restored
    }

    pub fn reversals(&self) -> &Arc<TimedActionRegistry<ScheduledPunishment>> {
        &self.reversals
    }

    pub fn executor(&self) -> &Arc<dyn ModerationExecutor> {
        &self.executor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        self.call_timeout
    }
}
