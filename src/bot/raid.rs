// src/bot/raid.rs - Guild-level join-rate raid detection

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::warn;
use std::sync::Arc;

use crate::bot::window::SlidingWindowCounter;
use crate::config::{GuildConfigProvider, ThresholdRule};
use crate::types::{EntryKey, GuildId, PunishmentType, RaidCategory, UserId};

/// A join that pushed a raid category over its threshold. The joining user
/// is the one to punish.
#[derive(Debug, Clone, PartialEq)]
pub struct RaidVerdict {
    pub user_id: UserId,
    pub category: RaidCategory,
    pub rule: ThresholdRule,
    pub count: usize,
}

impl RaidVerdict {
    fn severity(&self) -> (PunishmentType, u64) {
        (
            self.rule.punishment,
            self.rule.duration_seconds.unwrap_or(u64::MAX),
        )
    }
}

/// Counts joins per `(guild, raid category)`.
///
/// Counters are not cleared on trigger: while a raid is in progress every
/// further join that finds the window at or above the threshold is reported,
/// and only the joining user is targeted.
pub struct RaidDetector {
    config: Arc<dyn GuildConfigProvider>,
    counters: DashMap<EntryKey, SlidingWindowCounter>,
}

impl RaidDetector {
    pub fn new(config: Arc<dyn GuildConfigProvider>) -> Self {
        Self {
            config,
            counters: DashMap::new(),
        }
    }

    /// Record a join and return the verdict for the joining user, if any.
    /// When both categories fire, the more severe punishment wins.
    pub fn record_join_and_check(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Option<RaidVerdict> {
        let config = self.config.guild_config(guild_id)?;

        let verdict = RaidCategory::ALL
            .into_iter()
            .filter_map(|category| {
                let rule = config.raid_rule(category)?;
                let mut counter = self
                    .counters
                    .entry(EntryKey::raid_counter(guild_id, category))
                    .or_default();
                counter.add(now);
                let count = counter.count_within(rule.interval(), now);

                (count >= rule.threshold.max(1) as usize).then(|| RaidVerdict {
                    user_id,
                    category,
                    rule: rule.clone(),
                    count,
                })
            })
            .max_by_key(|v| v.severity())?;

        if config.is_exempt(user_id) {
            return None;
        }

        warn!(
            "Raid detected in guild {}: {} joins within {}s ({:?}), targeting user {}",
            guild_id, verdict.count, verdict.rule.interval_seconds, verdict.category, user_id
        );
        Some(verdict)
    }

    /// Joins currently inside the category's window
    pub fn current_count(&self, guild_id: GuildId, category: RaidCategory, now: DateTime<Utc>) -> usize {
        let Some(rule) = self
            .config
            .guild_config(guild_id)
            .and_then(|c| c.raid_rule(category).cloned())
        else {
            return 0;
        };
        self.counters
            .get_mut(&EntryKey::raid_counter(guild_id, category))
            .map_or(0, |mut counter| counter.count_within(rule.interval(), now))
    }

    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_idle(now));
        before.saturating_sub(self.counters.len())
    }

    pub fn tracked_counters(&self) -> usize {
        self.counters.len()
    }
}
