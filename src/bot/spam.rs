// src/bot/spam.rs - Per-user spam detection over sliding windows

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;

use crate::bot::window::SlidingWindowCounter;
use crate::config::{GuildConfigProvider, MessageSettings, ThresholdRule};
use crate::types::{ChatMessage, EntryKey, GuildId, SpamCategory, UserId};

/// A spam category that crossed its threshold
#[derive(Debug, Clone, PartialEq)]
pub struct SpamVerdict {
    pub category: SpamCategory,
    pub rule: ThresholdRule,
    pub count: usize,
}

impl SpamVerdict {
    /// Ordering key: heavier punishment first, permanent beats timed, longer beats shorter
    fn severity(&self) -> (crate::types::PunishmentType, u64) {
        (
            self.rule.punishment,
            self.rule.duration_seconds.unwrap_or(u64::MAX),
        )
    }
}

/// Counts messages per `(guild, user, category)` and reports threshold crossings.
pub struct SpamDetector {
    config: Arc<dyn GuildConfigProvider>,
    counters: DashMap<EntryKey, SlidingWindowCounter>,
}

impl SpamDetector {
    pub fn new(config: Arc<dyn GuildConfigProvider>) -> Self {
        Self {
            config,
            counters: DashMap::new(),
        }
    }

    /// Record one event and report whether it crossed the category's threshold.
    ///
    /// Returns true once per crossing: the counter is cleared on trigger so
    /// the same burst cannot fire again. Categories without configuration are
    /// disabled and record nothing.
    pub fn record_and_check(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        category: SpamCategory,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(config) = self.config.guild_config(guild_id) else {
            return false;
        };
        let Some(rule) = config.spam_rule(category) else {
            return false;
        };
        self.record_with_rule(guild_id, user_id, category, rule, now).is_some()
    }

    /// Evaluate every category a message falls into. When several trigger
    /// on the same message only the most severe one is returned.
    pub fn check_message(&self, message: &ChatMessage) -> Option<SpamVerdict> {
        let config = self.config.guild_config(message.guild_id)?;
        if config.is_exempt(message.author_id) {
            return None;
        }

        let triggered: Vec<SpamVerdict> = Self::classify(message, &config.messages)
            .into_iter()
            .filter_map(|category| {
                let rule = config.spam_rule(category)?;
                let count = self.record_with_rule(
                    message.guild_id,
                    message.author_id,
                    category,
                    rule,
                    message.timestamp,
                )?;
                Some(SpamVerdict {
                    category,
                    rule: rule.clone(),
                    count,
                })
            })
            .collect();

        if triggered.len() > 1 {
            debug!(
                "Message {} triggered {} spam categories at once, keeping the most severe",
                message.message_id,
                triggered.len()
            );
        }
        let verdict = triggered.into_iter().max_by_key(|v| v.severity())?;

        info!(
            "Spam detected: user {} in guild {} sent {} {:?} event(s) within {}s",
            message.author_id,
            message.guild_id,
            verdict.count,
            verdict.category,
            verdict.rule.interval_seconds
        );
        Some(verdict)
    }

    /// Spam categories a message counts towards
    pub fn classify(message: &ChatMessage, settings: &MessageSettings) -> Vec<SpamCategory> {
        let mut categories = vec![SpamCategory::Message];

        if message.content.chars().count() > settings.long_message_length {
            categories.push(SpamCategory::LongMessage);
        }
        if contains_link(&message.content) {
            categories.push(SpamCategory::Link);
        }
        if message.attachments.iter().any(|a| a.is_image()) {
            categories.push(SpamCategory::Image);
        }
        if message.mention_count > 0 {
            categories.push(SpamCategory::Mention);
        }
        categories
    }

    /// Drop counters with nothing left inside their window
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_idle(now));
        before.saturating_sub(self.counters.len())
    }

    pub fn tracked_counters(&self) -> usize {
        self.counters.len()
    }

    /// Add the event and return the window count if it crossed the threshold
    fn record_with_rule(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        category: SpamCategory,
        rule: &ThresholdRule,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let mut counter = self
            .counters
            .entry(EntryKey::spam_counter(guild_id, user_id, category))
            .or_default();
        counter.add(now);
        let count = counter.count_within(rule.interval(), now);

        if count >= rule.threshold.max(1) as usize {
            counter.clear();
            Some(count)
        } else {
            None
        }
    }
}

fn contains_link(content: &str) -> bool {
    content.split_whitespace().any(|word| {
        let word = word.to_lowercase();
        word.contains("http://")
            || word.contains("https://")
            || word.starts_with("www.")
            || word.contains("discord.gg/")
    })
}
