use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{
    bounded_millis, bounded_seconds, EngineSettings, GuildConfigProvider, GuildModerationConfig,
};
use crate::platforms::{with_timeout, ModerationExecutor};
use crate::types::{
    ChatEvent, ChatMessage, Clock, GuildId, ModerationError, ModerationNotice, PunishmentTarget, PunishmentType,
    TriggerSource, UserId,
};

pub mod deletion;
pub mod escalation;
pub mod metrics;
pub mod persistence;
pub mod phrases;
pub mod raid;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod spam;
pub mod sweeper;
pub mod window;

use deletion::MessageDeletionQueue;
use escalation::EscalationTracker;
use metrics::EngineMetrics;
use persistence::{ModerationSnapshot, ScheduledPunishmentRecord, ViolationRecord};
use phrases::PhraseFilter;
use raid::RaidDetector;
use scheduler::{PunishmentScheduler, ScheduleOutcome};
use spam::SpamDetector;

/// A punishment the engine decided on and the executor accepted
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTaken {
    pub target: PunishmentTarget,
    pub duration_seconds: Option<u64>,
    pub source: TriggerSource,
    pub outcome: ScheduleOutcome,
}

/// Result of a moderator pardon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PardonSummary {
    pub reversed: usize,
    pub reversal_failures: usize,
    pub violations_cleared: usize,
}

/// One possible punishment for an event; several may compete
#[derive(Debug, Clone)]
struct Candidate {
    punishment: PunishmentType,
    duration_seconds: Option<u64>,
    source: TriggerSource,
    reason: String,
}

impl Candidate {
    fn severity(&self) -> (PunishmentType, u64) {
        (self.punishment, self.duration_seconds.unwrap_or(u64::MAX))
    }
}

/// Wires detectors, escalation, the scheduler and the deletion queue to
/// inbound chat events. Background upkeep lives in [`sweeper::PeriodicSweeper`].
pub struct ModerationEngine {
    config: Arc<dyn GuildConfigProvider>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    spam: SpamDetector,
    raid: RaidDetector,
    escalation: EscalationTracker,
    phrases: PhraseFilter,
    deletions: MessageDeletionQueue,
    scheduler: PunishmentScheduler,
}

impl ModerationEngine {
    pub fn new(
        config: Arc<dyn GuildConfigProvider>,
        executor: Arc<dyn ModerationExecutor>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
        settings: EngineSettings,
    ) -> Self {
        let scheduler = PunishmentScheduler::new(
            executor,
            Arc::clone(&clock),
            Arc::clone(&metrics),
            settings.executor_timeout(),
        );
        let session_ttl = bounded_seconds(settings.fuzzy_session_ttl_seconds);

        Self {
            spam: SpamDetector::new(Arc::clone(&config)),
            raid: RaidDetector::new(Arc::clone(&config)),
            escalation: EscalationTracker::new(),
            phrases: PhraseFilter::new(session_ttl),
            deletions: MessageDeletionQueue::new(),
            scheduler,
            config,
            settings,
            clock,
            metrics,
        }
    }

    pub async fn handle_event(&self, event: &ChatEvent) -> Result<Option<ActionTaken>, ModerationError> {
        match event {
            ChatEvent::Message(message) => self.handle_message(message).await,
            ChatEvent::MemberJoin {
                guild_id,
                user_id,
                timestamp,
            } => self.handle_join(*guild_id, *user_id, *timestamp).await,
        }
    }

    /// Run a message through spam detection and the banned-phrase filter.
    /// At most one punishment is applied per message: the most severe one.
    pub async fn handle_message(&self, message: &ChatMessage) -> Result<Option<ActionTaken>, ModerationError> {
        self.metrics.record_event(1);
        let Some(config) = self.config.guild_config(message.guild_id) else {
            return Ok(None);
        };
        if config.is_exempt(message.author_id) {
            return Ok(None);
        }

        let now = self.clock.now();
        let mut message = message.clone();
        if message.timestamp > now {
            debug!("Message {} is timestamped in the future, using current time", message.message_id);
            message.timestamp = now;
        }

        let mut candidates = Vec::new();
        let mut delete = false;

        if let Some(verdict) = self.spam.check_message(&message) {
            self.metrics.record_spam_trigger(1);
            delete |= config.messages.delete_spam_messages;
            candidates.push(Candidate {
                punishment: verdict.rule.punishment,
                duration_seconds: verdict.rule.duration_seconds,
                source: TriggerSource::Spam {
                    category: verdict.category,
                },
                reason: format!(
                    "{} {:?} event(s) within {}s",
                    verdict.count, verdict.category, verdict.rule.interval_seconds
                ),
            });
        }

        let matches = self.phrases.check(&message, &config);
        delete |= matches.iter().any(|m| m.delete_message);

        // One violation per punishment type per message, however many phrases hit it
        let mut counted = BTreeSet::new();
        for phrase in &matches {
            if !counted.insert(phrase.punishment) {
                continue;
            }
            let Some(tier) = config.escalation_tier(phrase.punishment) else {
                debug!(
                    "Phrase '{}' matched but {} has no escalation tier in guild {}",
                    phrase.phrase_id, phrase.punishment, message.guild_id
                );
                continue;
            };
            if self.escalation.record_violation(
                message.guild_id,
                message.author_id,
                phrase.punishment,
                tier.limit,
                message.timestamp,
            ) {
                self.metrics.record_escalation_trigger(1);
                candidates.push(Candidate {
                    punishment: phrase.punishment,
                    duration_seconds: tier.duration_seconds,
                    source: TriggerSource::Phrase {
                        phrase_id: phrase.phrase_id.clone(),
                    },
                    reason: format!("reached {} banned phrase violation(s)", tier.limit.max(1)),
                });
            }
        }

        if delete {
            let due_at = now + bounded_millis(config.messages.deletion_delay_ms);
            self.deletions
                .enqueue(message.guild_id, message.channel_id, message.message_id, due_at);
        }

        self.apply_most_severe(&config, message.guild_id, message.author_id, candidates)
            .await
    }

    /// Count a join towards raid detection and punish the joining user when
    /// the guild is being raided
    pub async fn handle_join(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ActionTaken>, ModerationError> {
        self.metrics.record_event(1);
        let Some(config) = self.config.guild_config(guild_id) else {
            return Ok(None);
        };

        let timestamp = timestamp.min(self.clock.now());
        let Some(verdict) = self.raid.record_join_and_check(guild_id, user_id, timestamp) else {
            return Ok(None);
        };
        self.metrics.record_raid_trigger(1);

        let candidate = Candidate {
            punishment: verdict.rule.punishment,
            duration_seconds: verdict.rule.duration_seconds,
            source: TriggerSource::Raid {
                category: verdict.category,
            },
            reason: format!(
                "raid: {} joins within {}s",
                verdict.count, verdict.rule.interval_seconds
            ),
        };
        self.apply_most_severe(&config, guild_id, user_id, vec![candidate]).await
    }

    async fn apply_most_severe(
        &self,
        config: &GuildModerationConfig,
        guild_id: GuildId,
        user_id: UserId,
        candidates: Vec<Candidate>,
    ) -> Result<Option<ActionTaken>, ModerationError> {
        if candidates.len() > 1 {
            debug!(
                "{} punishments triggered for user {} in guild {}, applying the most severe",
                candidates.len(),
                user_id,
                guild_id
            );
        }
        let Some(chosen) = candidates.into_iter().max_by_key(Candidate::severity) else {
            return Ok(None);
        };

        let role_id = match chosen.punishment {
            PunishmentType::RoleMute => config.mute_role_id,
            _ => None,
        };
        let duration = chosen.duration_seconds.map(bounded_seconds);
        let outcome = self
            .scheduler
            .apply_punishment(guild_id, user_id, chosen.punishment, duration, role_id, &chosen.reason)
            .await?;

        let target = PunishmentTarget {
            guild_id,
            user_id,
            punishment: chosen.punishment,
            role_id,
        };
        let notice = ModerationNotice {
            target,
            duration_seconds: chosen.duration_seconds,
            reason: chosen.reason,
            source: chosen.source.clone(),
            issued_at: self.clock.now(),
        };
        let executor = self.scheduler.executor();
        if let Err(e) = with_timeout(self.scheduler.call_timeout(), executor.send_moderation_log(&notice)).await {
            warn!("Failed to post moderation log for user {} in guild {}: {}", user_id, guild_id, e);
        }

        Ok(Some(ActionTaken {
            target,
            duration_seconds: chosen.duration_seconds,
            source: chosen.source,
            outcome,
        }))
    }

    /// Lift every pending punishment of a user right away and forget their
    /// violations
    pub async fn pardon(&self, guild_id: GuildId, user_id: UserId) -> PardonSummary {
        let mut summary = PardonSummary {
            violations_cleared: self.escalation.reset_all(guild_id, user_id),
            ..Default::default()
        };

        for scheduled in self.scheduler.drain_user(guild_id, user_id) {
            let target = scheduled.target();
            let reverse = self.scheduler.executor().reverse_punishment(&target, "pardoned by moderator");
            match with_timeout(self.scheduler.call_timeout(), reverse).await {
                Ok(()) => summary.reversed += 1,
                Err(e) => {
                    warn!(
                        "Failed to lift {} for pardoned user {} in guild {}: {}",
                        target.punishment, user_id, guild_id, e
                    );
                    summary.reversal_failures += 1;
                }
            }
        }

        info!(
            "Pardoned user {} in guild {}: {} punishment(s) lifted, {} violation record(s) cleared",
            user_id, guild_id, summary.reversed, summary.violations_cleared
        );
        summary
    }

    pub fn snapshot(&self) -> ModerationSnapshot {
        ModerationSnapshot {
            taken_at_unix_millis: self.clock.now().timestamp_millis(),
            scheduled_punishments: self
                .scheduler
                .reversals()
                .entries()
                .iter()
                .map(|entry| ScheduledPunishmentRecord::from(&entry.payload))
                .collect(),
            violations: self
                .escalation
                .records()
                .iter()
                .map(ViolationRecord::from)
                .collect(),
        }
    }

    /// Load a snapshot. Reversals that expired while the process was down
    /// are picked up by the next sweep. Returns `(reversals, violation records)`.
    pub fn restore(&self, snapshot: &ModerationSnapshot) -> (usize, usize) {
        let now = self.clock.now();
        let scheduled: Vec<_> = snapshot
            .scheduled_punishments
            .iter()
            .filter_map(|record| {
                let restored = record.to_scheduled();
                if restored.is_none() {
                    warn!(
                        "Dropping scheduled {} for user {} with invalid expiry {}",
                        record.punishment_type, record.user_id, record.expires_at_unix_millis
                    );
                }
                restored
            })
            .collect();

        let reversals = self.scheduler.restore(scheduled);
        let violations = self
            .escalation
            .restore(snapshot.violations.iter().map(|v| v.to_record(now)));

        info!(
            "Restored {} scheduled punishment(s) and {} violation record(s)",
            reversals, violations
        );
        (reversals, violations)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn scheduler(&self) -> &PunishmentScheduler {
        &self.scheduler
    }

    pub fn escalation(&self) -> &EscalationTracker {
        &self.escalation
    }

    pub fn spam(&self) -> &SpamDetector {
        &self.spam
    }

    pub fn raid(&self) -> &RaidDetector {
        &self.raid
    }

    pub fn phrases(&self) -> &PhraseFilter {
        &self.phrases
    }

    pub fn deletions(&self) -> &MessageDeletionQueue {
        &self.deletions
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use crate::config::{BannedPhrase, EscalationTier, PhraseMatchMode, StaticConfigProvider, ThresholdRule};
    use crate::platforms::testing::RecordingExecutor;
    use crate::types::{ManualClock, RaidCategory, SpamCategory};
    use std::collections::HashMap;

    pub(crate) fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    pub(crate) fn test_config() -> GuildModerationConfig {
        let mut spam = HashMap::new();
        spam.insert(
            SpamCategory::Mention,
            ThresholdRule {
                threshold: 3,
                interval_seconds: 10,
                punishment: PunishmentType::Kick,
                duration_seconds: None,
            },
        );
        spam.insert(
            SpamCategory::Message,
            ThresholdRule {
                threshold: 5,
                interval_seconds: 5,
                punishment: PunishmentType::RoleMute,
                duration_seconds: Some(600),
            },
        );

        let mut raid = HashMap::new();
        raid.insert(
            RaidCategory::RapidJoin,
            ThresholdRule {
                threshold: 5,
                interval_seconds: 30,
                punishment: PunishmentType::Ban,
                duration_seconds: Some(3600),
            },
        );

        let mut escalation = HashMap::new();
        escalation.insert(
            PunishmentType::VoiceMute,
            EscalationTier {
                limit: 2,
                duration_seconds: Some(3600),
            },
        );
        escalation.insert(
            PunishmentType::Ban,
            EscalationTier {
                limit: 3,
                duration_seconds: None,
            },
        );

        GuildModerationConfig {
            spam,
            raid,
            escalation,
            phrases: vec![
                BannedPhrase {
                    id: "insult".to_string(),
                    pattern: "dumb bot".to_string(),
                    match_mode: PhraseMatchMode::Literal,
                    punishment: PunishmentType::VoiceMute,
                    delete_message: true,
                },
                BannedPhrase {
                    id: "threat".to_string(),
                    pattern: "i will find you".to_string(),
                    match_mode: PhraseMatchMode::Literal,
                    punishment: PunishmentType::Ban,
                    delete_message: true,
                },
            ],
            mute_role_id: Some(99),
            exempt_users: vec![1000],
            ..Default::default()
        }
    }

    pub(crate) struct Harness {
        pub engine: Arc<ModerationEngine>,
        pub executor: Arc<RecordingExecutor>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn harness_with(executor: RecordingExecutor, settings: EngineSettings) -> Harness {
        build_harness(test_config(), executor, settings)
    }

    fn build_harness(config: GuildModerationConfig, executor: RecordingExecutor, settings: EngineSettings) -> Harness {
        let executor = Arc::new(executor);
        let clock = Arc::new(ManualClock::new(start()));
        let engine = Arc::new(ModerationEngine::new(
            Arc::new(StaticConfigProvider::new().with_guild(1, config)),
            executor.clone(),
            clock.clone(),
            Arc::new(EngineMetrics::new()),
            settings,
        ));
        Harness { engine, executor, clock }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(RecordingExecutor::new(), EngineSettings::default())
    }

    fn message(id: u64, author: u64, content: &str, mentions: u32, at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            guild_id: 1,
            channel_id: 10,
            message_id: id,
            author_id: author,
            content: content.to_string(),
            mention_count: mentions,
            attachments: Vec::new(),
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_mention_spam_kicks_and_logs() {
        let h = harness();
        for (i, t) in [0, 2].into_iter().enumerate() {
            let msg = message(i as u64, 5, "@someone", 1, start() + Duration::seconds(t));
            assert!(h.engine.handle_message(&msg).await.unwrap().is_none());
        }

        h.clock.advance(Duration::seconds(8));
        let msg = message(3, 5, "@someone", 1, start() + Duration::seconds(8));
        let action = h.engine.handle_message(&msg).await.unwrap().unwrap();

        assert_eq!(action.target.punishment, PunishmentType::Kick);
        assert_eq!(action.outcome, ScheduleOutcome::Completed);
        assert_eq!(h.executor.applied().len(), 1);

        let notices = h.executor.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].source,
            TriggerSource::Spam {
                category: SpamCategory::Mention
            }
        );
        assert_eq!(h.engine.deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_rapid_joins_punish_the_joiner() {
        let h = harness();
        for (user, t) in [(100, 0), (101, 5), (102, 10), (103, 15)] {
            h.clock.set(start() + Duration::seconds(t));
            let join = ChatEvent::MemberJoin {
                guild_id: 1,
                user_id: user,
                timestamp: start() + Duration::seconds(t),
            };
            assert!(h.engine.handle_event(&join).await.unwrap().is_none());
        }

        h.clock.set(start() + Duration::seconds(18));
        let action = h
            .engine
            .handle_join(1, 104, start() + Duration::seconds(18))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(action.target.user_id, 104);
        assert_eq!(action.target.punishment, PunishmentType::Ban);
        assert!(matches!(action.outcome, ScheduleOutcome::Scheduled { .. }));
        assert_eq!(h.executor.applied().len(), 1);
        assert!(h.engine.scheduler().pending(1, 104, PunishmentType::Ban).is_some());
    }

    #[tokio::test]
    async fn test_phrase_escalation_resets_after_trigger() {
        let h = harness();

        let first = message(1, 5, "what a dumb bot", 0, start());
        assert!(h.engine.handle_message(&first).await.unwrap().is_none());
        assert_eq!(h.engine.escalation().count(1, 5, PunishmentType::VoiceMute), 1);

        let second = message(2, 5, "DUMB BOT again", 0, start());
        let action = h.engine.handle_message(&second).await.unwrap().unwrap();
        assert_eq!(action.target.punishment, PunishmentType::VoiceMute);
        assert_eq!(
            action.source,
            TriggerSource::Phrase {
                phrase_id: "insult".to_string()
            }
        );
        assert_eq!(h.engine.escalation().count(1, 5, PunishmentType::VoiceMute), 0);
        assert_eq!(
            h.engine.scheduler().pending(1, 5, PunishmentType::VoiceMute),
            Some(start() + Duration::hours(1))
        );
        assert_eq!(h.engine.deletions().len(), 2);
    }

    #[tokio::test]
    async fn test_simultaneous_tiers_apply_only_the_most_severe() {
        let h = harness();
        let lines = ["i will find you", "i will find you, dumb bot", "dumb bot! i will find you"];
        let mut last = None;
        for (id, line) in lines.into_iter().enumerate() {
            last = h.engine.handle_message(&message(id as u64, 5, line, 0, start())).await.unwrap();
        }

        // Ban tier (limit 3) and voice-mute tier (limit 2) both fire on the last line
        let action = last.unwrap();
        assert_eq!(action.target.punishment, PunishmentType::Ban);
        assert_eq!(h.executor.applied().len(), 1);
        assert_eq!(h.executor.notices().len(), 1);
        assert_eq!(h.engine.escalation().count(1, 5, PunishmentType::Ban), 0);
        assert_eq!(h.engine.escalation().count(1, 5, PunishmentType::VoiceMute), 0);
        assert!(h.engine.scheduler().reversals().is_empty());
    }

    #[tokio::test]
    async fn test_exempt_and_unconfigured_are_ignored() {
        let h = harness();
        for id in 0..10 {
            let exempt = message(id, 1000, "@x dumb bot", 1, start());
            assert!(h.engine.handle_message(&exempt).await.unwrap().is_none());

            let mut elsewhere = message(id, 5, "@x dumb bot", 1, start());
            elsewhere.guild_id = 2;
            assert!(h.engine.handle_message(&elsewhere).await.unwrap().is_none());
        }
        assert!(h.executor.calls().is_empty());
        assert_eq!(h.engine.metrics().snapshot().events_processed, 20);
    }

    #[tokio::test]
    async fn test_failed_apply_is_reported_and_not_scheduled() {
        let executor = RecordingExecutor::new();
        executor.fail_for_user(104, crate::types::ExecutorError::Rejected("hierarchy".to_string()));
        let h = harness_with(executor, EngineSettings::default());

        for (user, t) in [(100, 0), (101, 1), (102, 2), (103, 3)] {
            h.engine.handle_join(1, user, start() + Duration::seconds(t)).await.unwrap();
        }
        let result = h.engine.handle_join(1, 104, start() + Duration::seconds(4)).await;

        assert!(matches!(result, Err(ModerationError::ApplyFailed { user_id: 104, .. })));
        assert!(h.engine.scheduler().reversals().is_empty());
        assert!(h.executor.notices().is_empty());
    }

    #[tokio::test]
    async fn test_pardon_lifts_pending_punishments() {
        let h = harness();
        for id in 0..2 {
            let msg = message(id, 5, "dumb bot", 0, start());
            h.engine.handle_message(&msg).await.unwrap();
        }
        h.engine
            .handle_message(&message(5, 5, "i will find you", 0, start()))
            .await
            .unwrap();

        let summary = h.engine.pardon(1, 5).await;
        assert_eq!(summary.reversed, 1);
        assert_eq!(summary.violations_cleared, 2);
        assert!(h.engine.scheduler().reversals().is_empty());
        assert_eq!(h.executor.reversed()[0].punishment, PunishmentType::VoiceMute);
    }

    #[tokio::test]
    async fn test_snapshot_restore_into_fresh_engine() {
        let h = harness();
        for id in 0..2 {
            let msg = message(id, 5, "dumb bot", 0, start());
            h.engine.handle_message(&msg).await.unwrap();
        }
        h.engine
            .handle_message(&message(7, 6, "i will find you", 0, start()))
            .await
            .unwrap();

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.scheduled_punishments.len(), 1);

        let fresh = harness();
        assert_eq!(fresh.engine.restore(&snapshot), (1, snapshot.violations.len()));
        assert_eq!(
            fresh.engine.scheduler().pending(1, 5, PunishmentType::VoiceMute),
            Some(start() + Duration::hours(1))
        );
        assert_eq!(fresh.engine.escalation().count(1, 6, PunishmentType::Ban), 1);
    }

    #[tokio::test]
    async fn test_default_profile_punishes_message_spam() {
        let h = build_harness(
            crate::config::default_guild_config(),
            RecordingExecutor::new(),
            EngineSettings::default(),
        );

        let mut actions = Vec::new();
        for id in 0..8 {
            let msg = message(id, 5, "hello", 0, start() + Duration::milliseconds(id as i64 * 500));
            if let Some(action) = h.engine.handle_message(&msg).await.unwrap() {
                actions.push(action);
            }
        }

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target.punishment, PunishmentType::VoiceMute);
        assert_eq!(h.executor.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_durations_saturate() {
        let mut config = test_config();
        config.messages.deletion_delay_ms = u64::MAX;
        config.escalation.insert(
            PunishmentType::VoiceMute,
            EscalationTier {
                limit: 1,
                duration_seconds: Some(u64::MAX),
            },
        );
        let h = build_harness(config, RecordingExecutor::new(), EngineSettings::default());

        let action = h
            .engine
            .handle_message(&message(1, 5, "dumb bot", 0, start()))
            .await
            .unwrap()
            .unwrap();

        let ScheduleOutcome::Scheduled { expires_at, .. } = action.outcome else {
            panic!("expected a scheduled reversal, got {:?}", action.outcome);
        };
        assert!(expires_at > start() + Duration::days(365));
        assert_eq!(h.engine.deletions().len(), 1);
        assert!(h.engine.deletions().take_due(start() + Duration::days(1)).is_empty());
    }
}
