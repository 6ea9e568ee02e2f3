// src/types/mod.rs - Shared moderation types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

pub type GuildId = u64;
pub type UserId = u64;
pub type ChannelId = u64;
pub type MessageId = u64;
pub type RoleId = u64;

/// Punishments the engine can issue, declared from least to most severe so
/// that the derived ordering doubles as the severity ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentType {
    RoleMute,
    VoiceMute,
    Deafen,
    Kick,
    SoftBan,
    Ban,
}

impl PunishmentType {
    pub const ALL: [PunishmentType; 6] = [
        PunishmentType::RoleMute,
        PunishmentType::VoiceMute,
        PunishmentType::Deafen,
        PunishmentType::Kick,
        PunishmentType::SoftBan,
        PunishmentType::Ban,
    ];

    /// Whether a timed variant of this punishment can be undone later.
    /// Kicks and soft-bans complete immediately.
    pub fn is_reversible(self) -> bool {
        !matches!(self, PunishmentType::Kick | PunishmentType::SoftBan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PunishmentType::RoleMute => "role_mute",
            PunishmentType::VoiceMute => "voice_mute",
            PunishmentType::Deafen => "deafen",
            PunishmentType::Kick => "kick",
            PunishmentType::SoftBan => "soft_ban",
            PunishmentType::Ban => "ban",
        }
    }

    /// Name of the action that undoes this punishment, for logs and audit reasons
    pub fn reversal_name(self) -> &'static str {
        match self {
            PunishmentType::RoleMute => "unmute (role)",
            PunishmentType::VoiceMute => "voice unmute",
            PunishmentType::Deafen => "undeafen",
            PunishmentType::Ban => "unban",
            PunishmentType::Kick | PunishmentType::SoftBan => "none",
        }
    }
}

impl fmt::Display for PunishmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamCategory {
    Message,
    LongMessage,
    Link,
    Image,
    Mention,
}

impl SpamCategory {
    pub const ALL: [SpamCategory; 5] = [
        SpamCategory::Message,
        SpamCategory::LongMessage,
        SpamCategory::Link,
        SpamCategory::Image,
        SpamCategory::Mention,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidCategory {
    /// Regular join-rate monitoring over a long interval
    Join,
    /// Burst of joins over a short interval
    RapidJoin,
}

impl RaidCategory {
    pub const ALL: [RaidCategory; 2] = [RaidCategory::Join, RaidCategory::RapidJoin];
}

/// What a registry key is tracking. Part of [`EntryKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCategory {
    Punishment(PunishmentType),
    Spam(SpamCategory),
    Raid(RaidCategory),
    MessageBatch,
    FuzzySession,
}

/// Compound `(guild, entity, category)` key used by every timed registry.
/// The entity is a user for punishments, spam counters and sessions, a
/// channel for message batches. Raid counters are guild-wide and use 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub guild_id: GuildId,
    pub entity_id: u64,
    pub category: KeyCategory,
}

impl EntryKey {
    pub fn punishment(guild_id: GuildId, user_id: UserId, punishment: PunishmentType) -> Self {
        Self {
            guild_id,
            entity_id: user_id,
            category: KeyCategory::Punishment(punishment),
        }
    }

    pub fn spam_counter(guild_id: GuildId, user_id: UserId, category: SpamCategory) -> Self {
        Self {
            guild_id,
            entity_id: user_id,
            category: KeyCategory::Spam(category),
        }
    }

    pub fn raid_counter(guild_id: GuildId, category: RaidCategory) -> Self {
        Self {
            guild_id,
            entity_id: 0,
            category: KeyCategory::Raid(category),
        }
    }

    pub fn message_batch(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            entity_id: channel_id,
            category: KeyCategory::MessageBatch,
        }
    }

    pub fn fuzzy_session(guild_id: GuildId, user_id: UserId) -> Self {
        Self {
            guild_id,
            entity_id: user_id,
            category: KeyCategory::FuzzySession,
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{:?}", self.guild_id, self.entity_id, self.category)
    }
}

/// Who gets punished, with what. `role_id` is only meaningful for role mutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentTarget {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub punishment: PunishmentType,
    pub role_id: Option<RoleId>,
}

/// A pending reversal of a temporary punishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPunishment {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub punishment: PunishmentType,
    pub role_id: Option<RoleId>,
    pub expires_at: DateTime<Utc>,
    /// Consecutive failed reversal attempts
    pub failed_attempts: u32,
}

impl ScheduledPunishment {
    pub fn key(&self) -> EntryKey {
        EntryKey::punishment(self.guild_id, self.user_id, self.punishment)
    }

    pub fn target(&self) -> PunishmentTarget {
        PunishmentTarget {
            guild_id: self.guild_id,
            user_id: self.user_id,
            punishment: self.punishment,
            role_id: self.role_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        if let Some(content_type) = &self.content_type {
            return content_type.starts_with("image/");
        }
        let lower = self.filename.to_lowercase();
        [".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"]
            .iter()
            .any(|ext| lower.ends_with(ext))
    }
}

/// Inbound chat message as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub content: String,
    /// User and role mentions in the message
    #[serde(default)]
    pub mention_count: u32,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

/// Events the engine consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message(ChatMessage),
    MemberJoin {
        guild_id: GuildId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
}

/// What caused an automated punishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSource {
    Spam { category: SpamCategory },
    Raid { category: RaidCategory },
    Phrase { phrase_id: String },
    Manual,
}

/// Moderation-log notification emitted for every successful punishment trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationNotice {
    pub target: PunishmentTarget,
    pub duration_seconds: Option<u64>,
    pub reason: String,
    pub source: TriggerSource,
    pub issued_at: DateTime<Utc>,
}

/// Failures reported by the moderation action executor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The member, ban or message no longer exists on the remote end
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("rejected by platform: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("failed to apply {punishment} to user {user_id} in guild {guild_id}: {source}")]
    ApplyFailed {
        guild_id: GuildId,
        user_id: UserId,
        punishment: PunishmentType,
        #[source]
        source: ExecutorError,
    },
    #[error("role mute for user {user_id} in guild {guild_id} has no mute role configured")]
    MissingMuteRole { guild_id: GuildId, user_id: UserId },
}

/// Time source, injected so timing logic can be driven deterministically
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(PunishmentType::Ban > PunishmentType::SoftBan);
        assert!(PunishmentType::Kick > PunishmentType::Deafen);
        assert!(PunishmentType::VoiceMute > PunishmentType::RoleMute);
        assert_eq!(
            PunishmentType::ALL.iter().max().copied(),
            Some(PunishmentType::Ban)
        );
    }

    #[test]
    fn test_reversible_punishments() {
        assert!(PunishmentType::Ban.is_reversible());
        assert!(PunishmentType::VoiceMute.is_reversible());
        assert!(!PunishmentType::Kick.is_reversible());
        assert!(!PunishmentType::SoftBan.is_reversible());
    }

    #[test]
    fn test_attachment_image_detection() {
        let by_type = Attachment {
            filename: "blob".to_string(),
            content_type: Some("image/png".to_string()),
        };
        let by_name = Attachment {
            filename: "Cat.JPG".to_string(),
            content_type: None,
        };
        let text = Attachment {
            filename: "notes.txt".to_string(),
            content_type: Some("text/plain".to_string()),
        };
        assert!(by_type.is_image());
        assert!(by_name.is_image());
        assert!(!text.is_image());
    }

    #[test]
    fn test_chat_event_deserialization() {
        let json = r#"{"type":"member_join","guild_id":1,"user_id":2,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ChatEvent::MemberJoin { guild_id: 1, user_id: 2, .. }));
    }

    #[test]
    fn test_manual_clock() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }
}
