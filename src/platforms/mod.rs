use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::types::{ChannelId, ExecutorError, GuildId, MessageId, ModerationNotice, PunishmentTarget};

pub mod dry_run;

/// Interface to the chat platform. The engine never talks to the platform
/// directly; every side effect goes through this trait.
///
/// Implementations should treat reversals as idempotent: reversing a
/// punishment that is already gone should return `Ok` or
/// [`ExecutorError::NotFound`].
#[async_trait]
pub trait ModerationExecutor: Send + Sync {
    /// Apply a punishment (ban, kick, mute, ...)
    async fn apply_punishment(&self, target: &PunishmentTarget, reason: &str) -> Result<(), ExecutorError>;

    /// Undo a temporary punishment once it has expired
    async fn reverse_punishment(&self, target: &PunishmentTarget, reason: &str) -> Result<(), ExecutorError>;

    /// Bulk delete messages from one channel
    async fn delete_messages(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> Result<(), ExecutorError>;

    /// Post a notice to the guild's moderation log
    async fn send_moderation_log(&self, notice: &ModerationNotice) -> Result<(), ExecutorError>;
}

/// Await an executor call, turning an elapsed deadline into [`ExecutorError::Timeout`]
pub async fn with_timeout<F>(limit: Duration, call: F) -> Result<(), ExecutorError>
where
    F: Future<Output = Result<(), ExecutorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExecutorError::Timeout(limit.as_millis() as u64)),
    }
}
