// src/platforms/dry_run.rs - Executor that only logs what it would do

use async_trait::async_trait;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ModerationExecutor;
use crate::types::{ChannelId, ExecutorError, GuildId, MessageId, ModerationNotice, PunishmentTarget};

/// Stand-in executor for running the engine without a platform connection.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    actions: AtomicU64,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions "performed" so far
    pub fn action_count(&self) -> u64 {
        self.actions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModerationExecutor for DryRunExecutor {
    async fn apply_punishment(&self, target: &PunishmentTarget, reason: &str) -> Result<(), ExecutorError> {
        self.actions.fetch_add(1, Ordering::Relaxed);
        info!(
            "[dry-run] {} user {} in guild {} (role: {:?}): {}",
            target.punishment, target.user_id, target.guild_id, target.role_id, reason
        );
        Ok(())
    }

    async fn reverse_punishment(&self, target: &PunishmentTarget, reason: &str) -> Result<(), ExecutorError> {
        self.actions.fetch_add(1, Ordering::Relaxed);
        info!(
            "[dry-run] {} user {} in guild {}: {}",
            target.punishment.reversal_name(),
            target.user_id,
            target.guild_id,
            reason
        );
        Ok(())
    }

    async fn delete_messages(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> Result<(), ExecutorError> {
        self.actions.fetch_add(1, Ordering::Relaxed);
        info!(
            "[dry-run] delete {} message(s) in channel {} of guild {}",
            message_ids.len(),
            channel_id,
            guild_id
        );
        Ok(())
    }

    async fn send_moderation_log(&self, notice: &ModerationNotice) -> Result<(), ExecutorError> {
        info!(
            "[dry-run] modlog guild {}: {} user {} for {:?} ({})",
            notice.target.guild_id,
            notice.target.punishment,
            notice.target.user_id,
            notice.duration_seconds,
            notice.reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PunishmentType;

    #[tokio::test]
    async fn test_dry_run_counts_actions() {
        let executor = DryRunExecutor::new();
        let target = PunishmentTarget {
            guild_id: 1,
            user_id: 2,
            punishment: PunishmentType::Kick,
            role_id: None,
        };

        executor.apply_punishment(&target, "test").await.unwrap();
        executor.delete_messages(1, 3, &[10, 11]).await.unwrap();

        assert_eq!(executor.action_count(), 2);
    }
}
