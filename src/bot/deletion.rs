// src/bot/deletion.rs - Delayed, batched message deletion

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;

use crate::bot::registry::TimedActionRegistry;
use crate::types::{ChannelId, EntryKey, GuildId, MessageId};

/// Most platforms cap bulk deletion at 100 messages per call
pub const MAX_BATCH_SIZE: usize = 100;

/// Messages from one channel that are due for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionBatch {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_ids: Vec<MessageId>,
}

/// Collects messages to delete per channel so a spam burst turns into a few
/// bulk deletions instead of one call per message.
pub struct MessageDeletionQueue {
    pending: TimedActionRegistry<MessageId>,
}

impl Default for MessageDeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDeletionQueue {
    pub fn new() -> Self {
        Self {
            pending: TimedActionRegistry::new("message_deletions"),
        }
    }

    pub fn enqueue(&self, guild_id: GuildId, channel_id: ChannelId, message_id: MessageId, due_at: DateTime<Utc>) {
        self.pending
            .add(EntryKey::message_batch(guild_id, channel_id), message_id, due_at);
    }

    /// Take every due message, grouped by channel and split into bulk-sized batches
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<DeletionBatch> {
        let mut by_channel: BTreeMap<(GuildId, ChannelId), Vec<MessageId>> = BTreeMap::new();
        for entry in self.pending.sweep(now) {
            by_channel
                .entry((entry.key.guild_id, entry.key.entity_id))
                .or_default()
                .push(entry.payload);
        }

        let mut batches = Vec::new();
        for ((guild_id, channel_id), mut ids) in by_channel {
            ids.sort_unstable();
            ids.dedup();
            batches.extend(ids.chunks(MAX_BATCH_SIZE).map(|chunk| DeletionBatch {
                guild_id,
                channel_id,
                message_ids: chunk.to_vec(),
            }));
        }

        if !batches.is_empty() {
            debug!("{} message deletion batch(es) due", batches.len());
        }
        batches
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
