// src/bot/persistence.rs - Moderation state snapshots

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::bot::escalation::PunishmentRecord;
use crate::types::{GuildId, PunishmentType, RoleId, ScheduledPunishment, UserId};

/// Serialized pending reversal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledPunishmentRecord {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub punishment_type: PunishmentType,
    pub role_id: Option<RoleId>,
    pub expires_at_unix_millis: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_attempts: u32,
}

/// Serialized escalation counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub punishment_type: PunishmentType,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_violation_unix_millis: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationSnapshot {
    pub taken_at_unix_millis: i64,
    #[serde(default)]
    pub scheduled_punishments: Vec<ScheduledPunishmentRecord>,
    #[serde(default)]
    pub violations: Vec<ViolationRecord>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl From<&ScheduledPunishment> for ScheduledPunishmentRecord {
    fn from(scheduled: &ScheduledPunishment) -> Self {
        Self {
            guild_id: scheduled.guild_id,
            user_id: scheduled.user_id,
            punishment_type: scheduled.punishment,
            role_id: scheduled.role_id,
            expires_at_unix_millis: scheduled.expires_at.timestamp_millis(),
            failed_attempts: scheduled.failed_attempts,
        }
    }
}

impl ScheduledPunishmentRecord {
    /// `None` when the stored timestamp is out of range
    pub fn to_scheduled(&self) -> Option<ScheduledPunishment> {
        let expires_at = DateTime::from_timestamp_millis(self.expires_at_unix_millis)?;
        Some(ScheduledPunishment {
            guild_id: self.guild_id,
            user_id: self.user_id,
            punishment: self.punishment_type,
            role_id: self.role_id,
            expires_at,
            failed_attempts: self.failed_attempts,
        })
    }
}

impl From<&PunishmentRecord> for ViolationRecord {
    fn from(record: &PunishmentRecord) -> Self {
        Self {
            guild_id: record.guild_id,
            user_id: record.user_id,
            punishment_type: record.punishment,
            count: record.violation_count,
            last_violation_unix_millis: Some(record.last_violation_at.timestamp_millis()),
        }
    }
}

impl ViolationRecord {
    /// Records without a timestamp are treated as fresh at `now`
    pub fn to_record(&self, now: DateTime<Utc>) -> PunishmentRecord {
        let last_violation_at = self
            .last_violation_unix_millis
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(now);
        PunishmentRecord {
            guild_id: self.guild_id,
            user_id: self.user_id,
            punishment: self.punishment_type,
            violation_count: self.count,
            last_violation_at,
        }
    }
}

/// Stores snapshots as JSON. Writes go to a temporary file that is renamed
/// over the target, so a crash mid-write never leaves a truncated snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, snapshot: &ModerationSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create snapshot directory: {}", parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move snapshot into place: {}", self.path.display()))?;

        info!(
            "Saved snapshot with {} scheduled punishment(s) and {} violation record(s) to {}",
            snapshot.scheduled_punishments.len(),
            snapshot.violations.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the snapshot, or `None` when no snapshot has been written yet
    pub async fn load(&self) -> Result<Option<ModerationSnapshot>> {
        if !self.path.exists() {
            debug!("No snapshot at {}", self.path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", self.path.display()))?;
        let snapshot: ModerationSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", self.path.display()))?;

        if snapshot.scheduled_punishments.is_empty() && snapshot.violations.is_empty() {
            warn!("Snapshot at {} is empty", self.path.display());
        }
        Ok(Some(snapshot))
    }
}
