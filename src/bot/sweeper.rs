// src/bot/sweeper.rs - Background loops draining expired moderation state

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bot::deletion::DeletionBatch;
use crate::bot::ModerationEngine;
use crate::config::bounded_seconds;
use crate::platforms::with_timeout;
use crate::types::{ExecutorError, ScheduledPunishment};

/// Outcome of one reversal tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReversalReport {
    pub reversed: usize,
    /// Executor said the punishment was already gone
    pub already_gone: usize,
    pub retrying: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransientReport {
    pub messages_deleted: usize,
    pub failed_batches: usize,
    pub sessions_expired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub violations_decayed: usize,
    pub spam_counters_pruned: usize,
    pub raid_counters_pruned: usize,
}

enum ReversalOutcome {
    Reversed,
    AlreadyGone,
    Retrying,
    Dropped,
}

/// Runs three independent interval loops over the engine's timed state:
/// punishment reversals, transient state (message deletions and fuzzy
/// sessions), and hourly maintenance.
///
/// Each tick handles every due entry. A failing entry is logged and never
/// stops the rest of the tick.
pub struct PeriodicSweeper {
    engine: Arc<ModerationEngine>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl PeriodicSweeper {
    pub fn new(engine: Arc<ModerationEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the loops. Calling this on a running sweeper does nothing.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sweeper already running");
            return;
        }

        let settings = self.engine.settings().sweeper.clone();
        let mut handles = self.handles.lock().await;

        let sweeper = Arc::clone(self);
        handles.push(tokio::spawn(run_every(
            "reversal",
            std::time::Duration::from_secs(settings.reversal_interval_seconds.max(1)),
            self.shutdown_tx.subscribe(),
            move || {
                let sweeper = Arc::clone(&sweeper);
                async move {
                    let now = sweeper.engine.clock().now();
                    sweeper.sweep_reversals(now).await;
                }
            },
        )));

        let sweeper = Arc::clone(self);
        handles.push(tokio::spawn(run_every(
            "transient",
            std::time::Duration::from_millis(settings.transient_interval_ms.max(1)),
            self.shutdown_tx.subscribe(),
            move || {
                let sweeper = Arc::clone(&sweeper);
                async move {
                    let now = sweeper.engine.clock().now();
                    sweeper.sweep_transient(now).await;
                }
            },
        )));

        let sweeper = Arc::clone(self);
        handles.push(tokio::spawn(run_every(
            "maintenance",
            std::time::Duration::from_secs(settings.maintenance_interval_seconds.max(1)),
            self.shutdown_tx.subscribe(),
            move || {
                let sweeper = Arc::clone(&sweeper);
                async move {
                    let now = sweeper.engine.clock().now();
                    sweeper.run_maintenance(now);
                }
            },
        )));

        info!(
            "Sweeper started (reversals every {}s, transient every {}ms, maintenance every {}s)",
            settings.reversal_interval_seconds, settings.transient_interval_ms, settings.maintenance_interval_seconds
        );
    }

    /// Signal the loops and wait for them to finish their current tick
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Sweeper loop ended abnormally: {}", e);
            }
        }
        info!("Sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reverse every punishment that expired by `now`
    pub async fn sweep_reversals(&self, now: DateTime<Utc>) -> ReversalReport {
        self.engine.metrics().record_sweep(1);
        let due = self.engine.scheduler().reversals().sweep(now);
        if due.is_empty() {
            return ReversalReport::default();
        }

        let concurrency = self.engine.settings().reversal_concurrency.max(1);
        let total = due.len();
        let outcomes: Vec<ReversalOutcome> = stream::iter(due)
            .map(|entry| self.reverse_one(entry.payload, now))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = ReversalReport::default();
        for outcome in outcomes {
            match outcome {
                ReversalOutcome::Reversed => report.reversed += 1,
                ReversalOutcome::AlreadyGone => report.already_gone += 1,
                ReversalOutcome::Retrying => report.retrying += 1,
                ReversalOutcome::Dropped => report.dropped += 1,
            }
        }

        info!(
            "Reversal sweep: {} due, {} reversed, {} already gone, {} retrying, {} dropped",
            total, report.reversed, report.already_gone, report.retrying, report.dropped
        );
        report
    }

    async fn reverse_one(&self, scheduled: ScheduledPunishment, now: DateTime<Utc>) -> ReversalOutcome {
        let scheduler = self.engine.scheduler();
        let metrics = self.engine.metrics();
        let target = scheduled.target();
        let reason = format!("temporary {} expired", scheduled.punishment);

        let result = with_timeout(
            scheduler.call_timeout(),
            scheduler.executor().reverse_punishment(&target, &reason),
        )
        .await;

        let error = match result {
            Ok(()) => {
                metrics.record_reversal_completed(1);
                info!(
                    "Lifted {} for user {} in guild {}",
                    target.punishment, target.user_id, target.guild_id
                );
                return ReversalOutcome::Reversed;
            }
            Err(ExecutorError::NotFound(detail)) => {
                metrics.record_reversal_completed(1);
                debug!(
                    "{} for user {} in guild {} was already lifted: {}",
                    target.punishment, target.user_id, target.guild_id, detail
                );
                return ReversalOutcome::AlreadyGone;
            }
            Err(e) => e,
        };

        metrics.record_reversal_failed(1);
        let settings = self.engine.settings();
        let attempts = scheduled.failed_attempts.saturating_add(1);
        if attempts >= settings.failure_alert_threshold {
            error!(
                "Failed to lift {} for user {} in guild {} ({} attempts): {}",
                target.punishment, target.user_id, target.guild_id, attempts, error
            );
        } else {
            warn!(
                "Failed to lift {} for user {} in guild {} (attempt {}): {}",
                target.punishment, target.user_id, target.guild_id, attempts, error
            );
        }

        if !settings.retry_failed_reversals {
            return ReversalOutcome::Dropped;
        }
        let retry_at = now + bounded_seconds(settings.reversal_retry_seconds);
        if scheduler.reschedule_failed(scheduled, retry_at) {
            ReversalOutcome::Retrying
        } else {
            ReversalOutcome::Dropped
        }
    }

    /// Flush due message deletions and expire fuzzy sessions
    pub async fn sweep_transient(&self, now: DateTime<Utc>) -> TransientReport {
        let batches = self.engine.deletions().take_due(now);
        let sessions_expired = self.engine.phrases().expire_sessions(now);

        let concurrency = self.engine.settings().reversal_concurrency.max(1);
        let results: Vec<Result<usize, ()>> = stream::iter(batches)
            .map(|batch| self.delete_batch(batch))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = TransientReport {
            sessions_expired,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(deleted) => report.messages_deleted += deleted,
                Err(()) => report.failed_batches += 1,
            }
        }
        if report.messages_deleted > 0 {
            self.engine.metrics().record_messages_deleted(report.messages_deleted as u64);
        }
        report
    }

    async fn delete_batch(&self, batch: DeletionBatch) -> Result<usize, ()> {
        let scheduler = self.engine.scheduler();
        let call = scheduler
            .executor()
            .delete_messages(batch.guild_id, batch.channel_id, &batch.message_ids);

        match with_timeout(scheduler.call_timeout(), call).await {
            Ok(()) => {
                debug!(
                    "Deleted {} message(s) in channel {} of guild {}",
                    batch.message_ids.len(),
                    batch.channel_id,
                    batch.guild_id
                );
                Ok(batch.message_ids.len())
            }
            Err(ExecutorError::NotFound(_)) => Ok(0),
            Err(e) => {
                warn!(
                    "Failed to delete {} message(s) in channel {} of guild {}: {}",
                    batch.message_ids.len(),
                    batch.channel_id,
                    batch.guild_id,
                    e
                );
                Err(())
            }
        }
    }

    /// Forget stale violation records and idle detector counters
    pub fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let ttl = bounded_seconds(self.engine.settings().violation_ttl_seconds);
        let report = MaintenanceReport {
            violations_decayed: self.engine.escalation().decay(now, ttl),
            spam_counters_pruned: self.engine.spam().prune_idle(now),
            raid_counters_pruned: self.engine.raid().prune_idle(now),
        };
        debug!("Maintenance: {:?}", report);
        report
    }
}

async fn run_every<F, Fut>(
    name: &'static str,
    period: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            _ = shutdown.recv() => {
                debug!("{} loop stopping", name);
                break;
            }
        }
    }
}
