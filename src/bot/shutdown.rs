// src/bot/shutdown.rs - Graceful shutdown management

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, RwLock, Semaphore, SemaphorePermit};
use tokio::time::timeout;

use crate::bot::persistence::SnapshotStore;
use crate::bot::sweeper::PeriodicSweeper;
use crate::bot::ModerationEngine;

/// Upper bound on events handled at once; draining waits for all of them
const MAX_IN_FLIGHT_EVENTS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// No new events are accepted, in-flight ones finish
    Draining,
    /// Components are being stopped
    Terminating,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long in-flight events get to finish
    pub drain_timeout_seconds: u64,
    /// Per-component limit for `shutdown`
    pub component_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: 30,
            component_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownStats {
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub components_shutdown: Vec<String>,
    pub failed_components: Vec<(String, String)>,
    pub forced_drain: bool,
}

/// Something that must be stopped, in registration order, before exit
#[async_trait::async_trait]
pub trait ShutdownComponent: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<()>;
}

/// Coordinates SIGINT/SIGTERM handling, draining of in-flight events and
/// the ordered shutdown of registered components.
pub struct GracefulShutdown {
    config: ShutdownConfig,
    phase: Arc<RwLock<ShutdownPhase>>,
    stats: Arc<RwLock<ShutdownStats>>,
    shutdown_notifier: broadcast::Sender<ShutdownPhase>,
    components: RwLock<Vec<Box<dyn ShutdownComponent>>>,
    in_flight: Semaphore,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(10);

        Self {
            config,
            phase: Arc::new(RwLock::new(ShutdownPhase::Running)),
            stats: Arc::new(RwLock::new(ShutdownStats::default())),
            shutdown_notifier: shutdown_tx,
            components: RwLock::new(Vec::new()),
            in_flight: Semaphore::new(MAX_IN_FLIGHT_EVENTS as usize),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub async fn register_component(&self, component: Box<dyn ShutdownComponent>) {
        debug!("Registered shutdown component: {}", component.name());
        self.components.write().await.push(component);
    }

    /// Move to `Draining` on Ctrl+C or SIGTERM
    pub fn start_signal_handlers(&self) {
        let phase = Arc::clone(&self.phase);
        let notifier = self.shutdown_notifier.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    request_drain(&phase, &notifier).await;
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });

        #[cfg(unix)]
        {
            let phase = Arc::clone(&self.phase);
            let notifier = self.shutdown_notifier.clone();
            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                sigterm.recv().await;
                info!("Received SIGTERM, shutting down gracefully...");
                request_drain(&phase, &notifier).await;
            });
        }

        info!("Shutdown signal handlers started");
    }

    pub async fn trigger_shutdown(&self) {
        info!("Shutdown requested");
        request_drain(&self.phase, &self.shutdown_notifier).await;
    }

    /// Permit for handling one event; `None` once shutdown has begun
    pub async fn acquire_event_permit(&self) -> Option<SemaphorePermit<'_>> {
        if *self.phase.read().await != ShutdownPhase::Running {
            return None;
        }
        self.in_flight.acquire().await.ok()
    }

    /// Drain in-flight events, then stop every component in registration order
    pub async fn perform_shutdown(&self) -> Result<()> {
        self.stats.write().await.started_at = Some(chrono::Utc::now());
        request_drain(&self.phase, &self.shutdown_notifier).await;

        let drain_limit = Duration::from_secs(self.config.drain_timeout_seconds);
        match timeout(drain_limit, self.in_flight.acquire_many(MAX_IN_FLIGHT_EVENTS)).await {
            Ok(Ok(_all)) => debug!("All in-flight events finished"),
            Ok(Err(e)) => warn!("Could not wait for in-flight events: {}", e),
            Err(_) => {
                warn!("In-flight events still running after {:?}, continuing shutdown", drain_limit);
                self.stats.write().await.forced_drain = true;
            }
        }

        self.set_phase(ShutdownPhase::Terminating).await;
        self.shutdown_all_components().await;

        self.stats.write().await.completed_at = Some(chrono::Utc::now());
        self.set_phase(ShutdownPhase::Stopped).await;
        info!("Graceful shutdown complete");
        Ok(())
    }

    async fn shutdown_all_components(&self) {
        let components = self.components.read().await;
        let limit = Duration::from_secs(self.config.component_timeout_seconds);

        for component in components.iter() {
            let name = component.name().to_string();
            match timeout(limit, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!("Component '{}' shut down", name);
                    self.stats.write().await.components_shutdown.push(name);
                }
                Ok(Err(e)) => {
                    error!("Component '{}' failed to shut down: {:#}", name, e);
                    self.stats.write().await.failed_components.push((name, e.to_string()));
                }
                Err(_) => {
                    error!("Component '{}' shutdown timed out", name);
                    self.stats
                        .write()
                        .await
                        .failed_components
                        .push((name, "shutdown timed out".to_string()));
                }
            }
        }
    }

    async fn set_phase(&self, phase: ShutdownPhase) {
        *self.phase.write().await = phase;
        let _ = self.shutdown_notifier.send(phase);
    }

    pub async fn get_phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    pub async fn get_stats(&self) -> ShutdownStats {
        self.stats.read().await.clone()
    }

    pub async fn is_shutdown_requested(&self) -> bool {
        *self.phase.read().await != ShutdownPhase::Running
    }

    pub fn subscribe_to_shutdown(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.shutdown_notifier.subscribe()
    }
}

async fn request_drain(phase: &RwLock<ShutdownPhase>, notifier: &broadcast::Sender<ShutdownPhase>) {
    let mut current = phase.write().await;
    if *current == ShutdownPhase::Running {
        *current = ShutdownPhase::Draining;
        let _ = notifier.send(ShutdownPhase::Draining);
    }
}

#[async_trait::async_trait]
impl<T: ShutdownComponent + ?Sized> ShutdownComponent for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn shutdown(&self) -> Result<()> {
        (**self).shutdown().await
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for PeriodicSweeper {
    fn name(&self) -> &str {
        "sweeper"
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}

/// Writes a final snapshot of the engine's state
pub struct SnapshotOnShutdown {
    engine: Arc<ModerationEngine>,
    store: SnapshotStore,
}

impl SnapshotOnShutdown {
    pub fn new(engine: Arc<ModerationEngine>, store: SnapshotStore) -> Self {
        Self { engine, store }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for SnapshotOnShutdown {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn shutdown(&self) -> Result<()> {
        self.store.save(&self.engine.snapshot()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::tests::{harness, start};
    use crate::types::PunishmentType;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct OrderedComponent {
        name: String,
        order: Arc<AtomicUsize>,
        seen_at: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownComponent for OrderedComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) -> Result<()> {
            self.seen_at
                .store(self.order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow::anyhow!("component failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_phases_and_permits() {
        let shutdown = GracefulShutdown::with_default_config();
        assert_eq!(shutdown.get_phase().await, ShutdownPhase::Running);
        assert!(shutdown.acquire_event_permit().await.is_some());

        let mut phases = shutdown.subscribe_to_shutdown();
        shutdown.trigger_shutdown().await;

        assert_eq!(phases.recv().await.unwrap(), ShutdownPhase::Draining);
        assert!(shutdown.is_shutdown_requested().await);
        assert!(shutdown.acquire_event_permit().await.is_none());
    }

    #[tokio::test]
    async fn test_components_stop_in_order_despite_failures() {
        let shutdown = GracefulShutdown::with_default_config();
        let order = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        shutdown
            .register_component(Box::new(OrderedComponent {
                name: "first".to_string(),
                order: Arc::clone(&order),
                seen_at: Arc::clone(&first),
                fail: true,
            }))
            .await;
        shutdown
            .register_component(Box::new(OrderedComponent {
                name: "second".to_string(),
                order: Arc::clone(&order),
                seen_at: Arc::clone(&second),
                fail: false,
            }))
            .await;

        shutdown.perform_shutdown().await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        let stats = shutdown.get_stats().await;
        assert_eq!(stats.components_shutdown, vec!["second".to_string()]);
        assert_eq!(stats.failed_components.len(), 1);
        assert_eq!(shutdown.get_phase().await, ShutdownPhase::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper_and_saves_snapshot() {
        let h = harness();
        h.engine
            .scheduler()
            .apply_punishment(1, 5, PunishmentType::Deafen, Some(ChronoDuration::hours(2)), None, "test")
            .await
            .unwrap();

        let sweeper = Arc::new(PeriodicSweeper::new(Arc::clone(&h.engine)));
        sweeper.start().await;

        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        let shutdown = GracefulShutdown::with_default_config();
        shutdown.register_component(Box::new(Arc::clone(&sweeper))).await;
        shutdown
            .register_component(Box::new(SnapshotOnShutdown::new(Arc::clone(&h.engine), store.clone())))
            .await;

        shutdown.perform_shutdown().await.unwrap();

        assert!(!sweeper.is_running());
        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.scheduled_punishments.len(), 1);
        assert_eq!(
            saved.scheduled_punishments[0].expires_at_unix_millis,
            (start() + ChronoDuration::hours(2)).timestamp_millis()
        );
    }
}
