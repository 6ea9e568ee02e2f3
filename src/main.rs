use anyhow::Result;
use log::{debug, error, info, warn};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use modwarden::bot::persistence::SnapshotStore;
use modwarden::bot::shutdown::{GracefulShutdown, SnapshotOnShutdown};
use modwarden::config::ConfigChangeEvent;
use modwarden::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting ModWarden v{}", env!("CARGO_PKG_VERSION"));

    // =================================================================
    // CONFIGURATION
    // =================================================================

    let config_dir = PathBuf::from(env::var("MODWARDEN_CONFIG_DIR").unwrap_or_else(|_| "config".to_string()));
    let config_manager = Arc::new(ConfigurationManager::new(&config_dir));

    if let Err(e) = config_manager.initialize().await {
        error!("Failed to initialize configuration system: {:#}", e);
        return Err(e);
    }

    let settings = config_manager.get_engine_settings().await;
    info!(
        "Configuration loaded from {} (reversal sweep every {}s, executor timeout {}ms)",
        config_dir.display(),
        settings.sweeper.reversal_interval_seconds,
        settings.executor_timeout_ms
    );

    let mut config_changes = config_manager.subscribe_changes();
    tokio::spawn(async move {
        while let Ok(event) = config_changes.recv().await {
            match event {
                ConfigChangeEvent::GuildsReloaded { guilds } => {
                    info!("Guild configuration reloaded ({} guilds)", guilds);
                }
                ConfigChangeEvent::ValidationError { file, error } => {
                    warn!("Rejected configuration change in {}: {}", file, error);
                }
            }
        }
    });

    // =================================================================
    // ENGINE
    // =================================================================

    let executor = Arc::new(DryRunExecutor::new());
    let engine = Arc::new(ModerationEngine::new(
        config_manager.clone() as Arc<dyn GuildConfigProvider>,
        executor.clone() as Arc<dyn ModerationExecutor>,
        Arc::new(SystemClock),
        Arc::new(EngineMetrics::new()),
        settings.clone(),
    ));

    let store = SnapshotStore::new(&settings.snapshot_path);
    match store.load().await {
        Ok(Some(snapshot)) => {
            let (scheduled, violations) = engine.restore(&snapshot);
            info!(
                "Restored {} pending reversal(s) and {} violation record(s) from {}",
                scheduled,
                violations,
                store.path().display()
            );
        }
        Ok(None) => info!("No previous snapshot, starting with empty state"),
        Err(e) => error!("Ignoring unreadable snapshot: {:#}", e),
    }

    let sweeper = Arc::new(PeriodicSweeper::new(Arc::clone(&engine)));
    sweeper.start().await;

    // =================================================================
    // SHUTDOWN
    // =================================================================

    let shutdown = GracefulShutdown::with_default_config();
    shutdown.register_component(Box::new(Arc::clone(&sweeper))).await;
    shutdown
        .register_component(Box::new(SnapshotOnShutdown::new(Arc::clone(&engine), store)))
        .await;
    shutdown.start_signal_handlers();

    // =================================================================
    // EVENT LOOP
    // =================================================================

    info!("Reading chat events as JSON lines from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown_receiver = shutdown.subscribe_to_shutdown();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => process_line(&engine, &shutdown, &line).await,
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = shutdown_receiver.recv() => {
                info!("Event loop stopping");
                break;
            }
        }
    }

    shutdown.perform_shutdown().await?;

    let stats = engine.metrics().snapshot();
    info!(
        "Processed {} event(s): {} punishment(s) applied, {} reversal(s) completed, {} dry-run action(s)",
        stats.events_processed,
        stats.punishments_applied,
        stats.reversals_completed,
        executor.action_count()
    );
    debug!("Final metrics: {}", serde_json::to_string(&stats)?);

    Ok(())
}

async fn process_line(engine: &ModerationEngine, shutdown: &GracefulShutdown, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let event: ChatEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping malformed event: {}", e);
            return;
        }
    };

    let Some(_permit) = shutdown.acquire_event_permit().await else {
        debug!("Shutdown in progress, dropping event");
        return;
    };

    match engine.handle_event(&event).await {
        Ok(Some(action)) => info!(
            "{} user {} in guild {} ({:?})",
            action.target.punishment, action.target.user_id, action.target.guild_id, action.outcome
        ),
        Ok(None) => {}
        Err(e) => warn!("{}", e),
    }
}
