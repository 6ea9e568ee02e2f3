//! # ModWarden
//!
//! Timing and escalation engine for automated chat moderation.
//!
//! ## Features
//!
//! - **Spam and raid detection**: sliding-window counters per guild, user and category
//! - **Banned phrases**: literal, regex and fuzzy matching, including phrases split across messages
//! - **Escalation**: repeated violations promote users to harsher punishments
//! - **Timed punishments**: mutes and bans are reversed automatically when they expire
//! - **Snapshots**: pending reversals and violation counts survive restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modwarden::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(StaticConfigProvider::uniform(default_guild_config()));
//!     let engine = Arc::new(ModerationEngine::new(
//!         config,
//!         Arc::new(DryRunExecutor::new()),
//!         Arc::new(SystemClock),
//!         Arc::new(EngineMetrics::new()),
//!         EngineSettings::default(),
//!     ));
//!
//!     let sweeper = Arc::new(PeriodicSweeper::new(Arc::clone(&engine)));
//!     sweeper.start().await;
//!
//!     engine.handle_join(1, 42, chrono::Utc::now()).await?;
//!
//!     sweeper.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod platforms;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::escalation::EscalationTracker;
    pub use crate::bot::metrics::{EngineMetrics, MetricsSnapshot};
    pub use crate::bot::raid::RaidDetector;
    pub use crate::bot::registry::TimedActionRegistry;
    pub use crate::bot::scheduler::{PunishmentScheduler, ScheduleOutcome};
    pub use crate::bot::spam::SpamDetector;
    pub use crate::bot::sweeper::PeriodicSweeper;
    pub use crate::bot::window::SlidingWindowCounter;
    pub use crate::bot::{ActionTaken, ModerationEngine, PardonSummary};
    pub use crate::config::{
        default_guild_config, ConfigurationManager, EngineSettings, GuildConfigProvider, GuildModerationConfig,
        StaticConfigProvider,
    };
    pub use crate::platforms::{dry_run::DryRunExecutor, ModerationExecutor};
    pub use crate::types::{
        ChatEvent, ChatMessage, Clock, ExecutorError, ModerationError, PunishmentType, SystemClock,
    };
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
