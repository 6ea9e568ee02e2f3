// src/config/mod.rs - Guild moderation configuration with hot reload

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;

use crate::bot::phrases::normalize;
use crate::types::{GuildId, PunishmentType, RaidCategory, RoleId, SpamCategory, UserId};

/// Durations above this are rejected; keeps expiry arithmetic well inside chrono's range
const MAX_DURATION_SECONDS: u64 = 10 * 365 * 24 * 3600;

/// Longest a spam message may wait in the deletion queue
const MAX_DELETION_DELAY_MS: u64 = 10 * 60 * 1000;

/// Seconds as a chrono duration, saturated at the longest accepted duration.
/// Providers that skip validation can still hand out any `u64`.
pub fn bounded_seconds(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_DURATION_SECONDS) as i64)
}

pub fn bounded_millis(millis: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(millis.min(MAX_DURATION_SECONDS * 1000) as i64)
}

/// Source of per-guild moderation settings.
///
/// `None` means the guild has no configuration at all, which disables every
/// automated feature for it.
pub trait GuildConfigProvider: Send + Sync {
    fn guild_config(&self, guild_id: GuildId) -> Option<Arc<GuildModerationConfig>>;
}

/// Threshold rule shared by spam and raid categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Events needed inside the interval to trigger
    pub threshold: u32,
    pub interval_seconds: u64,
    pub punishment: PunishmentType,
    /// Temporary when set, permanent otherwise
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

impl ThresholdRule {
    pub fn interval(&self) -> chrono::Duration {
        bounded_seconds(self.interval_seconds)
    }
}

/// Violations of one punishment type needed before that punishment is issued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTier {
    pub limit: u32,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PhraseMatchMode {
    /// Case-insensitive substring match on normalized text
    Literal,
    Regex,
    /// Similarity at or above `threshold` (0.0-1.0) against any run of words
    /// as long as the pattern, also across consecutive messages
    Fuzzy { threshold: f32 },
}

impl Default for PhraseMatchMode {
    fn default() -> Self {
        PhraseMatchMode::Literal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannedPhrase {
    pub id: String,
    pub pattern: String,
    #[serde(default, rename = "match")]
    pub match_mode: PhraseMatchMode,
    /// Escalation counter this phrase feeds
    pub punishment: PunishmentType,
    /// Queue the offending message for deletion
    #[serde(default = "default_true")]
    pub delete_message: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    /// Characters above which a message also counts as long-message spam
    pub long_message_length: usize,
    /// Queue messages that triggered spam detection for deletion
    pub delete_spam_messages: bool,
    /// Delay before queued messages are deleted, lets several land in one batch
    pub deletion_delay_ms: u64,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            long_message_length: 1000,
            delete_spam_messages: true,
            deletion_delay_ms: 1500,
        }
    }
}

/// Everything the engine needs to know about one guild
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildModerationConfig {
    pub spam: HashMap<SpamCategory, ThresholdRule>,
    pub raid: HashMap<RaidCategory, ThresholdRule>,
    pub escalation: HashMap<PunishmentType, EscalationTier>,
    pub phrases: Vec<BannedPhrase>,
    pub messages: MessageSettings,
    pub mute_role_id: Option<RoleId>,
    pub exempt_users: Vec<UserId>,
}

impl GuildModerationConfig {
    pub fn spam_rule(&self, category: SpamCategory) -> Option<&ThresholdRule> {
        self.spam.get(&category)
    }

    pub fn raid_rule(&self, category: RaidCategory) -> Option<&ThresholdRule> {
        self.raid.get(&category)
    }

    pub fn escalation_tier(&self, punishment: PunishmentType) -> Option<&EscalationTier> {
        self.escalation.get(&punishment)
    }

    pub fn is_exempt(&self, user_id: UserId) -> bool {
        self.exempt_users.contains(&user_id)
    }
}

/// Contents of `guilds.yaml`. A guild listed under `guilds` replaces the
/// default profile entirely; unlisted guilds use `defaults`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildsFile {
    #[serde(default)]
    pub defaults: Option<GuildModerationConfig>,
    #[serde(default)]
    pub guilds: HashMap<GuildId, GuildModerationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    /// Coarse tick: escalation decay and idle counter pruning
    pub maintenance_interval_seconds: u64,
    /// Medium tick: expired punishment reversal
    pub reversal_interval_seconds: u64,
    /// Fine tick: message deletion batches and fuzzy sessions
    pub transient_interval_ms: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            maintenance_interval_seconds: 3600,
            reversal_interval_seconds: 60,
            transient_interval_ms: 500,
        }
    }
}

/// Contents of `engine.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sweeper: SweeperSettings,
    /// Upper bound for any single executor call
    pub executor_timeout_ms: u64,
    /// Reversals running at once within one tick
    pub reversal_concurrency: usize,
    pub retry_failed_reversals: bool,
    pub reversal_retry_seconds: u64,
    /// Consecutive failures after which reversal errors are logged as errors
    pub failure_alert_threshold: u32,
    /// Escalation records idle this long are forgotten
    pub violation_ttl_seconds: u64,
    pub fuzzy_session_ttl_seconds: u64,
    pub snapshot_path: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweeper: SweeperSettings::default(),
            executor_timeout_ms: 10_000,
            reversal_concurrency: 8,
            retry_failed_reversals: true,
            reversal_retry_seconds: 300,
            failure_alert_threshold: 3,
            violation_ttl_seconds: 24 * 3600,
            fuzzy_session_ttl_seconds: 30,
            snapshot_path: PathBuf::from("state/moderation_snapshot.json"),
        }
    }
}

impl EngineSettings {
    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }
}

/// Events broadcasted when configuration changes
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    GuildsReloaded { guilds: usize },
    ValidationError { file: String, error: String },
}

/// Fixed configuration, for embedding the engine without a config directory
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    guilds: HashMap<GuildId, Arc<GuildModerationConfig>>,
    fallback: Option<Arc<GuildModerationConfig>>,
}

impl StaticConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every guild gets the same configuration
    pub fn uniform(config: GuildModerationConfig) -> Self {
        Self {
            guilds: HashMap::new(),
            fallback: Some(Arc::new(config)),
        }
    }

    pub fn with_guild(mut self, guild_id: GuildId, config: GuildModerationConfig) -> Self {
        self.guilds.insert(guild_id, Arc::new(config));
        self
    }
}

impl GuildConfigProvider for StaticConfigProvider {
    fn guild_config(&self, guild_id: GuildId) -> Option<Arc<GuildModerationConfig>> {
        self.guilds.get(&guild_id).cloned().or_else(|| self.fallback.clone())
    }
}

/// Validates configuration before it is applied
#[derive(Debug, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_guilds_file(&self, file: &GuildsFile) -> Result<()> {
        if let Some(defaults) = &file.defaults {
            self.validate_guild(defaults)
                .context("invalid default guild profile")?;
        }
        for (guild_id, config) in &file.guilds {
            self.validate_guild(config)
                .with_context(|| format!("invalid configuration for guild {}", guild_id))?;
        }
        Ok(())
    }

    pub fn validate_guild(&self, config: &GuildModerationConfig) -> Result<()> {
        for (category, rule) in &config.spam {
            Self::validate_rule(rule).with_context(|| format!("spam rule {:?}", category))?;
        }
        for (category, rule) in &config.raid {
            Self::validate_rule(rule).with_context(|| format!("raid rule {:?}", category))?;
        }
        for (punishment, tier) in &config.escalation {
            if tier.limit == 0 {
                return Err(anyhow::anyhow!("escalation tier {} has a zero limit", punishment));
            }
            Self::validate_duration(tier.duration_seconds)
                .with_context(|| format!("escalation tier {}", punishment))?;
        }

        let mut seen = std::collections::HashSet::new();
        for phrase in &config.phrases {
            if !seen.insert(phrase.id.as_str()) {
                return Err(anyhow::anyhow!("duplicate phrase id '{}'", phrase.id));
            }
            if phrase.pattern.trim().is_empty() {
                return Err(anyhow::anyhow!("phrase '{}' has an empty pattern", phrase.id));
            }
            match phrase.match_mode {
                PhraseMatchMode::Regex => {
                    Regex::new(&phrase.pattern)
                        .with_context(|| format!("phrase '{}' is not a valid regex", phrase.id))?;
                }
                PhraseMatchMode::Fuzzy { threshold } => {
                    if !(threshold > 0.0 && threshold <= 1.0) {
                        return Err(anyhow::anyhow!(
                            "phrase '{}' fuzzy threshold {} is outside (0, 1]",
                            phrase.id,
                            threshold
                        ));
                    }
                }
                PhraseMatchMode::Literal => {}
            }
            if phrase.match_mode != PhraseMatchMode::Regex && normalize(&phrase.pattern).trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "phrase '{}' is empty after normalization",
                    phrase.id
                ));
            }
            if !config.escalation.contains_key(&phrase.punishment) {
                warn!(
                    "Phrase '{}' feeds {} but no escalation tier is configured for it; matches will be ignored",
                    phrase.id, phrase.punishment
                );
            }
        }

        if config.messages.deletion_delay_ms > MAX_DELETION_DELAY_MS {
            return Err(anyhow::anyhow!(
                "deletion_delay_ms {} exceeds the maximum of {}",
                config.messages.deletion_delay_ms,
                MAX_DELETION_DELAY_MS
            ));
        }

        let uses_role_mute = config
            .spam
            .values()
            .chain(config.raid.values())
            .any(|r| r.punishment == PunishmentType::RoleMute)
            || config.escalation.contains_key(&PunishmentType::RoleMute)
            || config.phrases.iter().any(|p| p.punishment == PunishmentType::RoleMute);
        if uses_role_mute && config.mute_role_id.is_none() {
            return Err(anyhow::anyhow!("role_mute is configured but no mute_role_id is set"));
        }

        Ok(())
    }

    pub fn validate_engine(&self, settings: &EngineSettings) -> Result<()> {
        if settings.sweeper.maintenance_interval_seconds == 0
            || settings.sweeper.reversal_interval_seconds == 0
            || settings.sweeper.transient_interval_ms == 0
        {
            return Err(anyhow::anyhow!("sweeper intervals must be greater than zero"));
        }
        if settings.reversal_concurrency == 0 {
            return Err(anyhow::anyhow!("reversal_concurrency must be at least 1"));
        }
        if settings.executor_timeout_ms == 0 {
            return Err(anyhow::anyhow!("executor_timeout_ms must be greater than zero"));
        }
        Self::validate_duration(Some(settings.reversal_retry_seconds))?;
        Self::validate_duration(Some(settings.violation_ttl_seconds))?;
        Self::validate_duration(Some(settings.fuzzy_session_ttl_seconds))?;
        Ok(())
    }

    fn validate_rule(rule: &ThresholdRule) -> Result<()> {
        if rule.threshold == 0 {
            return Err(anyhow::anyhow!("threshold must be greater than zero"));
        }
        if rule.interval_seconds == 0 {
            return Err(anyhow::anyhow!("interval_seconds must be greater than zero"));
        }
        Self::validate_duration(Some(rule.interval_seconds))?;
        Self::validate_duration(rule.duration_seconds)
    }

    fn validate_duration(seconds: Option<u64>) -> Result<()> {
        match seconds {
            Some(s) if s > MAX_DURATION_SECONDS => {
                Err(anyhow::anyhow!("duration {}s exceeds the maximum of {}s", s, MAX_DURATION_SECONDS))
            }
            _ => Ok(()),
        }
    }
}

/// Configuration manager over a directory holding `guilds.yaml` and `engine.yaml`
#[derive(Clone)]
pub struct ConfigurationManager {
    config_dir: PathBuf,

    /// Per-guild profiles, read on the hot path without any async lock
    guild_profiles: Arc<DashMap<GuildId, Arc<GuildModerationConfig>>>,
    default_profile: Arc<StdRwLock<Option<Arc<GuildModerationConfig>>>>,

    engine_settings: Arc<RwLock<EngineSettings>>,

    /// File watchers for hot-reloading
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,

    change_notifier: broadcast::Sender<ConfigChangeEvent>,
    validator: Arc<ConfigValidator>,
    last_reload: Arc<RwLock<std::time::Instant>>,
}

impl ConfigurationManager {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            guild_profiles: Arc::new(DashMap::new()),
            default_profile: Arc::new(StdRwLock::new(None)),
            engine_settings: Arc::new(RwLock::new(EngineSettings::default())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            change_notifier: tx,
            validator: Arc::new(ConfigValidator::new()),
            last_reload: Arc::new(RwLock::new(std::time::Instant::now())),
        }
    }

    /// Load configuration (creating defaults where missing) and start watching for changes
    pub async fn initialize(&self) -> Result<()> {
        self.load().await?;
        self.setup_file_watcher().await?;
        info!("Configuration manager initialized from {}", self.config_dir.display());
        Ok(())
    }

    /// Load configuration without starting the file watcher
    pub async fn load(&self) -> Result<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).await.with_context(|| {
                format!("Failed to create config directory: {}", self.config_dir.display())
            })?;
            info!("Created configuration directory: {}", self.config_dir.display());
        }

        let guilds_path = self.guilds_path();
        if !guilds_path.exists() {
            warn!("Guild config not found, creating default: {}", guilds_path.display());
            Self::write_yaml(&guilds_path, &default_guilds_file()).await?;
        }
        let guilds = Self::read_guilds_file(&guilds_path, &self.validator).await?;
        let count = Self::apply_guilds_file(&self.guild_profiles, &self.default_profile, guilds);
        info!("Loaded moderation configuration for {} guild(s)", count);

        let engine_path = self.engine_path();
        if !engine_path.exists() {
            warn!("Engine config not found, creating default: {}", engine_path.display());
            Self::write_yaml(&engine_path, &EngineSettings::default()).await?;
        }
        let content = fs::read_to_string(&engine_path)
            .await
            .with_context(|| format!("Failed to read engine config: {}", engine_path.display()))?;
        let settings: EngineSettings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse engine config: {}", engine_path.display()))?;
        self.validator.validate_engine(&settings)?;
        *self.engine_settings.write().await = settings;

        let _ = self
            .change_notifier
            .send(ConfigChangeEvent::GuildsReloaded { guilds: count });
        Ok(())
    }

    pub fn guilds_path(&self) -> PathBuf {
        self.config_dir.join("guilds.yaml")
    }

    pub fn engine_path(&self) -> PathBuf {
        self.config_dir.join("engine.yaml")
    }

    pub async fn get_engine_settings(&self) -> EngineSettings {
        self.engine_settings.read().await.clone()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    /// Re-read `guilds.yaml`. A file that fails validation leaves the current
    /// configuration in place.
    pub async fn reload_guilds(&self) -> Result<usize> {
        Self::reload_guilds_inner(
            &self.guilds_path(),
            &self.guild_profiles,
            &self.default_profile,
            &self.validator,
        )
        .await
    }

    async fn reload_guilds_inner(
        path: &Path,
        profiles: &DashMap<GuildId, Arc<GuildModerationConfig>>,
        default_profile: &StdRwLock<Option<Arc<GuildModerationConfig>>>,
        validator: &ConfigValidator,
    ) -> Result<usize> {
        let guilds = Self::read_guilds_file(path, validator).await?;
        let count = Self::apply_guilds_file(profiles, default_profile, guilds);
        debug!("Reloaded guild configuration from {}", path.display());
        Ok(count)
    }

    async fn read_guilds_file(path: &Path, validator: &ConfigValidator) -> Result<GuildsFile> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read guild config: {}", path.display()))?;
        let file: GuildsFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse guild config: {}", path.display()))?;
        validator.validate_guilds_file(&file)?;
        Ok(file)
    }

    fn apply_guilds_file(
        profiles: &DashMap<GuildId, Arc<GuildModerationConfig>>,
        default_profile: &StdRwLock<Option<Arc<GuildModerationConfig>>>,
        file: GuildsFile,
    ) -> usize {
        profiles.retain(|guild_id, _| file.guilds.contains_key(guild_id));
        for (guild_id, config) in file.guilds {
            profiles.insert(guild_id, Arc::new(config));
        }
        let mut default_guard = default_profile.write().unwrap_or_else(|e| e.into_inner());
        *default_guard = file.defaults.map(Arc::new);
        profiles.len()
    }

    async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let yaml = serde_yaml::to_string(value).context("Failed to serialize default config")?;
        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write default config to: {}", path.display()))?;
        info!("Created default configuration: {}", path.display());
        Ok(())
    }

    /// Watch the config directory and hot-reload `guilds.yaml` on change
    async fn setup_file_watcher(&self) -> Result<()> {
        let config_dir = self.config_dir.clone();
        let guilds_path = self.guilds_path();
        let change_notifier = self.change_notifier.clone();
        let profiles = self.guild_profiles.clone();
        let default_profile = self.default_profile.clone();
        let validator = self.validator.clone();
        let last_reload = self.last_reload.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watch event: {}", e);
                }
            }
        })?;
        watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;

        // Dropping the watcher stops it
        self.watchers.write().await.push(watcher);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                // Debounce rapid file changes
                {
                    let now = std::time::Instant::now();
                    let last = *last_reload.read().await;
                    if now.duration_since(last) < Duration::from_millis(500) {
                        continue;
                    }
                    *last_reload.write().await = now;
                }

                for path in event.paths {
                    match path.file_name().and_then(|n| n.to_str()) {
                        Some("guilds.yaml") => {
                            info!("Guild configuration changed, reloading...");
                            match Self::reload_guilds_inner(&guilds_path, &profiles, &default_profile, &validator).await {
                                Ok(guilds) => {
                                    let _ = change_notifier.send(ConfigChangeEvent::GuildsReloaded { guilds });
                                }
                                Err(e) => {
                                    error!("Failed to reload guild config, keeping previous: {:#}", e);
                                    let _ = change_notifier.send(ConfigChangeEvent::ValidationError {
                                        file: "guilds.yaml".to_string(),
                                        error: e.to_string(),
                                    });
                                }
                            }
                        }
                        Some("engine.yaml") => {
                            warn!("engine.yaml changed; engine settings apply on restart");
                        }
                        Some(other) => debug!("Ignoring change to non-config file: {}", other),
                        None => {}
                    }
                }
            }
        });

        info!("File watcher setup for hot-reloading");
        Ok(())
    }
}

impl GuildConfigProvider for ConfigurationManager {
    fn guild_config(&self, guild_id: GuildId) -> Option<Arc<GuildModerationConfig>> {
        if let Some(config) = self.guild_profiles.get(&guild_id) {
            return Some(config.value().clone());
        }
        self.default_profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn default_true() -> bool {
    true
}

/// Default profile written on first start
pub fn default_guild_config() -> GuildModerationConfig {
    let rule = |threshold, interval_seconds, punishment, duration_seconds| ThresholdRule {
        threshold,
        interval_seconds,
        punishment,
        duration_seconds,
    };

    let mut spam = HashMap::new();
    spam.insert(SpamCategory::Message, rule(8, 5, PunishmentType::VoiceMute, Some(600)));
    spam.insert(SpamCategory::LongMessage, rule(3, 30, PunishmentType::VoiceMute, Some(600)));
    spam.insert(SpamCategory::Link, rule(5, 30, PunishmentType::VoiceMute, Some(900)));
    spam.insert(SpamCategory::Image, rule(5, 30, PunishmentType::VoiceMute, Some(600)));
    spam.insert(SpamCategory::Mention, rule(5, 10, PunishmentType::Kick, None));

    let mut raid = HashMap::new();
    raid.insert(RaidCategory::Join, rule(15, 60, PunishmentType::Kick, None));
    raid.insert(RaidCategory::RapidJoin, rule(5, 10, PunishmentType::Ban, Some(3600)));

    let mut escalation = HashMap::new();
    escalation.insert(PunishmentType::VoiceMute, EscalationTier { limit: 1, duration_seconds: Some(600) });
    escalation.insert(PunishmentType::Kick, EscalationTier { limit: 3, duration_seconds: None });
    escalation.insert(PunishmentType::Ban, EscalationTier { limit: 5, duration_seconds: Some(86_400) });

    GuildModerationConfig {
        spam,
        raid,
        escalation,
        phrases: Vec::new(),
        messages: MessageSettings::default(),
        mute_role_id: None,
        exempt_users: Vec::new(),
    }
}

fn default_guilds_file() -> GuildsFile {
    GuildsFile {
        defaults: Some(default_guild_config()),
        guilds: HashMap::new(),
    }
}
