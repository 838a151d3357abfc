//! Layered configuration: serialized defaults, then the TOML file, then
//! `HOSTGUARD_` environment variables (`__` separates nested keys, e.g.
//! `HOSTGUARD_WATCHDOG__POLL_INTERVAL_SECS=5`).
//!
//! The `control` section and the unlock cooldown only come from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// System-wide configuration file consulted when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostguard/config.toml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV_VAR: &str = "HOSTGUARD_CONFIG";

const ENV_PREFIX: &str = "HOSTGUARD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Directory holding the canonical snapshot, control state, markers.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Policy / allow-list files whose digests are verified before every
    /// reconciliation pass.
    #[serde(default)]
    pub policy_files: Vec<PathBuf>,

    #[serde(default)]
    pub resource: ResourceConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub unlock: UnlockConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub transaction: TransactionConfig,

    #[serde(default)]
    pub install: InstallConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_resource_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Set the filesystem immutability attribute.
    #[serde(default = "default_true")]
    pub immutable: bool,

    /// Permission bits enforced before locking.
    #[serde(default = "default_mode")]
    pub mode: u32,

    /// Stack a read-only bind mount over the resource.
    #[serde(default = "default_true")]
    pub bind_mount: bool,

    #[serde(default = "default_collapse_attempts")]
    pub collapse_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How often the watcher checks whether the mount identity changed.
    #[serde(default = "default_rearm_interval_secs")]
    pub rearm_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Units forming the primary management surface.
    #[serde(default = "default_surface_units")]
    pub units: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockConfig {
    #[serde(default = "default_unlock_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Editor command; falls back to `$VISUAL`, `$EDITOR`, then `vi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Delay imposed before a `disable` takes effect.
    #[serde(default = "default_control_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Phrase the operator must type to confirm a `disable`.
    #[serde(default = "default_confirmation")]
    pub confirmation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Transaction markers older than this are ignored.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,

    #[serde(default = "default_systemd_dir")]
    pub systemd_dir: PathBuf,

    #[serde(default = "default_hooks_dir")]
    pub hooks_dir: PathBuf,

    /// `OnUnitActiveSec=` of the scheduled reconciliation timer.
    #[serde(default = "default_timer_interval")]
    pub timer_interval: String,
}

fn default_true() -> bool {
    true
}
fn default_resource_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostguard")
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("/var/log/hostguard/audit.log")
}
fn default_mode() -> u32 {
    0o644
}
fn default_collapse_attempts() -> u32 {
    crate::DEFAULT_COLLAPSE_ATTEMPTS
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_rearm_interval_secs() -> u64 {
    5
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_surface_units() -> Vec<String> {
    vec![
        "hostguard-watch.service".to_string(),
        "hostguard-reconcile.timer".to_string(),
    ]
}
fn default_unlock_cooldown_secs() -> u64 {
    45
}
fn default_control_cooldown_secs() -> u64 {
    300
}
fn default_confirmation() -> String {
    "I accept losing the guard".to_string()
}
fn default_stale_after_secs() -> u64 {
    1800
}
fn default_bin_dir() -> PathBuf {
    PathBuf::from("/usr/local/bin")
}
fn default_systemd_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}
fn default_hooks_dir() -> PathBuf {
    PathBuf::from("/etc/pacman.d/hooks")
}
fn default_timer_interval() -> String {
    "5min".to_string()
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            path: default_resource_path(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            immutable: default_true(),
            mode: default_mode(),
            bind_mount: default_true(),
            collapse_attempts: default_collapse_attempts(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            debounce_ms: default_debounce_ms(),
            rearm_interval_secs: default_rearm_interval_secs(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            units: default_surface_units(),
        }
    }
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_unlock_cooldown_secs(),
            editor: None,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_control_cooldown_secs(),
            confirmation: default_confirmation(),
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
            systemd_dir: default_systemd_dir(),
            hooks_dir: default_hooks_dir(),
            timer_interval: default_timer_interval(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            resource: ResourceConfig::default(),
            state_dir: default_state_dir(),
            audit: AuditConfig::default(),
            protection: ProtectionConfig::default(),
            watcher: WatcherConfig::default(),
            watchdog: WatchdogConfig::default(),
            unlock: UnlockConfig::default(),
            control: ControlConfig::default(),
            transaction: TransactionConfig::default(),
            install: InstallConfig::default(),
            policy_files: Vec::new(),
        }
    }
}

impl GuardConfig {
    /// Config rooted in `dir`, used by tests and sandboxed setups.
    pub fn rooted_at(dir: &Path) -> Self {
        let mut config = Self::default();
        config.resource.path = dir.join("hosts");
        config.state_dir = dir.join("state");
        config.audit.path = dir.join("audit.log");
        config.install.bin_dir = dir.join("bin");
        config.install.systemd_dir = dir.join("systemd");
        config.install.hooks_dir = dir.join("hooks");
        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog.poll_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watcher.debounce_ms)
    }

    pub fn rearm_interval(&self) -> Duration {
        Duration::from_secs(self.watcher.rearm_interval_secs.max(1))
    }

    pub fn unlock_cooldown(&self) -> Duration {
        Duration::from_secs(self.unlock.cooldown_secs)
    }

    pub fn control_cooldown(&self) -> Duration {
        Duration::from_secs(self.control.cooldown_secs)
    }

    pub fn transaction_stale_after(&self) -> Duration {
        Duration::from_secs(self.transaction.stale_after_secs)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GuardError::Config(e.to_string()))
    }
}

/// Loads [`GuardConfig`] from its layered sources.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    allow_missing: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit file; it must exist.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Fall back to defaults when the requested file does not exist yet, as
    /// during `setup`.
    pub fn allow_missing(mut self) -> Self {
        self.allow_missing = true;
        self
    }

    pub fn load(&self) -> Result<GuardConfig> {
        let file = self.resolve_file()?;
        let from_file: GuardConfig = base_builder(file.as_deref())?
            .build()?
            .try_deserialize()?;
        let mut config: GuardConfig = base_builder(file.as_deref())?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        pin_friction_keys(&mut config, &from_file);
        Ok(config)
    }

    /// The file `setup` writes and the units point at, whether or not it
    /// exists yet.
    pub fn target_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Explicit path, then `$HOSTGUARD_CONFIG`, then the system file if
    /// present.
    fn resolve_file(&self) -> Result<Option<PathBuf>> {
        let requested = self
            .config_path
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
        match requested {
            Some(path) if path.exists() => Ok(Some(path)),
            Some(path) if self.allow_missing => {
                tracing::debug!("{} does not exist yet; using defaults", path.display());
                Ok(None)
            }
            Some(path) => Err(GuardError::Config(format!(
                "configuration file not found: {}",
                path.display()
            ))),
            None => {
                let system = PathBuf::from(DEFAULT_CONFIG_PATH);
                Ok(system.exists().then_some(system))
            }
        }
    }
}

fn base_builder(file: Option<&Path>) -> Result<ConfigBuilder<DefaultState>> {
    let defaults_json = serde_json::to_string(&GuardConfig::default())?;
    let mut builder =
        Config::builder().add_source(File::from_str(&defaults_json, FileFormat::Json));
    if let Some(path) = file {
        tracing::debug!("loading configuration from {}", path.display());
        builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
    }
    Ok(builder)
}

/// Restore the keys that slow down `control disable` and `unlock` to their
/// file values, discarding environment overrides.
fn pin_friction_keys(config: &mut GuardConfig, from_file: &GuardConfig) {
    if config.control != from_file.control {
        tracing::warn!("ignoring environment overrides of control settings");
        config.control = from_file.control.clone();
    }
    if config.unlock.cooldown_secs != from_file.unlock.cooldown_secs {
        tracing::warn!("ignoring environment override of unlock.cooldown_secs");
        config.unlock.cooldown_secs = from_file.unlock.cooldown_secs;
    }
}
