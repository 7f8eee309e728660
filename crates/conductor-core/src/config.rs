//! Configuration resolution for Conductor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/conductor/settings.json)
//! 3. Project config (.conductor/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Name of the per-project state directory.
pub const STATE_DIR_NAME: &str = ".conductor";

/// Complete Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Admission-control limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_agents: usize,
    /// Aggregate resident memory of running agents (MB).
    pub max_memory_mb: u64,
    /// Disk usage of the workspace area (MB).
    pub max_disk_mb: u64,
    /// Load average ceiling as a multiple of the core count.
    pub load_factor: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_agents: 5,
            max_memory_mb: 8 * 1024,
            max_disk_mb: 10 * 1024,
            load_factor: 1.5,
        }
    }
}

/// What the interrupt controller does with a stuck or bloated agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Restart,
    Kill,
    Debug,
    #[default]
    Continue,
}

impl RecoveryAction {
    pub const ALL: [Self; 4] = [Self::Continue, Self::Restart, Self::Kill, Self::Debug];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Kill => "kill",
            Self::Debug => "debug",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "kill" => Ok(Self::Kill),
            "debug" => Ok(Self::Debug),
            "continue" => Ok(Self::Continue),
            other => Err(Error::Config(format!("Unknown recovery action: {other}"))),
        }
    }
}

/// Health monitoring and interrupt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Seconds without observed activity before an agent counts as stuck.
    pub stuck_threshold_secs: u64,
    pub memory_threshold_mb: u64,
    /// Bounded wait for an operator decision.
    pub decision_timeout_secs: u64,
    /// Applied when no operator answers in time.
    pub default_action: RecoveryAction,
    /// Time between SIGTERM and SIGKILL on restart.
    pub grace_period_secs: u64,
    pub detect_conflicts: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stuck_threshold_secs: 600,
            memory_threshold_mb: 1000,
            decision_timeout_secs: 30,
            default_action: RecoveryAction::Continue,
            grace_period_secs: 5,
            detect_conflicts: true,
        }
    }
}

impl MonitorConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub const fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub const fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Spawn pacing and admission retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Lower bound of the random delay between launches in one phase.
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Pause between phases so VCS state can settle.
    pub phase_pause_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_jitter_cap_ms: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: 1000,
            jitter_max_ms: 3000,
            phase_pause_ms: 2000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 5000,
            retry_jitter_cap_ms: 2000,
        }
    }
}

impl SpawnConfig {
    pub const fn phase_pause(&self) -> Duration {
        Duration::from_millis(self.phase_pause_ms)
    }
}

/// External worker tool invocation.
///
/// `{prompt}` and `{workdir}` in argument strings are substituted per launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Program for synchronous direct execution; falls back to `program`.
    pub direct_program: Option<String>,
    pub direct_args: Option<Vec<String>>,
    pub env: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "{prompt}".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            direct_program: None,
            direct_args: None,
            env: HashMap::new(),
        }
    }
}

/// Cleanup step settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub step_timeout_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 30,
        }
    }
}

impl CleanupConfig {
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Filesystem locations. Relative paths resolve against the project root.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: Option<PathBuf>,
    pub workspace_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Directory holding the session document, logs and archives.
    pub fn state_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.state_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => project_dir.join(p),
            None => project_dir.join(STATE_DIR_NAME),
        }
    }

    /// Directory under which isolated workspaces are created.
    pub fn workspace_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.workspace_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => project_dir.join(p),
            None => self.state_dir(project_dir).join("workspaces"),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global, &global_path)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(STATE_DIR_NAME).join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project, &project_path)?;
        }
    }

    apply_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("conductor").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay the keys present in a config file onto `base`.
///
/// Objects merge key by key, so a file setting one field of a section keeps
/// the other fields from lower layers. Worker `env` maps are additive.
fn merge_config(base: &mut Config, overlay: Value, path: &Path) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_values(&mut merged, overlay);
    *base = serde_json::from_value(merged).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Merged config file");
    Ok(())
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `CONDUCTOR_*` overrides read through `lookup`.
///
/// Values that do not parse are ignored with a warning.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = parsed(&lookup, "CONDUCTOR_MAX_AGENTS") {
        config.limits.max_agents = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_MAX_MEMORY_MB") {
        config.limits.max_memory_mb = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_POLL_INTERVAL_SECS") {
        config.monitor.poll_interval_secs = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_STUCK_THRESHOLD_SECS") {
        config.monitor.stuck_threshold_secs = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_DECISION_TIMEOUT_SECS") {
        config.monitor.decision_timeout_secs = n;
    }
    if let Some(action) = parsed(&lookup, "CONDUCTOR_DEFAULT_ACTION") {
        config.monitor.default_action = action;
    }
    if let Some(program) = parsed(&lookup, "CONDUCTOR_WORKER_PROGRAM") {
        config.worker.program = program;
    }
    if let Some(dir) = parsed::<PathBuf>(&lookup, "CONDUCTOR_STATE_DIR") {
        config.paths.state_dir = Some(dir);
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    if let Ok(parsed) = value.parse() {
        debug!(key, "Config override from environment");
        Some(parsed)
    } else {
        warn!(key, %value, "Ignoring unparsable config override");
        None
    }
}
