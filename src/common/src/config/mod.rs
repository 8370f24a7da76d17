use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "runpruner.toml";

/// Environment prefix; nested keys are separated by a double underscore,
/// e.g. `RUNPRUNER__LOCK__TIMEOUT=2m`.
pub const ENV_PREFIX: &str = "RUNPRUNER__";

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PrunerConfig {
    /// Identity written into processing locks. Falls back to `$HOSTNAME`
    /// (the pod name when running in a cluster) and then to a random UUID.
    ///
    /// Env: RUNPRUNER__PRUNER__INSTANCE_ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Policy document loaded at startup.
    ///
    /// Env: RUNPRUNER__PRUNER__POLICY_PATH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<PathBuf>,

    /// Log deletions instead of executing them.
    ///
    /// Env: RUNPRUNER__PRUNER__DRY_RUN
    #[serde(default)]
    pub dry_run: bool,
}

impl PrunerConfig {
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| format!("runpruner-{}", uuid::Uuid::new_v4()))
    }
}

/// Advisory processing-lock settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// A lock older than this is considered abandoned by a crashed holder.
    ///
    /// Env: RUNPRUNER__LOCK__TIMEOUT
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub timeout: Duration,
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
        }
    }
}

/// Deletion de-duplication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Repeat observations of the same deletion inside this window are
    /// reported as duplicates.
    ///
    /// Env: RUNPRUNER__DEDUP__WINDOW
    #[serde(with = "humantime_serde", default = "default_dedup_window")]
    pub window: Duration,

    /// Entries older than this are evicted by the background sweep.
    ///
    /// Env: RUNPRUNER__DEDUP__RETENTION
    #[serde(with = "humantime_serde", default = "default_dedup_retention")]
    pub retention: Duration,

    /// How often the background sweep runs.
    ///
    /// Env: RUNPRUNER__DEDUP__SWEEP_INTERVAL
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(60)
}

fn default_dedup_retention() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: default_dedup_window(),
            retention: default_dedup_retention(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    #[serde(default)]
    pub pruner: PrunerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Sanity checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.lock.timeout.is_zero() {
            return Err("lock.timeout must be positive".to_string());
        }
        if self.dedup.window.is_zero() {
            return Err("dedup.window must be positive".to_string());
        }
        if self.dedup.retention < self.dedup.window {
            return Err(format!(
                "dedup.retention ({:?}) must not be shorter than dedup.window ({:?})",
                self.dedup.retention, self.dedup.window,
            ));
        }
        if self.dedup.sweep_interval.is_zero() {
            return Err("dedup.sweep_interval must be positive".to_string());
        }
        Ok(())
    }
}
