use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

// ── Secrets ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Encrypt stored login parameters and session tokens (default: true)
    #[serde(default = "default_true")]
    pub encrypt: bool,
    /// Process-wide encryption secret. When set, the data key is derived
    /// from it; when absent, a key file is generated in the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            encrypt: true,
            secret: None,
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-job polls (default: 5)
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Seconds between reconciliation sweeps (default: 600)
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,
    /// Maximum executions of one job before it is parked as failed (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff, milliseconds (default: 5000)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Deadline for one driver update call, seconds (default: 30)
    #[serde(default = "default_update_timeout_secs")]
    pub update_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
            reconcile_secs: default_reconcile_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            update_timeout_secs: default_update_timeout_secs(),
        }
    }
}

fn default_poll_secs() -> u64 {
    5
}

fn default_reconcile_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    5000
}

fn default_update_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

// ── Identity providers ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub cas: CasProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasProviderConfig {
    /// CAS server base, e.g. "https://cas.campus.edu/cas"
    #[serde(default = "default_cas_base_url")]
    pub base_url: String,
    /// Default portal the provider validates sessions against
    #[serde(default = "default_cas_portal_url")]
    pub portal_url: String,
    /// Per-request timeout, seconds (default: 15)
    #[serde(default = "default_cas_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CasProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_cas_base_url(),
            portal_url: default_cas_portal_url(),
            timeout_secs: default_cas_timeout_secs(),
        }
    }
}

fn default_cas_base_url() -> String {
    "https://cas.campus.example/cas".into()
}

fn default_cas_portal_url() -> String {
    "https://portal.campus.example/dcp/".into()
}

fn default_cas_timeout_secs() -> u64 {
    15
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Load the config from `<workspace>/config.toml`, creating a default
    /// file on first run.
    pub fn load_or_init() -> Result<Self> {
        let workspace_dir = default_workspace_dir()?;
        Self::load_from_workspace(&workspace_dir)
    }

    /// Load the config rooted at an explicit workspace directory.
    pub fn load_from_workspace(workspace_dir: &Path) -> Result<Self> {
        fs::create_dir_all(workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace directory: {}",
                workspace_dir.display()
            )
        })?;

        let config_path = workspace_dir.join("config.toml");
        let mut config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
            toml::from_str::<Self>(&raw)
                .with_context(|| format!("Failed to parse config: {}", config_path.display()))?
        } else {
            let config = Self::default();
            let raw = toml::to_string_pretty(&config)
                .context("Failed to serialize default config")?;
            fs::write(&config_path, raw)
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
            config
        };

        config.workspace_dir = workspace_dir.to_path_buf();
        config.config_path = config_path;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.max_attempts == 0 {
            anyhow::bail!("scheduler.max_attempts must be at least 1");
        }
        if self.scheduler.backoff_base_ms == 0 {
            anyhow::bail!("scheduler.backoff_base_ms must be positive");
        }
        Ok(())
    }

    /// Directory holding the identity/service document database.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_dir.join("state")
    }

    /// Directory holding the durable job queue database.
    pub fn queue_dir(&self) -> PathBuf {
        self.workspace_dir.join("scheduler")
    }
}

fn default_workspace_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not resolve home directory")?;
    Ok(home.join(".campanile"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_from_workspace_writes_default_config() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_from_workspace(tmp.path()).unwrap();

        assert!(config.config_path.exists());
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.scheduler.backoff_base_ms, 5000);
        assert!(config.secrets.encrypt);
    }

    #[test]
    fn load_from_workspace_reads_existing_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[scheduler]\nmax_attempts = 3\npoll_secs = 1\n",
        )
        .unwrap();

        let config = Config::load_from_workspace(tmp.path()).unwrap();
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.poll_secs, 1);
        // untouched sections fall back to defaults
        assert_eq!(config.scheduler.reconcile_secs, 600);
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[scheduler]\nmax_attempts = 0\n",
        )
        .unwrap();

        let err = Config::load_from_workspace(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }
}
