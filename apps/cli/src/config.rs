//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/vaultpush/config.toml`
//! - Windows: `%APPDATA%/vaultpush/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vaultpush_protocol::MIB;
use vaultpush_transfer::PartPlanner;
use vaultpush_upload::RetryConfig;

/// vaultpush configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding local vaults.
    #[serde(default = "default_vault_root")]
    pub vault_root: String,

    /// Vault used when a command does not name one.
    #[serde(default = "default_vault")]
    pub default_vault: String,

    /// Attempts per part, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Backoff cap, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Archive description used when `--description` is not given.
    #[serde(default)]
    pub description: String,

    /// Smallest part size the planner starts from, in MiB.
    #[serde(default = "default_baseline_part_size_mib")]
    pub baseline_part_size_mib: u64,
}

fn default_vault_root() -> String {
    "~/.local/share/vaultpush/vaults".into()
}

fn default_vault() -> String {
    "default".into()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_baseline_part_size_mib() -> u64 {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_root: default_vault_root(),
            default_vault: default_vault(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            description: String::new(),
            baseline_part_size_mib: default_baseline_part_size_mib(),
        }
    }
}

impl Config {
    /// Loads configuration from the default path, creating it if missing.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Loads configuration from `path`, creating a default file if missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Vault root with a leading `~` expanded.
    pub fn vault_root_path(&self) -> PathBuf {
        expand_home(&self.vault_root)
    }

    /// Retry settings, with an optional attempt count override.
    pub fn retry(&self, attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts.unwrap_or(self.retry_attempts),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn planner(&self) -> anyhow::Result<PartPlanner> {
        let baseline = self
            .baseline_part_size_mib
            .checked_mul(MIB)
            .ok_or_else(|| anyhow::anyhow!("baseline part size is too large"))?;
        Ok(PartPlanner::new(baseline)?)
    }
}

/// Expands a leading `~` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    let home = || {
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .ok()
    };
    if path == "~" {
        if let Some(home) = home() {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = home()
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("vaultpush").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("vaultpush")
            .join("config.toml"))
    }
}
