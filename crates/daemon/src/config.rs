//! Daemon configuration

use cyberlab_common::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP listen address
    pub listen: String,

    /// Base directory that relative compose paths resolve against
    pub labs_root: PathBuf,

    /// Insert the stock lab catalog on startup
    pub seed_default_labs: bool,

    /// Container runtime configuration
    pub runtime: RuntimeConfig,

    /// Compose launcher configuration
    pub compose: ComposeConfig,

    /// Lifecycle controller configuration
    pub controller: ControllerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: cyberlab_common::default_store_path(),
            listen: "127.0.0.1:3000".to_string(),
            labs_root: PathBuf::from("labs"),
            seed_default_labs: true,
            runtime: RuntimeConfig::default(),
            compose: ComposeConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime CLI binary (docker or podman). Auto-detected when absent.
    pub binary: Option<String>,

    /// Upper bound for a single runtime CLI call
    pub command_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            command_timeout_secs: 30,
        }
    }
}

/// Compose launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Program to invoke
    pub program: String,

    /// Arguments placed before the compose verb (`["compose"]` for the plugin form)
    pub args: Vec<String>,

    /// Upper bound for `up`/`down`; unbounded when absent
    pub timeout_secs: Option<u64>,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            args: vec!["compose".to_string()],
            timeout_secs: Some(600),
        }
    }
}

/// Lifecycle controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Restart labs whose containers died
    pub auto_recovery: bool,

    /// Health sweep period
    pub sweep_interval_secs: u64,

    /// Pause between the stop and start halves of a restart
    pub restart_settle_ms: u64,

    /// Bound on stopping all labs during shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            auto_recovery: false,
            sweep_interval_secs: 30,
            restart_settle_ms: 2000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ControllerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment overrides (`AUTO_RECOVERY=true`)
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("AUTO_RECOVERY") {
            self.controller.auto_recovery = parse_flag(&value);
        }
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> cyberlab_common::Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!("listen address {:?} is not host:port", self.listen)));
        }
        if self.compose.program.trim().is_empty() {
            return Err(Error::InvalidConfig("compose.program is empty".to_string()));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("labs.db")
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:8000"

            [controller]
            auto_recovery = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:8000");
        assert!(config.controller.auto_recovery);
        assert_eq!(config.controller.sweep_interval_secs, 30);
        assert_eq!(config.compose.args, vec!["compose".to_string()]);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/config.toml");

        let mut config = DaemonConfig::default();
        config.controller.restart_settle_ms = 10;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.controller.restart_settle(), Duration::from_millis(10));

        let missing = DaemonConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(missing.listen, DaemonConfig::default().listen);
    }

    #[test]
    fn test_validate() {
        assert!(DaemonConfig::default().validate().is_ok());

        let mut config = DaemonConfig::default();
        config.listen = "localhost".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = DaemonConfig::default();
        config.compose.program = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
