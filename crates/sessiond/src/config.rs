//! Daemon settings read from `config.toml`.
//!
//! Every table and key is optional. `SHELLPROXY_*` environment variables
//! are applied on top of the file, then [`Config::validate`] checks the
//! result before anything starts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hostkey::Algorithm;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("shell not found: {0}")]
    InvalidShellPath(String),

    #[error("grace_timeout_ms ({grace}) must be below leak_timeout_ms ({leak})")]
    InvalidGraceTimeout { grace: u64, leak: u64 },

    #[error("container user_label must not be empty")]
    EmptyContainerLabel,

    #[error("rsa_bits must be at least 2048, got {0}")]
    InvalidRsaBits(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the session daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session execution settings.
    pub session: SessionConfig,

    /// Host identity keys.
    pub host_keys: HostKeysConfig,

    /// Containerized exec settings.
    pub container: ContainerConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
}

/// Session execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used to run commands for local sessions.
    pub shell: String,

    /// How long an abandoned read or write may keep running after the
    /// session is canceled, in milliseconds.
    pub grace_timeout_ms: u64,

    /// How long the leak detector waits for session tasks, in milliseconds.
    pub leak_timeout_ms: u64,
}

/// Host key configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostKeysConfig {
    /// Base path; one file per algorithm is kept at `<path>_<algorithm>`.
    pub path: PathBuf,

    /// Algorithms to load. Empty means RSA and Ed25519.
    pub algorithms: Vec<Algorithm>,

    /// Modulus size for newly generated RSA keys.
    pub rsa_bits: usize,
}

/// Containerized exec configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container label whose value must equal the connecting user.
    pub user_label: String,

    /// Container label holding the user's authorized keys, one per line.
    pub key_label: String,

    /// Shell run inside the container.
    pub shell: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            grace_timeout_ms: 500,
            leak_timeout_ms: 1000,
        }
    }
}

impl Default for HostKeysConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("host_key"),
            algorithms: Vec::new(),
            rsa_bits: hostkey::DEFAULT_RSA_BITS,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            user_label: "shellproxy.user".to_string(),
            key_label: "shellproxy.authorized_keys".to_string(),
            shell: "/bin/sh".to_string(),
        }
    }
}

impl SessionConfig {
    /// Grace period as a `Duration`.
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    /// Leak detector timeout as a `Duration`.
    pub fn leak_timeout(&self) -> Duration {
        Duration::from_millis(self.leak_timeout_ms)
    }
}

/// `shellproxy/config.toml` under the platform config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellproxy")
        .join("config.toml")
}

/// Where generated host keys live unless `[host_keys] path` says otherwise.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellproxy")
}

/// Returns the default shell for the current user.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Overlays non-empty `SHELLPROXY_LOG_LEVEL`, `SHELLPROXY_SHELL` and
    /// `SHELLPROXY_HOST_KEY_PATH` onto the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("SHELLPROXY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("SHELLPROXY_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.session.shell = shell;
        }

        if let Some(path) = non_empty_env("SHELLPROXY_HOST_KEY_PATH") {
            tracing::info!("Overriding host key path from environment: {}", path);
            self.host_keys.path = PathBuf::from(path);
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        if self.session.grace_timeout_ms >= self.session.leak_timeout_ms {
            return Err(ConfigError::InvalidGraceTimeout {
                grace: self.session.grace_timeout_ms,
                leak: self.session.leak_timeout_ms,
            });
        }

        if self.container.user_label.trim().is_empty() {
            return Err(ConfigError::EmptyContainerLabel);
        }

        if self.host_keys.rsa_bits < 2048 {
            return Err(ConfigError::InvalidRsaBits(self.host_keys.rsa_bits));
        }

        Ok(())
    }

    /// Reads the daemon configuration at `path`.
    ///
    /// A missing file is not an error: the daemon runs on defaults until
    /// `config --write` creates one.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents).with_context(|| format!("bad config in {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parses `[daemon]`, `[session]`, `[host_keys]` and `[container]`
    /// tables; absent tables and keys take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Writes the configuration to `path`, creating missing directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("cannot write {}", path.display()))?;
        tracing::info!(path = %path.display(), "config written");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("cannot serialize config")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("SHELLPROXY_LOG_LEVEL");
        std::env::remove_var("SHELLPROXY_SHELL");
        std::env::remove_var("SHELLPROXY_HOST_KEY_PATH");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.session.grace_timeout(), Duration::from_millis(500));
        assert_eq!(config.session.leak_timeout(), Duration::from_secs(1));
        assert!(config.host_keys.algorithms.is_empty());
        assert_eq!(config.host_keys.rsa_bits, 4096);
        assert_eq!(config.container.user_label, "shellproxy.user");
        assert_eq!(config.container.key_label, "shellproxy.authorized_keys");
    }

    #[test]
    fn test_default_paths_share_app_dir() {
        let host_key = HostKeysConfig::default().path;
        assert_eq!(host_key.file_name().unwrap(), "host_key");
        assert_eq!(host_key.parent().unwrap().file_name().unwrap(), "shellproxy");

        let config = default_config_path();
        assert_eq!(config.file_name().unwrap(), "config.toml");
        assert_eq!(config.parent().unwrap().file_name().unwrap(), "shellproxy");
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
grace_timeout_ms = 250
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.grace_timeout_ms, 250);
        assert_eq!(config.session.leak_timeout_ms, 1000);
        assert_eq!(config.container, ContainerConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
log_dir = "/var/log/shellproxy"

[session]
shell = "/bin/bash"
grace_timeout_ms = 100
leak_timeout_ms = 2000

[host_keys]
path = "/etc/shellproxy/host_key"
algorithms = ["ed25519"]
rsa_bits = 3072

[container]
user_label = "owner"
key_label = "owner.keys"
shell = "/bin/ash"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.daemon.log_dir,
            Some(PathBuf::from("/var/log/shellproxy"))
        );
        assert_eq!(config.session.shell, "/bin/bash");
        assert_eq!(config.session.grace_timeout_ms, 100);
        assert_eq!(config.session.leak_timeout_ms, 2000);
        assert_eq!(
            config.host_keys.path,
            PathBuf::from("/etc/shellproxy/host_key")
        );
        assert_eq!(config.host_keys.algorithms, vec![Algorithm::Ed25519]);
        assert_eq!(config.host_keys.rsa_bits, 3072);
        assert_eq!(config.container.user_label, "owner");
        assert_eq!(config.container.key_label, "owner.keys");
        assert_eq!(config.container.shell, "/bin/ash");
    }

    #[test]
    fn test_from_toml_unknown_algorithm() {
        let toml = r#"
[host_keys]
algorithms = ["dsa"]
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
grace_timeout_ms = "soon"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml_sections() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[host_keys]"));
        assert!(toml.contains("[container]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_dir = Some(PathBuf::from("/tmp/logs"));
        original.host_keys.algorithms = vec![Algorithm::Rsa, Algorithm::Ed25519];
        original.session.leak_timeout_ms = 5000;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_written_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc").join("shellproxy.toml");

        let mut config = Config::default();
        config.container.user_label = "team".to_string();
        config.container.key_label = "team.keys".to_string();
        config.host_keys.algorithms = vec![Algorithm::Ed25519];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_unparsable_file_names_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[session\ngrace_timeout_ms = 1").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("bad config in"), "error: {err}");
        assert!(err.contains("config.toml"), "error: {err}");
        assert!(err.contains("Invalid TOML"), "error: {err}");
    }

    #[test]
    fn test_unreadable_path_is_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path()).unwrap_err().to_string();
        assert!(err.contains("cannot read"), "error: {err}");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("SHELLPROXY_LOG_LEVEL", "debug");
        std::env::set_var("SHELLPROXY_SHELL", "/bin/dash");
        std::env::set_var("SHELLPROXY_HOST_KEY_PATH", "/srv/keys/host");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.shell, "/bin/dash");
        assert_eq!(config.host_keys.path, PathBuf::from("/srv/keys/host"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("SHELLPROXY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "info");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_shell_in_path() {
        let mut config = valid_config();
        config.session.shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shell_missing() {
        let mut config = valid_config();
        config.session.shell = "/nonexistent/shell/binary".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/shell/binary".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_grace_must_be_below_leak_timeout() {
        let mut config = valid_config();
        config.session.grace_timeout_ms = 1000;
        config.session.leak_timeout_ms = 1000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidGraceTimeout {
                grace: 1000,
                leak: 1000
            })
        );
    }

    #[test]
    fn test_validate_empty_container_label() {
        let mut config = valid_config();
        config.container.user_label = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyContainerLabel));
    }

    #[test]
    fn test_validate_rsa_bits() {
        let mut config = valid_config();
        config.host_keys.rsa_bits = 1024;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRsaBits(1024)));
    }
}
