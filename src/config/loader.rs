//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/tankbot/config.toml`
//! 3. User config: `~/.config/tankbot/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. `TANKBOT_*` environment variables
//! 6. CLI flags (highest priority)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, LOG_LEVELS};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tankbot/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "tankbot";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Overrides the proxy's preferred port.
pub const ENV_PROXY_PORT: &str = "TANKBOT_PROXY_PORT";
/// Overrides the CA directory.
pub const ENV_CERT_DIR: &str = "TANKBOT_CERT_DIR";
/// Overrides the WebDriver endpoint.
pub const ENV_WEBDRIVER_URL: &str = "TANKBOT_WEBDRIVER_URL";
/// Overrides `general.log_level`.
pub const ENV_LOG_LEVEL: &str = "TANKBOT_LOG_LEVEL";

/// Lookup for environment overrides.
pub type EnvSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
    env: EnvSource,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths and the process environment.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Create a ConfigLoader with custom paths and no environment overrides
    /// (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
            env: Arc::new(|_| None),
        }
    }

    /// Replace the environment lookup.
    #[must_use]
    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    /// Path of the user configuration file.
    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file,
    /// invalid TOML, or an unparseable environment value is an error.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for path in [&self.system_path, &self.user_path] {
            match self.load_file(path)? {
                Some(file) => {
                    config.merge(file);
                    debug!("Loaded config from {:?}", path);
                }
                None => debug!("No config found at {:?}", path),
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(self.env_overrides()?);

        if let Some(args) = cli.proxy_args() {
            let mut flags = Config::default();
            flags.proxy.port = args.port;
            flags.proxy.cert_dir = args.cert_dir.clone();
            if !args.addons.is_empty() {
                flags.proxy.addons = Some(args.addons.clone());
            }
            config.merge(flags);
        }

        Ok(config)
    }

    /// Build a config layer from `TANKBOT_*` variables.
    fn env_overrides(&self) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(port) = (self.env)(ENV_PROXY_PORT) {
            let port = port.trim().parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                field: ENV_PROXY_PORT.to_string(),
                message: format!("'{}': {}", port, e),
            })?;
            config.proxy.port = Some(port);
        }
        if let Some(dir) = (self.env)(ENV_CERT_DIR) {
            config.proxy.cert_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = (self.env)(ENV_WEBDRIVER_URL) {
            config.automation.webdriver_url = Some(url);
        }
        if let Some(level) = (self.env)(ENV_LOG_LEVEL) {
            let level = level.trim().to_ascii_lowercase();
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: ENV_LOG_LEVEL.to_string(),
                    message: format!("'{}' is not one of {}", level, LOG_LEVELS.join(", ")),
                });
            }
            config.general.log_level = Some(level);
        }

        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &PathBuf) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.clone(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
