//! Configuration system for tankbot.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/tankbot/config.toml`
//! 3. User config: `~/.config/tankbot/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. `TANKBOT_*` environment variables
//! 6. CLI flags (highest priority)
//!
//! Missing system and user files are skipped, so tankbot runs with no
//! configuration at all.
//!
//! # Merge Behavior
//!
//! - **Scalars** (port, log_level, etc.) are **overridden**
//! - **Lists** (addons, tls_ports, passthrough_hosts) are **replaced**
//!
//! The merged [`Config`] resolves into the runtime settings of each
//! subsystem through [`Config::proxy_config`] and
//! [`Config::automation_settings`].

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, EnvSource};
pub use schema::{
    AutomationSection, AutomationSettings, Config, GeneralConfig, LOG_LEVELS, MetricsSection,
    ProxySection,
};
