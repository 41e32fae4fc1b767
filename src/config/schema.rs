//! Configuration schema definitions.
//!
//! Every field is optional so that each layer only overrides what it sets:
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [proxy]
//! port = 9000
//! cert_dir = ".mitm_certs"
//! addons = ["game_protocol"]
//! passthrough_hosts = ["localhost", "127.0.0.1"]
//! tls_ports = [443]
//!
//! [automation]
//! command_queue = 16
//! webdriver_url = "http://127.0.0.1:9515"
//! browser = "chrome"
//! use_proxy = true
//!
//! [metrics]
//! listen = "127.0.0.1:9898"
//! ```
//!
//! Resolution into runtime settings validates values and fills in defaults.

use super::error::ConfigError;
use crate::automation::{Browser, WebDriverOptions, WorkerSettings};
use crate::proxy::{Addon, AddonKind, EngineFactory, ProxyConfig};
use crate::proxy::websocket::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Accepted `general.log_level` values.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Intercepting proxy settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Browser automation settings.
    #[serde(default)]
    pub automation: AutomationSection,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsSection,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Values set in `other` override; lists replace rather than append.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.automation.merge(other.automation);
        self.metrics.merge(other.metrics);
    }

    /// Resolve the proxy section into a validated [`ProxyConfig`].
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let p = &self.proxy;
        let defaults = ProxyConfig::default();

        let max_frame_len = positive("proxy.max_frame_len", p.max_frame_len.unwrap_or(DEFAULT_MAX_PAYLOAD))?;
        let addons = match &p.addons {
            Some(kinds) if kinds.is_empty() => {
                return Err(invalid("proxy.addons", "at least one addon is required"));
            }
            Some(kinds) => kinds.iter().map(|k| Addon::from_kind(*k, max_frame_len)).collect(),
            None => vec![Addon::from_kind(AddonKind::GameProtocol, max_frame_len)],
        };

        Ok(ProxyConfig {
            listen_host: p.listen_host.unwrap_or(defaults.listen_host),
            port: p.port.unwrap_or(defaults.port),
            cert_dir: p.cert_dir.clone().unwrap_or(defaults.cert_dir),
            engines: EngineFactory::new(addons),
            inbound_capacity: positive(
                "proxy.inbound_queue",
                p.inbound_queue.unwrap_or(defaults.inbound_capacity),
            )?,
            outbound_capacity: positive(
                "proxy.outbound_queue",
                p.outbound_queue.unwrap_or(defaults.outbound_capacity),
            )?,
            stop_grace: p
                .stop_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_grace),
            passthrough_hosts: p
                .passthrough_hosts
                .clone()
                .unwrap_or(defaults.passthrough_hosts),
            tls_ports: p.tls_ports.clone().unwrap_or(defaults.tls_ports),
        })
    }

    /// Resolve the automation section.
    ///
    /// With `use_proxy`, the browser is pointed at the configured proxy
    /// listen address.
    pub fn automation_settings(&self) -> Result<AutomationSettings, ConfigError> {
        let a = &self.automation;
        let worker_defaults = WorkerSettings::default();
        let driver_defaults = WebDriverOptions::default();

        let health_check_timeout = match a.health_check_timeout_ms {
            Some(0) => return Err(invalid("automation.health_check_timeout_ms", "must be positive")),
            Some(ms) => Duration::from_millis(ms),
            None => worker_defaults.health_check_timeout,
        };

        let url = a.webdriver_url.clone().unwrap_or(driver_defaults.url);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid(
                "automation.webdriver_url",
                &format!("'{}' is not an http(s) URL", url),
            ));
        }

        let proxy = if a.use_proxy.unwrap_or(false) {
            let proxy = self.proxy_config()?;
            Some(SocketAddr::new(proxy.listen_host, proxy.port).to_string())
        } else {
            None
        };

        Ok(AutomationSettings {
            worker: WorkerSettings {
                queue_capacity: positive(
                    "automation.command_queue",
                    a.command_queue.unwrap_or(worker_defaults.queue_capacity),
                )?,
                health_check_timeout,
                screenshot_dir: a.screenshot_dir.clone().unwrap_or(worker_defaults.screenshot_dir),
            },
            webdriver: WebDriverOptions {
                url,
                browser: a.browser.unwrap_or(driver_defaults.browser),
                headless: a.headless.unwrap_or(driver_defaults.headless),
                proxy,
                wait_timeout: a
                    .wait_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(driver_defaults.wait_timeout),
            },
        })
    }

    /// Validated log level, if one is configured.
    pub fn log_level(&self) -> Result<Option<&str>, ConfigError> {
        match self.general.log_level.as_deref() {
            Some(level) if !LOG_LEVELS.contains(&level) => Err(invalid(
                "general.log_level",
                &format!("'{}' is not one of {}", level, LOG_LEVELS.join(", ")),
            )),
            other => Ok(other),
        }
    }
}

/// Resolved automation settings.
#[derive(Debug, Clone)]
pub struct AutomationSettings {
    pub worker: WorkerSettings,
    pub webdriver: WebDriverOptions,
}

/// General application settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        override_with(&mut self.log_level, other.log_level);
    }
}

/// `[proxy]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_host: Option<IpAddr>,

    /// Preferred listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Directory holding `ca.crt` and `ca.key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_dir: Option<PathBuf>,

    /// Protocol addons, applied in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<Vec<AddonKind>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_queue: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_queue: Option<usize>,

    /// Drain period for `stop()`, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_ms: Option<u64>,

    /// Hosts tunnelled without interception.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough_hosts: Option<Vec<String>>,

    /// CONNECT ports that are TLS-terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ports: Option<Vec<u16>>,

    /// Largest WebSocket payload decoded, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_len: Option<usize>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        override_with(&mut self.listen_host, other.listen_host);
        override_with(&mut self.port, other.port);
        override_with(&mut self.cert_dir, other.cert_dir);
        override_with(&mut self.addons, other.addons);
        override_with(&mut self.inbound_queue, other.inbound_queue);
        override_with(&mut self.outbound_queue, other.outbound_queue);
        override_with(&mut self.stop_grace_ms, other.stop_grace_ms);
        override_with(&mut self.passthrough_hosts, other.passthrough_hosts);
        override_with(&mut self.tls_ports, other.tls_ports);
        override_with(&mut self.max_frame_len, other.max_frame_len);
    }
}

/// `[automation]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationSection {
    /// Per-channel command queue capacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_queue: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_ms: Option<u64>,

    /// chromedriver/geckodriver endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdriver_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<Browser>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,

    /// Route the browser through the intercepting proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_proxy: Option<bool>,

    /// Where screenshots without an explicit path go.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_dir: Option<PathBuf>,

    /// Upper bound for `wait_for`, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
}

impl AutomationSection {
    fn merge(&mut self, other: AutomationSection) {
        override_with(&mut self.command_queue, other.command_queue);
        override_with(&mut self.health_check_timeout_ms, other.health_check_timeout_ms);
        override_with(&mut self.webdriver_url, other.webdriver_url);
        override_with(&mut self.browser, other.browser);
        override_with(&mut self.headless, other.headless);
        override_with(&mut self.use_proxy, other.use_proxy);
        override_with(&mut self.screenshot_dir, other.screenshot_dir);
        override_with(&mut self.wait_timeout_ms, other.wait_timeout_ms);
    }
}

/// `[metrics]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    /// Prometheus scrape address; no exporter when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
}

impl MetricsSection {
    fn merge(&mut self, other: MetricsSection) {
        override_with(&mut self.listen, other.listen);
    }
}

fn override_with<T>(current: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *current = other;
    }
}

fn positive(field: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        Err(invalid(field, "must be positive"))
    } else {
        Ok(value)
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let config = Config::default();
        let proxy = config.proxy_config().unwrap();
        assert_eq!(proxy.port, 9000);
        assert_eq!(proxy.cert_dir, PathBuf::from(".mitm_certs"));
        assert_eq!(proxy.tls_ports, vec![443]);
        assert_eq!(proxy.engines.addons(), &[Addon::game_protocol()]);

        let automation = config.automation_settings().unwrap();
        assert_eq!(automation.worker.queue_capacity, 16);
        assert!(automation.webdriver.proxy.is_none());
        assert!(config.log_level().unwrap().is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let config: Config = toml::from_str(
            r#"
            [general]
            log_level = "debug"

            [proxy]
            port = 9100
            addons = ["generic", "game_protocol"]
            max_frame_len = 1024
            stop_grace_ms = 500

            [automation]
            browser = "firefox"
            use_proxy = true

            [metrics]
            listen = "127.0.0.1:9898"
            "#,
        )
        .unwrap();

        let proxy = config.proxy_config().unwrap();
        assert_eq!(
            proxy.engines.addons(),
            &[Addon::Generic, Addon::GameProtocol { max_payload: 1024 }]
        );
        assert_eq!(proxy.stop_grace, Duration::from_millis(500));

        let automation = config.automation_settings().unwrap();
        assert_eq!(automation.webdriver.browser, Browser::Firefox);
        assert_eq!(automation.webdriver.proxy.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(config.metrics.listen, Some("127.0.0.1:9898".parse().unwrap()));
        assert_eq!(config.log_level().unwrap(), Some("debug"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Config>("[proxy]\nprot = 1\n").is_err());
    }

    #[test]
    fn test_merge_overrides_scalars_and_replaces_lists() {
        let mut base: Config = toml::from_str(
            "[proxy]\nport = 9000\ntls_ports = [443, 8443]\ninbound_queue = 8\n",
        )
        .unwrap();
        let overlay: Config = toml::from_str("[proxy]\nport = 9100\ntls_ports = [443]\n").unwrap();

        base.merge(overlay);
        assert_eq!(base.proxy.port, Some(9100));
        assert_eq!(base.proxy.tls_ports, Some(vec![443]));
        assert_eq!(base.proxy.inbound_queue, Some(8));
    }

    #[test]
    fn test_invalid_values() {
        let zero_queue: Config = toml::from_str("[proxy]\ninbound_queue = 0\n").unwrap();
        assert!(matches!(
            zero_queue.proxy_config(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "proxy.inbound_queue"
        ));

        let no_addons: Config = toml::from_str("[proxy]\naddons = []\n").unwrap();
        assert!(no_addons.proxy_config().is_err());

        let bad_url: Config = toml::from_str("[automation]\nwebdriver_url = \"localhost:9515\"\n").unwrap();
        assert!(bad_url.automation_settings().is_err());

        let bad_level: Config = toml::from_str("[general]\nlog_level = \"loud\"\n").unwrap();
        assert!(bad_level.log_level().is_err());
    }
}
