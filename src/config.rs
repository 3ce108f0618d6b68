use std::{fs, net::SocketAddr, path::Path};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use strum_macros::Display;

/// Top level daemon configuration, loaded from TOML.
///
/// # Errors
///
/// See [`AppConfig::load_from_path`].
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            monitor: MonitorConfig::default(),
            proxy: ProxyConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads daemon configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid UTF-8, or
    /// cannot be parsed into [`AppConfig`].
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;

        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML config: {}", path.display()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns an error if any interval is zero or the proxy listen address
    /// cannot be parsed.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.tick_ms == 0 {
            bail!("monitor.tick_ms must be greater than 0");
        }
        if self.monitor.domain_refresh_every_ticks == 0 {
            bail!("monitor.domain_refresh_every_ticks must be greater than 0");
        }
        if self.monitor.staleness_secs == 0 {
            bail!("monitor.staleness_secs must be greater than 0");
        }
        self.proxy
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("proxy.listen '{}' is not a valid socket address", self.proxy.listen))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "egress-warden.db".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Tick period in milliseconds. Spec default: 1000ms.
    pub tick_ms: u64,
    /// Domain-rule cache staleness threshold in seconds. Spec default: 5s.
    pub staleness_secs: u64,
    /// Re-run `refresh_domain` for every active domain rule every N ticks.
    pub domain_refresh_every_ticks: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            staleness_secs: 5,
            domain_refresh_every_ticks: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen: String,
    pub enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8443".to_owned(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlatformOverride {
    #[default]
    Auto,
    Linux,
    Macos,
    Windows,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlatformConfig {
    #[serde(default)]
    pub enforcer: PlatformOverride,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AppConfig::default();
        cfg.validate().expect("default config must validate");
    }

    #[test]
    fn zero_tick_rejected() {
        let mut cfg = AppConfig::default();
        cfg.monitor.tick_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_listen_addr_rejected() {
        let mut cfg = AppConfig::default();
        cfg.proxy.listen = "not-an-addr".to_owned();
        assert!(cfg.validate().is_err());
    }
}
