//! Configuration loading for the proxy
//!
//! The file is TOML. Each `[proxies.<name>]` table describes one mapping from a
//! local listen address to a backend RCON address; `<name>` is the server name
//! used to tag telemetry.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyConfig {
    /// Telemetry store; when absent observations are only logged
    #[serde(default)]
    pub influxdb: Option<InfluxConfig>,

    #[serde(default)]
    pub pacing: PacingConfig,

    /// Proxies keyed by server name
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyEntry>,
}

/// One `[proxies.<name>]` table
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyEntry {
    /// Listen address (host:port)
    pub src: String,
    /// Backend RCON address (host:port)
    pub dst: String,
}

/// InfluxDB v2 write settings
#[derive(Clone, Debug, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Minimum spacing of the admission and forwarding gates
#[derive(Clone, Debug, Deserialize)]
pub struct PacingConfig {
    /// Minimum delay between two admitted connections (default: 10)
    #[serde(default = "default_pacing_delay_ms")]
    pub admission_delay_ms: u64,

    /// Minimum delay between two forwarded client packets (default: 10)
    #[serde(default = "default_pacing_delay_ms")]
    pub forward_delay_ms: u64,
}

impl PacingConfig {
    pub fn admission_delay(&self) -> Duration {
        Duration::from_millis(self.admission_delay_ms)
    }

    pub fn forward_delay(&self) -> Duration {
        Duration::from_millis(self.forward_delay_ms)
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            admission_delay_ms: default_pacing_delay_ms(),
            forward_delay_ms: default_pacing_delay_ms(),
        }
    }
}

fn default_pacing_delay_ms() -> u64 {
    10
}

/// One proxied backend. Immutable after load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub server_name: String,
    pub source_address: String,
    pub target_address: String,
}

impl ProxyConfig {
    /// Reads, parses and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ProxyConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            return Err(ConfigError::Invalid("no proxies configured".to_string()));
        }

        for (name, entry) in &self.proxies {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("proxy with empty server name".to_string()));
            }
            validate_address(name, "src", &entry.src)?;
            validate_address(name, "dst", &entry.dst)?;
        }

        if let Some(influx) = &self.influxdb {
            for (field, value) in [
                ("url", &influx.url),
                ("token", &influx.token),
                ("org", &influx.org),
                ("bucket", &influx.bucket),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!("influxdb.{} is empty", field)));
                }
            }
        }

        Ok(())
    }

    /// Configured mappings, ordered by server name.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.proxies
            .iter()
            .map(|(name, entry)| Mapping {
                server_name: name.clone(),
                source_address: entry.src.clone(),
                target_address: entry.dst.clone(),
            })
            .collect()
    }
}

fn validate_address(name: &str, field: &str, addr: &str) -> Result<()> {
    let invalid = || ConfigError::Invalid(format!("proxies.{}.{} = {:?} is not host:port", name, field, addr));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [influxdb]
        url = "http://localhost:8086"
        token = "secret"
        org = "community"
        bucket = "rcon"

        [proxies.beta]
        src = "0.0.0.0:7780"
        dst = "10.0.0.2:7779"

        [proxies.alpha]
        src = "0.0.0.0:7779"
        dst = "10.0.0.1:7779"
    "#;

    #[test]
    fn test_load_sample() {
        let config = ProxyConfig::from_toml_str(SAMPLE).unwrap();

        let influx = config.influxdb.as_ref().unwrap();
        assert_eq!(influx.bucket, "rcon");
        assert_eq!(config.pacing.admission_delay(), Duration::from_millis(10));
        assert_eq!(config.pacing.forward_delay(), Duration::from_millis(10));

        let mappings = config.mappings();
        assert_eq!(mappings.len(), 2);
        assert_eq!(
            mappings[0],
            Mapping {
                server_name: "alpha".to_string(),
                source_address: "0.0.0.0:7779".to_string(),
                target_address: "10.0.0.1:7779".to_string(),
            }
        );
        assert_eq!(mappings[1].server_name, "beta");
    }

    #[test]
    fn test_influxdb_is_optional() {
        let config = ProxyConfig::from_toml_str(
            r#"
            [pacing]
            forward_delay_ms = 25

            [proxies.main]
            src = "127.0.0.1:7779"
            dst = "[::1]:7779"
            "#,
        )
        .unwrap();

        assert!(config.influxdb.is_none());
        assert_eq!(config.pacing.admission_delay_ms, 10);
        assert_eq!(config.pacing.forward_delay_ms, 25);
    }

    #[test]
    fn test_rejects_missing_proxies() {
        let err = ProxyConfig::from_toml_str("[pacing]\nadmission_delay_ms = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_addresses() {
        for addr in ["", "localhost", ":7779", "host:", "host:port", "host:70000"] {
            let toml = format!("[proxies.main]\nsrc = \"{}\"\ndst = \"127.0.0.1:1\"\n", addr);
            let err = ProxyConfig::from_toml_str(&toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "accepted {:?}", addr);
        }
    }

    #[test]
    fn test_rejects_empty_influx_fields() {
        let toml = r#"
            [influxdb]
            url = "http://localhost:8086"
            token = ""
            org = "o"
            bucket = "b"

            [proxies.main]
            src = "127.0.0.1:7779"
            dst = "127.0.0.1:7780"
        "#;
        assert!(matches!(
            ProxyConfig::from_toml_str(toml).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = ProxyConfig::from_toml_str("proxies = [[[").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ProxyConfig::load(Path::new("/nonexistent/rcon-proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
