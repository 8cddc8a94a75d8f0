//! Configuration file support for egress-gateway
//!
//! Loads and validates daemon configuration from TOML. Every field has a
//! default, so an empty file (or no file at all) yields a working config.
//! Command-line flags override file values in `main`.

use crate::error::{EgressError, Result};
use crate::route_manager::RouteManagerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest VXLAN network identifier (24 bits).
pub const MAX_VNI: u32 = 0x00FF_FFFF;

const LOG_SEVERITIES: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Node agent connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Unix socket of the node agent's policy sync API
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default = "default_subscription_type")]
    pub subscription_type: String,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

/// Kernel programming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_tunnel_interface")]
    pub tunnel_interface: String,

    #[serde(default = "default_vni")]
    pub vni: u32,

    /// Base retry delay after a failed reconciliation in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Extra random delay as a fraction of the base (0.0 - 1.0)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Port for the readiness/liveness HTTP endpoint; disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
}

/// Complete egress-gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_log_severity")]
    pub log_severity: String,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/nodeagent/socket")
}

fn default_subscription_type() -> String {
    crate::sync_client::SUBSCRIPTION_L3_ROUTES.to_string()
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_tunnel_interface() -> String {
    "vxlan0".to_string()
}

fn default_vni() -> u32 {
    4097
}

fn default_retry_interval() -> u64 {
    10_000
}

fn default_retry_jitter() -> f64 {
    0.1
}

fn default_log_severity() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            subscription_type: default_subscription_type(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            tunnel_interface: default_tunnel_interface(),
            vni: default_vni(),
            retry_interval_ms: default_retry_interval(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_severity: default_log_severity(),
            sync: SyncConfig::default(),
            routing: RoutingConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads and validates configuration from `path`. A missing file is an
    /// error here; callers without a path use [`GatewayConfig::default`].
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EgressError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            EgressError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.sync.reconnect_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.routing.retry_interval_ms)
    }

    pub fn route_manager(&self) -> RouteManagerConfig {
        RouteManagerConfig {
            tunnel_interface: self.routing.tunnel_interface.clone(),
            vni: self.routing.vni,
            retry_interval: self.retry_interval(),
            retry_jitter: self.routing.retry_jitter,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.routing.vni > MAX_VNI {
            return Err(EgressError::Config(format!(
                "vni must be <= {}, got {}",
                MAX_VNI, self.routing.vni
            )));
        }

        if !(0.0..=1.0).contains(&self.routing.retry_jitter) {
            return Err(EgressError::Config(
                "retry_jitter must be 0.0-1.0".to_string(),
            ));
        }

        if self.routing.retry_interval_ms == 0 {
            return Err(EgressError::Config(
                "retry_interval_ms must be > 0".to_string(),
            ));
        }

        if self.routing.tunnel_interface.is_empty() {
            return Err(EgressError::Config(
                "tunnel_interface must not be empty".to_string(),
            ));
        }

        if !LOG_SEVERITIES.contains(&self.log_severity.as_str()) {
            return Err(EgressError::Config(format!(
                "log_severity must be one of {}, got {:?}",
                LOG_SEVERITIES.join(", "),
                self.log_severity
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.sync.socket_path, PathBuf::from("/var/run/nodeagent/socket"));
        assert_eq!(config.sync.subscription_type, "l3-routes");
        assert_eq!(config.routing.tunnel_interface, "vxlan0");
        assert_eq!(config.routing.vni, 4097);
        assert_eq!(config.retry_interval(), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.health.port, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_severity = "debug"

[routing]
vni = 42
tunnel_interface = "egress.vxlan"

[health]
port = 9099
"#
        )
        .unwrap();

        let config = GatewayConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.log_severity, "debug");
        assert_eq!(config.routing.vni, 42);
        assert_eq!(config.routing.tunnel_interface, "egress.vxlan");
        assert_eq!(config.routing.retry_jitter, 0.1);
        assert_eq!(config.health.port, Some(9099));
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_route_manager_config() {
        let mut config = GatewayConfig::default();
        config.routing.retry_interval_ms = 2500;
        let mgr = config.route_manager();
        assert_eq!(mgr.tunnel_interface, "vxlan0");
        assert_eq!(mgr.retry_interval, Duration::from_millis(2500));
        assert_eq!(mgr.retry_jitter, 0.1);
    }

    #[test]
    fn test_validate_vni_range() {
        let mut config = GatewayConfig::default();
        config.routing.vni = MAX_VNI;
        assert!(config.validate().is_ok());
        config.routing.vni = MAX_VNI + 1;
        assert!(matches!(config.validate(), Err(EgressError::Config(_))));
    }

    #[test]
    fn test_validate_jitter() {
        let mut config = GatewayConfig::default();
        config.routing.retry_jitter = 1.5;
        assert!(config.validate().is_err());
        config.routing.retry_jitter = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_severity() {
        let mut config = GatewayConfig::default();
        config.log_severity = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[routing]\nvni = 99999999").unwrap();
        assert!(GatewayConfig::load_from_file(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[routing\nvni = ").unwrap();
        let err = GatewayConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(GatewayConfig::load_from_file("/nonexistent/egress-gateway.toml").is_err());
    }
}
