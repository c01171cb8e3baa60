use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tenant::TenantTasks;

/// Process settings, read from `AGENDAD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reconcile_interval: Duration,
    pub auto_reconcile: bool,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "agendad".into(),
            max_connections: 256,
            compact_threshold: 1_000,
            reconcile_interval: Duration::from_secs(30),
            auto_reconcile: true,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Parse `key` if set; an unparsable value is logged and ignored.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("ignoring {key}={raw:?}: expected a boolean");
            None
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&lookup, "AGENDAD_PORT").unwrap_or(d.port),
            bind: lookup("AGENDAD_BIND").unwrap_or(d.bind),
            data_dir: lookup("AGENDAD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("AGENDAD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "AGENDAD_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "AGENDAD_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            reconcile_interval: parsed(&lookup, "AGENDAD_RECONCILE_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.reconcile_interval),
            auto_reconcile: flag(&lookup, "AGENDAD_AUTO_RECONCILE").unwrap_or(d.auto_reconcile),
            metrics_port: parsed(&lookup, "AGENDAD_METRICS_PORT"),
            tls_cert: lookup("AGENDAD_TLS_CERT"),
            tls_key: lookup("AGENDAD_TLS_KEY"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_tasks(&self) -> TenantTasks {
        TenantTasks {
            compact_threshold: self.compact_threshold,
            reconcile_interval: self.reconcile_interval,
            auto_reconcile: self.auto_reconcile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(from_pairs(&[]), ServerConfig::default());
        assert_eq!(ServerConfig::default().addr(), "0.0.0.0:5433");
    }

    #[test]
    fn reads_every_variable() {
        let cfg = from_pairs(&[
            ("AGENDAD_PORT", "6000"),
            ("AGENDAD_BIND", "127.0.0.1"),
            ("AGENDAD_DATA_DIR", "/var/lib/agendad"),
            ("AGENDAD_PASSWORD", "s3cret"),
            ("AGENDAD_MAX_CONNECTIONS", "12"),
            ("AGENDAD_COMPACT_THRESHOLD", "50"),
            ("AGENDAD_RECONCILE_INTERVAL_SECS", "5"),
            ("AGENDAD_AUTO_RECONCILE", "off"),
            ("AGENDAD_METRICS_PORT", "9100"),
            ("AGENDAD_TLS_CERT", "cert.pem"),
            ("AGENDAD_TLS_KEY", "key.pem"),
        ]);
        assert_eq!(cfg.addr(), "127.0.0.1:6000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/agendad"));
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.max_connections, 12);
        let tasks = cfg.tenant_tasks();
        assert_eq!(tasks.compact_threshold, 50);
        assert_eq!(tasks.reconcile_interval, Duration::from_secs(5));
        assert!(!tasks.auto_reconcile);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(cfg.tls_key.as_deref(), Some("key.pem"));
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = from_pairs(&[
            ("AGENDAD_PORT", "eighty"),
            ("AGENDAD_MAX_CONNECTIONS", "0"),
            ("AGENDAD_RECONCILE_INTERVAL_SECS", "0"),
            ("AGENDAD_AUTO_RECONCILE", "maybe"),
            ("AGENDAD_METRICS_PORT", "-1"),
        ]);
        let d = ServerConfig::default();
        assert_eq!(cfg.port, d.port);
        assert_eq!(cfg.max_connections, d.max_connections);
        assert_eq!(cfg.reconcile_interval, d.reconcile_interval);
        assert!(cfg.auto_reconcile);
        assert_eq!(cfg.metrics_port, None);
    }
}
