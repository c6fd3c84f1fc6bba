//! Proxy configuration.
//!
//! Loaded once at startup from a JSON file; every field has a production
//! default so a minimal deployment only names its ring directory and bind
//! address. Timeouts are fractional seconds to keep operator muscle memory
//! from ini-style deployments working.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_bind_ip() -> String {
    "0.0.0.0".into()
}
fn default_bind_port() -> u16 {
    8080
}
fn default_swift_dir() -> PathBuf {
    PathBuf::from("/etc/magpie")
}
fn default_true() -> bool {
    true
}
fn default_node_timeout() -> f64 {
    10.0
}
fn default_connect_timeout() -> f64 {
    0.5
}
fn default_client_timeout() -> f64 {
    60.0
}
fn default_error_suppression_limit() -> usize {
    10
}
fn default_error_suppression_interval() -> f64 {
    60.0
}
fn default_recheck() -> f64 {
    60.0
}
fn default_rate_limit_after_segment() -> usize {
    10
}
fn default_rate_limit_segments_per_sec() -> f64 {
    1.0
}
fn default_allowed_headers() -> Vec<String> {
    ["content-disposition", "content-encoding", "x-delete-at", "x-object-manifest"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_ip: String,
    pub bind_port: u16,
    /// Directory holding `account.ring.json`, `container.ring.json`,
    /// `object.ring.json`.
    pub swift_dir: PathBuf,
    /// Cluster-wide placement secret; must match the ring builder's.
    pub hash_path_suffix: String,
    /// External cache deployment, `host:port` entries. Empty means the
    /// in-process cache.
    pub memcache_servers: Vec<String>,
    /// 0 = raw strings, 1 = pickled (read-only compat), 2 = JSON.
    pub memcache_serialization_support: u8,
    pub allow_account_management: bool,
    pub account_autocreate: bool,
    pub object_post_as_copy: bool,
    pub allow_versions: bool,
    /// Seconds, per backend I/O operation.
    pub node_timeout: f64,
    /// Seconds, per backend TCP connect.
    pub connect_timeout: f64,
    /// Seconds without a client body chunk before giving up.
    pub client_timeout: f64,
    pub error_suppression_limit: usize,
    /// Seconds; negative disables suppression.
    pub error_suppression_interval: f64,
    /// 0 means unlimited.
    pub max_containers_per_account: usize,
    pub max_containers_whitelist: Vec<String>,
    pub deny_host_headers: Vec<String>,
    /// Extra object headers persisted on writes, beyond the standard set.
    pub allowed_headers: Vec<String>,
    pub rate_limit_after_segment: usize,
    pub rate_limit_segments_per_sec: f64,
    pub log_handoffs: bool,
    /// Seconds account existence lookups stay cached.
    pub recheck_account_existence: f64,
    /// Seconds container lookups stay cached.
    pub recheck_container_existence: f64,
    /// Abort a streaming write outright on a mid-body disk-full instead of
    /// continuing with the remaining replicas.
    pub abort_on_disk_full: bool,
    /// Handoff nodes tried past the primaries; `None` means one per replica.
    pub max_handoffs: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            bind_port: default_bind_port(),
            swift_dir: default_swift_dir(),
            hash_path_suffix: String::new(),
            memcache_servers: Vec::new(),
            memcache_serialization_support: 2,
            allow_account_management: false,
            account_autocreate: false,
            object_post_as_copy: default_true(),
            allow_versions: false,
            node_timeout: default_node_timeout(),
            connect_timeout: default_connect_timeout(),
            client_timeout: default_client_timeout(),
            error_suppression_limit: default_error_suppression_limit(),
            error_suppression_interval: default_error_suppression_interval(),
            max_containers_per_account: 0,
            max_containers_whitelist: Vec::new(),
            deny_host_headers: Vec::new(),
            allowed_headers: default_allowed_headers(),
            rate_limit_after_segment: default_rate_limit_after_segment(),
            rate_limit_segments_per_sec: default_rate_limit_segments_per_sec(),
            log_handoffs: false,
            recheck_account_existence: default_recheck(),
            recheck_container_existence: default_recheck(),
            abort_on_disk_full: false,
            max_handoffs: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file undecodable: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProxyConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.node_timeout.max(0.0))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout.max(0.0))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.client_timeout.max(0.0))
    }

    pub fn account_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.recheck_account_existence.max(0.0))
    }

    pub fn container_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.recheck_container_existence.max(0.0))
    }
}
