//! Server and client configuration
//!
//! Files are TOML; a `.json` extension selects JSON instead.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::heartbeat::HeartbeatPolicy;
use crate::protocol::{
    HEART_BEAT_INTERVAL, HEART_BEAT_LISTENER_PORT, MAX_RETRY_TIME, SYNC_FILE_NUM_ONETIME,
};

fn default_log_file_num() -> usize {
    5
}
fn default_heartbeat_bind() -> String {
    format!("0.0.0.0:{}", HEART_BEAT_LISTENER_PORT)
}
fn default_heartbeat_port() -> u16 {
    HEART_BEAT_LISTENER_PORT
}
fn default_interval() -> u64 {
    HEART_BEAT_INTERVAL
}
fn default_max_retry() -> u32 {
    MAX_RETRY_TIME
}
fn default_workers() -> usize {
    SYNC_FILE_NUM_ONETIME
}

/// A monitored server directory and the clients allowed to receive it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoredDir {
    pub dir: PathBuf,
    #[serde(default)]
    pub white_list: Vec<String>,
}

impl MonitoredDir {
    /// Whitelist entry (`ip:port`) registered for this host, if any
    pub fn entry_for_host(&self, ip: &str) -> Option<&str> {
        self.white_list
            .iter()
            .map(String::as_str)
            .find(|entry| host_of(entry) == ip)
    }

    /// Path-component prefix match, so `/a` does not claim `/ab/x`
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.dir)
    }
}

/// Host part of an `ip:port` whitelist entry
pub fn host_of(entry: &str) -> &str {
    let host = match entry.rsplit_once(':') {
        Some((h, _)) => h,
        None => entry,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Kept for config compatibility; the server only dials out
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_file_num")]
    pub log_file_num: usize,
    #[serde(default = "default_heartbeat_bind")]
    pub heartbeat_bind: String,
    #[serde(default = "default_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry_time: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub moni_dir: Vec<MonitoredDir>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.moni_dir.is_empty() {
            bail!("no monitored directories configured (moni_dir)");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.heartbeat_interval_secs == 0 || self.max_retry_time == 0 {
            bail!("heartbeat_interval_secs and max_retry_time must be positive");
        }
        for moni in &self.moni_dir {
            for entry in &moni.white_list {
                entry.parse::<SocketAddr>().with_context(|| {
                    format!(
                        "white_list entry {:?} of {} is not ip:port",
                        entry,
                        moni.dir.display()
                    )
                })?;
            }
        }
        Ok(())
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy::new(self.heartbeat_interval_secs, self.max_retry_time)
    }

    /// True if any monitored dir lists this host
    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.moni_dir.iter().any(|m| m.entry_for_host(ip).is_some())
    }
}

/// Server directory mirrored into a local directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncDir {
    /// Server-side path as the server spells it (may be a Windows path)
    pub server_dir: String,
    pub local_dir: String,
    /// `host:port` of the server; heartbeats go to `host:heartbeat_port`
    pub server_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub listen: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_file_num")]
    pub log_file_num: usize,
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,
    #[serde(default = "default_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub sync_dir: Vec<SyncDir>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sync_dir.is_empty() {
            bail!("no sync directories configured (sync_dir)");
        }
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be positive");
        }
        for d in &self.sync_dir {
            if d.server_dir.is_empty() || d.local_dir.is_empty() {
                bail!("sync_dir entries need both server_dir and local_dir");
            }
            if host_of(&d.server_addr).is_empty() {
                bail!("sync_dir {} has no server_addr host", d.server_dir);
            }
        }
        Ok(())
    }

    /// Distinct server hosts to keep heartbeats with
    pub fn server_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for d in &self.sync_dir {
            let h = host_of(&d.server_addr).to_string();
            if !hosts.contains(&h) {
                hosts.push(h);
            }
        }
        hosts
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        serde_json::from_str(&data).with_context(|| format!("parse JSON config {}", path.display()))
    } else {
        toml::from_str(&data).with_context(|| format!("parse TOML config {}", path.display()))
    }
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let cfg: ServerConfig = load_file(path)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let cfg: ClientConfig = load_file(path)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_server_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
debug = true

[[moni_dir]]
dir = "/srv/docs"
white_list = ["10.0.0.5:9000", "10.0.0.6:9000"]
"#,
        )
        .unwrap();
        let cfg = load_server_config(&path).unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.workers, SYNC_FILE_NUM_ONETIME);
        assert_eq!(cfg.heartbeat_bind, "0.0.0.0:6001");
        assert_eq!(cfg.moni_dir[0].white_list.len(), 2);
        assert!(cfg.is_whitelisted("10.0.0.6"));
        assert!(!cfg.is_whitelisted("10.0.0.7"));
        assert_eq!(cfg.heartbeat_policy().window_secs(), 300);
    }

    #[test]
    fn test_load_server_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{"listen":":6000","debug":false,"log_file":"/tmp/s.log","log_file_num":3,
               "moni_dir":[{"dir":"/data","white_list":["192.168.1.2:6000"]}]}"#,
        )
        .unwrap();
        let cfg = load_server_config(&path).unwrap();
        assert_eq!(cfg.log_file_num, 3);
        assert_eq!(cfg.moni_dir[0].dir, PathBuf::from("/data"));
    }

    #[test]
    fn test_server_config_rejects_bad_whitelist() {
        let cfg = ServerConfig {
            listen: None,
            debug: false,
            log_file: None,
            log_file_num: 1,
            heartbeat_bind: default_heartbeat_bind(),
            heartbeat_interval_secs: 10,
            max_retry_time: 30,
            workers: 1,
            moni_dir: vec![MonitoredDir {
                dir: PathBuf::from("/a"),
                white_list: vec!["not-an-address".into()],
            }],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.5:9000"), "10.0.0.5");
        assert_eq!(host_of("[::1]:9000"), "::1");
        assert_eq!(host_of("10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn test_monitored_dir_prefix_is_by_component() {
        let m = MonitoredDir {
            dir: PathBuf::from("/a"),
            white_list: vec![],
        };
        assert!(m.contains(Path::new("/a/x")));
        assert!(m.contains(Path::new("/a")));
        assert!(!m.contains(Path::new("/ab/x")));
    }

    #[test]
    fn test_client_config_server_hosts_dedup() {
        let cfg: ClientConfig = toml::from_str(
            r#"
listen = "0.0.0.0:9000"

[[sync_dir]]
server_dir = "/srv/docs"
local_dir = "/backup/docs"
server_addr = "10.0.0.1:6000"

[[sync_dir]]
server_dir = "/srv/img"
local_dir = "/backup/img"
server_addr = "10.0.0.1:6000"
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.server_hosts(), vec!["10.0.0.1".to_string()]);
        assert_eq!(cfg.heartbeat_port, 6001);
    }
}
