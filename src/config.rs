use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Daemon-wide tunables: client/worker limits, timeouts, debug.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub max_clients: u32,
    pub cgroup_remove_timeout_ms: u64,
    pub freezer_wait_timeout_ms: u64,
    pub rpc_worker_threads: u32,
    pub event_worker_threads: u32,
    pub debug: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            cgroup_remove_timeout_ms: 5000,
            freezer_wait_timeout_ms: 2000,
            rpc_worker_threads: 4,
            event_worker_threads: 2,
            debug: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyvalConfig {
    pub root: PathBuf,
    pub tmpfs_size: String,
    pub file_perm: u32,
}

impl Default for KeyvalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/run/ctnrd/kvs"),
            tmpfs_size: "size=32m".to_owned(),
            file_perm: 0o600,
        }
    }
}

/// Container-wide defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDefaults {
    pub max_log_size: u64,
    pub aging_time_ms: u64,
    pub respawn_delay_ms: u64,
    pub stdout_limit: u64,
    pub kill_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub max_total: u32,
    pub max_depth: u32,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            max_log_size: 8 * 1024 * 1024,
            aging_time_ms: 60_000,
            respawn_delay_ms: 1000,
            stdout_limit: 8 * 1024 * 1024,
            kill_timeout_ms: 5000,
            stop_timeout_ms: 30_000,
            max_total: 4096,
            max_depth: 16,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    pub enable: bool,
    pub enable_quota: bool,
    pub volume_dir: PathBuf,
    pub layer_dir: PathBuf,
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            enable: true,
            enable_quota: true,
            volume_dir: PathBuf::from("/var/lib/ctnrd/volumes"),
            layer_dir: PathBuf::from("/var/lib/ctnrd/layers"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enable: bool,
    pub default_guarantee_kbps: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable: false,
            default_guarantee_kbps: 0,
        }
    }
}

/// Top-level configuration message. `ctnrd` owns this struct
/// and its defaults; the text-format reader that produces one from disk is
/// an external collaborator, but a `serde_json`-based
/// constructor is provided so the struct stays independently testable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
    pub keyval: KeyvalConfig,
    pub container: ContainerDefaults,
    pub volumes: VolumesConfig,
    pub network: NetworkConfig,
}

impl Config {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
