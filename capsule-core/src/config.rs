use serde::Deserialize;
use std::path::PathBuf;

use crate::capsule::Quota;

/// Process configuration, read from the environment with sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Size of the dispatcher worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound of the command queue; enqueue applies backpressure beyond this.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_disk_quota_gb")]
    pub default_disk_quota_gb: i64,

    #[serde(default = "default_cpu_quota")]
    pub default_cpu_quota: i64,

    #[serde(default = "default_memory_quota_mb")]
    pub default_memory_quota_mb: i64,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("CAPSULE_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".capsule").join("capsule.db")
}

fn default_workers() -> usize {
    env_parse("CAPSULE_WORKERS", 2)
}

fn default_queue_depth() -> usize {
    env_parse("CAPSULE_QUEUE_DEPTH", 64)
}

fn default_retry_delay_ms() -> u64 {
    env_parse("CAPSULE_RETRY_DELAY_MS", 1000)
}

fn default_retry_attempts() -> u32 {
    env_parse("CAPSULE_RETRY_ATTEMPTS", 3)
}

fn default_disk_quota_gb() -> i64 {
    env_parse("CAPSULE_USER_DISK_QUOTA_GB", 100)
}

fn default_cpu_quota() -> i64 {
    env_parse("CAPSULE_USER_CPU_QUOTA", 8)
}

fn default_memory_quota_mb() -> i64 {
    env_parse("CAPSULE_USER_MEMORY_QUOTA_MB", 16384)
}

fn env_parse<T: std::str::FromStr>(var: &str, fallback: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// The quota a freshly bootstrapped user starts with.
    pub fn default_user_quota(&self) -> Quota {
        Quota {
            disk_gb: self.default_disk_quota_gb,
            cpu: self.default_cpu_quota,
            memory_mb: self.default_memory_quota_mb,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_attempts: default_retry_attempts(),
            default_disk_quota_gb: default_disk_quota_gb(),
            default_cpu_quota: default_cpu_quota(),
            default_memory_quota_mb: default_memory_quota_mb(),
        }
    }
}
