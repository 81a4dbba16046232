// src/ops.rs
//
// Operational glue: health flags for the scrape endpoint, the environment
// secret provider (API keys never enter the config tree), the shutdown
// marker, and the startup log line.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::Serialize;

use crate::config::Config;
use crate::types::TimestampMs;

/// Sensitive values come from the environment only.
pub trait SecretProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct HealthState {
    healthy: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct ShutdownMarker<'a> {
    ts: TimestampMs,
    reason: &'a str,
    cancelled_orders: usize,
    failed_cancellations: usize,
}

/// Persist the shutdown marker required by the emergency-stop contract.
pub fn write_shutdown_marker(
    run_dir: &Path,
    ts: TimestampMs,
    reason: &str,
    cancelled_orders: usize,
    failed_cancellations: usize,
) -> std::io::Result<()> {
    fs::create_dir_all(run_dir)?;
    let marker = ShutdownMarker {
        ts,
        reason,
        cancelled_orders,
        failed_cancellations,
    };
    let path = run_dir.join("shutdown.json");
    fs::write(path, serde_json::to_string_pretty(&marker)?)
}

pub fn config_hash(cfg: &Config) -> u64 {
    fnv1a64(&format!("{cfg:?}"))
}

/// Dump the resolved config for the audit trail and the /config endpoint.
pub fn write_resolved_config(run_dir: &Path, cfg: &Config) -> std::io::Result<()> {
    fs::create_dir_all(run_dir)?;
    let path = run_dir.join("config_resolved.json");
    fs::write(path, serde_json::to_string_pretty(cfg)?)
}

pub fn format_startup_log(cfg: &Config, metrics_addr: &str) -> String {
    let exchanges = cfg.exchanges_enabled.join(",");
    let symbols = cfg.symbols.join(",");
    format!(
        "arbot | mode={} | exchanges={} | symbols={} | cfg={} | cfg_hash=0x{:016x} | metrics_addr={}",
        cfg.system.execution_mode.as_str(),
        exchanges,
        symbols,
        cfg.version,
        config_hash(cfg),
        metrics_addr
    )
}

pub fn default_run_dir(cfg: &Config) -> PathBuf {
    PathBuf::from(&cfg.run_dir)
}

fn fnv1a64(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_flags_toggle() {
        let health = HealthState::new();
        assert!(health.is_healthy());
        assert!(!health.is_ready());
        health.set_ready(true);
        health.set_healthy(false);
        assert!(health.is_ready());
        assert!(!health.is_healthy());
    }

    #[test]
    fn shutdown_marker_written() {
        let dir = tempfile::tempdir().unwrap();
        write_shutdown_marker(dir.path(), 1_000, "emergency_stop", 3, 1).unwrap();
        let contents = fs::read_to_string(dir.path().join("shutdown.json")).unwrap();
        assert!(contents.contains("emergency_stop"));
        assert!(contents.contains("\"failed_cancellations\": 1"));
    }

    #[test]
    fn startup_line_names_mode_and_exchanges() {
        let cfg = Config::default();
        let line = format_startup_log(&cfg, "127.0.0.1:9464");
        assert!(line.contains("mode=paper"));
        assert!(line.contains("binance"));
    }
}
