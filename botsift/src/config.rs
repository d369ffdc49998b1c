// botsift/src/config.rs
//
// Engine configuration. Every field has a default, so an empty JSON object
// (or no file at all) gives a working single-host setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── External classifier services ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub addr:       Option<String>,   // host:port of the scoring service
    pub learn_addr: Option<String>,   // online-learning endpoint
    pub label_addr: Option<String>,   // user-agent label service
    pub timeout_ms: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            addr:       None,
            learn_addr: None,
            label_addr: None,
            timeout_ms: 2_000,
        }
    }
}

impl ScorerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path:          PathBuf,
    pub db_connections:         usize,
    pub storage_retries:        u32,

    pub workers:                usize,
    pub backoff_initial_ms:     u64,
    pub backoff_max_ms:         u64,
    pub drain_batch:            usize,

    pub sweep_batch:            usize,
    pub sweep_max_wait_ms:      u64,
    pub sweep_min_interval_ms:  u64,

    pub scorer:                 ScorerConfig,
    pub redis_url:              Option<String>,   // None = in-process cache
    pub cache_timeout_ms:       u64,
    pub verdict_listen:         Option<String>,   // None = no verdict responder
    pub stats_interval_secs:    u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path:          PathBuf::from("/var/lib/botsift/botsift.db"),
            db_connections:         16,
            storage_retries:        5,

            workers:                512,
            backoff_initial_ms:     500,
            backoff_max_ms:         64_000,
            drain_batch:            10_000,

            sweep_batch:            5_000,
            sweep_max_wait_ms:      60_000,
            sweep_min_interval_ms:  5_000,

            scorer:                 ScorerConfig::default(),
            redis_url:              None,
            cache_timeout_ms:       1_000,
            verdict_listen:         None,
            stats_interval_secs:    30,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms).max(1))
    }

    /// Bound on each prediction cache call.
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms.max(1))
    }

    pub fn sweep_max_wait(&self) -> Duration {
        Duration::from_millis(self.sweep_max_wait_ms.max(1))
    }

    pub fn sweep_min_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_min_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_tuning() {
        let c = EngineConfig::default();
        assert_eq!(c.workers, 512);
        assert_eq!(c.backoff_initial(), Duration::from_millis(500));
        assert_eq!(c.backoff_max(), Duration::from_secs(64));
        assert_eq!(c.sweep_batch, 5_000);
        assert_eq!(c.sweep_max_wait(), Duration::from_secs(60));
        assert_eq!(c.scorer.timeout(), Duration::from_secs(2));
        assert_eq!(c.cache_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"workers": 8, "scorer": {{"addr": "127.0.0.1:7000"}}}}"#).unwrap();

        let c = EngineConfig::load(f.path()).unwrap();
        assert_eq!(c.workers, 8);
        assert_eq!(c.scorer.addr.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(c.scorer.timeout_ms, 2_000);
        assert_eq!(c.drain_batch, 10_000);
    }

    #[test]
    fn bad_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "workers = 8").unwrap();
        assert!(EngineConfig::load(f.path()).is_err());
    }
}
