//! Runtime configuration: defaults, an optional TOML file, then
//! `GG_DEPLOY_*` environment overrides.
//!
//! Invalid environment values fall back to the file or default value
//! without failing. Every value is clamped to a sane range after layering.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_DEPLOY_EVENT_POLL_MS` | 100 | Daemon event wait bound |
//! | `GG_DEPLOY_DISPATCHER_POLL_MS` | 50 | Dispatcher event wait bound |
//! | `GG_DEPLOY_WORKER_POLL_MS` | 100 | Executor worker wake-up interval |
//! | `GG_DEPLOY_QUEUE_TIMEOUT_MS` | 5000 | Queue enqueue/dequeue bound |
//! | `GG_DEPLOY_REQUEST_TIMEOUT_MS` | 10000 | Device request round-trip bound |
//! | `GG_DEPLOY_DOWNLOAD_CHUNK` | 1048576 | Model download chunk size (bytes) |
//! | `GG_DEPLOY_MAX_MESSAGE` | 67108864 | Max encoded protocol message (bytes) |
//! | `GG_DEPLOY_MBUF_CAPACITY` | 268435456 | Per-device mbuf pool (bytes) |
//! | `GG_DEPLOY_MAX_MODEL_SIZE` | 4294967296 | Largest model a device accepts (bytes) |
//! | `GG_DEPLOY_QUEUE_DEPTH` | 128 | Depth of undeclared queues |
//! | `GG_DEPLOY_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `GG_DEPLOY_LOG_FORMAT` | json | `json` or `pretty` |
//! | `GG_DEPLOY_LOG_FILE` | unset | Log to file instead of stderr |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::daemon::DaemonConfig;
use crate::deployer::{ClusterConfig, DeployerConfig};
use crate::executor::{ExecutorConfig, DEFAULT_MAX_MODEL_SIZE};
use crate::planner::DEFAULT_QUEUE_DEPTH;
use crate::telemetry::{LogConfig, LogFormat};

const MIB: usize = 1024 * 1024;
/// Room for the JSON envelope around a hex-encoded download chunk.
const ENVELOPE_RESERVE: usize = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Every tunable, as read from a file and the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    pub event_poll_ms: u64,
    pub dispatcher_poll_ms: u64,
    pub worker_poll_ms: u64,
    pub queue_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub download_chunk_size: usize,
    pub max_message_size: usize,
    pub mbuf_capacity: usize,
    pub max_model_size: u64,
    pub default_queue_depth: u32,
    pub log: LogConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            event_poll_ms: 100,
            dispatcher_poll_ms: 50,
            worker_poll_ms: 100,
            queue_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            download_chunk_size: MIB,
            max_message_size: 64 * MIB,
            mbuf_capacity: 256 * MIB,
            max_model_size: DEFAULT_MAX_MODEL_SIZE,
            default_queue_depth: DEFAULT_QUEUE_DEPTH,
            log: LogConfig::default(),
        }
    }
}

/// Serializable summary printed by `config show`.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub event_poll_ms: u64,
    pub dispatcher_poll_ms: u64,
    pub worker_poll_ms: u64,
    pub queue_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub download_chunk_size: usize,
    pub max_message_size: usize,
    pub mbuf_capacity: usize,
    pub max_model_size: u64,
    pub default_queue_depth: u32,
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<PathBuf>,
}

fn parse_env<T: std::str::FromStr>(key: &str, current: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(current),
        Err(_) => current,
    }
}

/// Load from defaults and the environment.
pub fn load() -> DeployConfig {
    layer(DeployConfig::default())
}

/// Load `path`, then apply environment overrides.
pub fn load_file(path: &Path) -> Result<DeployConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(layer(from_toml(&text)?))
}

/// Parse TOML without environment overrides or clamping.
pub fn from_toml(text: &str) -> Result<DeployConfig, ConfigError> {
    Ok(toml::from_str(text)?)
}

fn layer(mut cfg: DeployConfig) -> DeployConfig {
    cfg.apply_env();
    cfg.clamp();
    cfg
}

impl DeployConfig {
    fn apply_env(&mut self) {
        self.event_poll_ms = parse_env("GG_DEPLOY_EVENT_POLL_MS", self.event_poll_ms);
        self.dispatcher_poll_ms = parse_env("GG_DEPLOY_DISPATCHER_POLL_MS", self.dispatcher_poll_ms);
        self.worker_poll_ms = parse_env("GG_DEPLOY_WORKER_POLL_MS", self.worker_poll_ms);
        self.queue_timeout_ms = parse_env("GG_DEPLOY_QUEUE_TIMEOUT_MS", self.queue_timeout_ms);
        self.request_timeout_ms = parse_env("GG_DEPLOY_REQUEST_TIMEOUT_MS", self.request_timeout_ms);
        self.download_chunk_size = parse_env("GG_DEPLOY_DOWNLOAD_CHUNK", self.download_chunk_size);
        self.max_message_size = parse_env("GG_DEPLOY_MAX_MESSAGE", self.max_message_size);
        self.mbuf_capacity = parse_env("GG_DEPLOY_MBUF_CAPACITY", self.mbuf_capacity);
        self.max_model_size = parse_env("GG_DEPLOY_MAX_MODEL_SIZE", self.max_model_size);
        self.default_queue_depth = parse_env("GG_DEPLOY_QUEUE_DEPTH", self.default_queue_depth);
        if let Ok(level) = std::env::var("GG_DEPLOY_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log.level = level.trim().to_string();
            }
        }
        self.log.format = parse_env::<LogFormat>("GG_DEPLOY_LOG_FORMAT", self.log.format);
        if let Ok(file) = std::env::var("GG_DEPLOY_LOG_FILE") {
            self.log.output_path = (!file.trim().is_empty()).then(|| PathBuf::from(file.trim()));
        }
    }

    fn clamp(&mut self) {
        self.event_poll_ms = self.event_poll_ms.clamp(1, 10_000);
        self.dispatcher_poll_ms = self.dispatcher_poll_ms.clamp(1, 10_000);
        self.worker_poll_ms = self.worker_poll_ms.clamp(1, 10_000);
        self.queue_timeout_ms = self.queue_timeout_ms.clamp(1, 600_000);
        self.request_timeout_ms = self.request_timeout_ms.clamp(10, 600_000);
        self.max_message_size = self.max_message_size.clamp(4 * ENVELOPE_RESERVE, 1024 * MIB);
        // Chunks travel hex-encoded, so one chunk must fit twice in a message.
        let chunk_ceiling = (self.max_message_size - ENVELOPE_RESERVE) / 2;
        self.download_chunk_size = self.download_chunk_size.clamp(1, chunk_ceiling);
        self.mbuf_capacity = self.mbuf_capacity.max(self.max_message_size);
        self.max_model_size = self.max_model_size.clamp(MIB as u64, 1 << 40);
        self.default_queue_depth = self.default_queue_depth.clamp(1, 65_536);
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            worker_poll: Duration::from_millis(self.worker_poll_ms),
            max_model_size: self.max_model_size,
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            event_poll: Duration::from_millis(self.event_poll_ms),
            request_timeout: Duration::from_millis(self.queue_timeout_ms),
            dispatcher_poll: Duration::from_millis(self.dispatcher_poll_ms),
            max_message_size: self.max_message_size,
            executor: self.executor_config(),
        }
    }

    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            download_chunk_size: self.download_chunk_size,
            max_message_size: self.max_message_size,
            default_queue_depth: self.default_queue_depth,
        }
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            mbuf_capacity: self.mbuf_capacity,
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_message_size: self.max_message_size,
            daemon: self.daemon_config(),
        }
    }

    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            event_poll_ms: self.event_poll_ms,
            dispatcher_poll_ms: self.dispatcher_poll_ms,
            worker_poll_ms: self.worker_poll_ms,
            queue_timeout_ms: self.queue_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            download_chunk_size: self.download_chunk_size,
            max_message_size: self.max_message_size,
            mbuf_capacity: self.mbuf_capacity,
            max_model_size: self.max_model_size,
            default_queue_depth: self.default_queue_depth,
            log_level: self.log.level.clone(),
            log_format: self.log.format.to_string(),
            log_file: self.log.output_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "GG_DEPLOY_EVENT_POLL_MS",
        "GG_DEPLOY_DISPATCHER_POLL_MS",
        "GG_DEPLOY_WORKER_POLL_MS",
        "GG_DEPLOY_QUEUE_TIMEOUT_MS",
        "GG_DEPLOY_REQUEST_TIMEOUT_MS",
        "GG_DEPLOY_DOWNLOAD_CHUNK",
        "GG_DEPLOY_MAX_MESSAGE",
        "GG_DEPLOY_MBUF_CAPACITY",
        "GG_DEPLOY_MAX_MODEL_SIZE",
        "GG_DEPLOY_QUEUE_DEPTH",
        "GG_DEPLOY_LOG_LEVEL",
        "GG_DEPLOY_LOG_FORMAT",
        "GG_DEPLOY_LOG_FILE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg, DeployConfig::default());
        assert_eq!(cfg.daemon_config().event_poll, Duration::from_millis(100));
        assert_eq!(cfg.deployer_config().download_chunk_size, MIB);
        assert_eq!(cfg.log.format, LogFormat::Json);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_DEPLOY_DOWNLOAD_CHUNK", "4096");
        std::env::set_var("GG_DEPLOY_QUEUE_DEPTH", "16");
        std::env::set_var("GG_DEPLOY_LOG_FORMAT", "pretty");
        let cfg = load();
        assert_eq!(cfg.download_chunk_size, 4096);
        assert_eq!(cfg.default_queue_depth, 16);
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_DEPLOY_EVENT_POLL_MS", "soon");
        std::env::set_var("GG_DEPLOY_LOG_FORMAT", "xml");
        let cfg = load();
        assert_eq!(cfg.event_poll_ms, 100);
        assert_eq!(cfg.log.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_model_size_limit_reaches_executor() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_DEPLOY_MAX_MODEL_SIZE", "8388608");
        assert_eq!(load().executor_config().max_model_size, 8 * MIB as u64);
        std::env::set_var("GG_DEPLOY_MAX_MODEL_SIZE", "1");
        assert_eq!(load().max_model_size, MIB as u64);
        clear_env_vars();
    }

    #[test]
    fn test_chunk_is_clamped_to_message_size() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_DEPLOY_MAX_MESSAGE", "65536");
        std::env::set_var("GG_DEPLOY_DOWNLOAD_CHUNK", "0");
        let cfg = load();
        assert_eq!(cfg.download_chunk_size, 1);

        std::env::set_var("GG_DEPLOY_DOWNLOAD_CHUNK", "1000000");
        let cfg = load();
        assert!(cfg.download_chunk_size * 2 + ENVELOPE_RESERVE <= cfg.max_message_size);
        clear_env_vars();
    }

    #[test]
    fn test_file_then_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_timeout_ms = 250\ndefault_queue_depth = 8\n[log]\nlevel = \"debug\"").unwrap();
        std::env::set_var("GG_DEPLOY_QUEUE_DEPTH", "32");
        let cfg = load_file(file.path()).unwrap();
        assert_eq!(cfg.queue_timeout_ms, 250);
        assert_eq!(cfg.default_queue_depth, 32);
        assert_eq!(cfg.log.level, "debug");
        clear_env_vars();
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(matches!(from_toml("chunk = 5"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            load_file(Path::new("/nonexistent/gg-deploy.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_effective_config_contains_all_fields() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let eff = load().effective_config();
        assert!(eff.event_poll_ms > 0);
        assert!(eff.download_chunk_size > 0);
        assert!(eff.mbuf_capacity >= eff.max_message_size);
        assert_eq!(eff.log_format, "json");
        assert!(eff.log_file.is_none());
    }
}
