//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Retry policy for optimistic-concurrency conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Upper bound of random jitter added on top of `delay`.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(500),
            jitter: Duration::ZERO,
        }
    }
}

/// Knowledge source sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often in-flight progress is checkpointed to the store.
    pub checkpoint_interval: Duration,
    /// How long to wait for the backing thread's workspace.
    pub wait_timeout: Duration,
    /// Retry policy for status writes.
    pub status_retry: RetryPolicy,
    /// Delay before re-checking derived files during cleanup.
    pub cleanup_requeue: Duration,
    /// Workspace-relative path of the sync metadata file.
    pub metadata_path: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(120), // 2 minutes
            status_retry: RetryPolicy::default(),
            cleanup_requeue: Duration::from_secs(5),
            metadata_path: ".metadata.json".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load overrides from `KSYNC_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            checkpoint_interval: env_millis("KSYNC_CHECKPOINT_MS")
                .unwrap_or(defaults.checkpoint_interval),
            wait_timeout: env_secs("KSYNC_WAIT_TIMEOUT_SECS").unwrap_or(defaults.wait_timeout),
            status_retry: RetryPolicy {
                attempts: env_parse("KSYNC_STATUS_RETRY_ATTEMPTS")
                    .unwrap_or(defaults.status_retry.attempts),
                delay: env_millis("KSYNC_STATUS_RETRY_DELAY_MS")
                    .unwrap_or(defaults.status_retry.delay),
                jitter: env_millis("KSYNC_STATUS_RETRY_JITTER_MS")
                    .unwrap_or(defaults.status_retry.jitter),
            },
            cleanup_requeue: env_secs("KSYNC_CLEANUP_REQUEUE_SECS")
                .unwrap_or(defaults.cleanup_requeue),
            metadata_path: std::env::var("KSYNC_METADATA_PATH")
                .unwrap_or(defaults.metadata_path),
        }
    }
}

/// Process-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub workspace_root: PathBuf,
    /// Namespace the controllers operate in.
    pub namespace: String,
    /// Concurrent reconciles per controller.
    pub workers: usize,
    /// Full re-list interval for controllers.
    pub resync_interval: Duration,
    /// Keep-alive interval on followed progress streams.
    pub heartbeat_interval: Duration,
    /// Optional directory for rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Shell command per data-source tool reference.
    pub tool_commands: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/knowledge-sync.db"),
            workspace_root: PathBuf::from("./data/workspaces"),
            namespace: "default".to_string(),
            workers: 4,
            resync_interval: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(15),
            log_dir: None,
            tool_commands: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load from `KSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workers = env_parse::<usize>("KSYNC_WORKERS").unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "KSYNC_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let namespace = std::env::var("KSYNC_NAMESPACE").unwrap_or(defaults.namespace);
        if namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "KSYNC_NAMESPACE".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            port: env_parse("KSYNC_PORT").unwrap_or(defaults.port),
            db_path: std::env::var("KSYNC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            workspace_root: std::env::var("KSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            namespace,
            workers,
            resync_interval: env_secs("KSYNC_RESYNC_SECS").unwrap_or(defaults.resync_interval),
            heartbeat_interval: env_secs("KSYNC_HEARTBEAT_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            log_dir: std::env::var("KSYNC_LOG_DIR").ok().map(PathBuf::from),
            tool_commands: tool_commands_from(std::env::vars()),
        })
    }
}

/// Collect `KSYNC_TOOL_<NAME>=<command>` pairs.
///
/// `KSYNC_TOOL_WEBSITE_DATA_SOURCE` maps to the tool reference `website-data-source`.
fn tool_commands_from(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter_map(|(key, value)| {
        let name = key.strip_prefix("KSYNC_TOOL_")?;
        if name.is_empty() || value.trim().is_empty() {
            return None;
        }
        Some((name.to_ascii_lowercase().replace('_', "-"), value))
    })
    .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_defaults_match_contract() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.checkpoint_interval, Duration::from_secs(2));
        assert_eq!(cfg.wait_timeout, Duration::from_secs(120));
        assert_eq!(cfg.cleanup_requeue, Duration::from_secs(5));
        assert_eq!(cfg.status_retry.attempts, 20);
        assert_eq!(cfg.status_retry.delay, Duration::from_millis(500));
        assert_eq!(cfg.status_retry.jitter, Duration::ZERO);
    }

    #[test]
    fn retry_budget_is_about_ten_seconds() {
        let policy = RetryPolicy::default();
        let budget = policy.delay * (policy.attempts - 1);
        assert!(budget >= Duration::from_millis(9_500));
        assert!(budget <= Duration::from_secs(10));
    }

    #[test]
    fn tool_commands_parsed_from_env_pairs() {
        let vars = vec![
            ("KSYNC_TOOL_WEBSITE_DATA_SOURCE".to_string(), "crawl --out .".to_string()),
            ("KSYNC_TOOL_".to_string(), "ignored".to_string()),
            ("KSYNC_TOOL_NOTION_DATA_SOURCE".to_string(), "  ".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let commands = tool_commands_from(vars.into_iter());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands["website-data-source"], "crawl --out .");
    }

    #[test]
    fn server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.namespace, "default");
        assert_eq!(cfg.workers, 4);
        assert!(cfg.tool_commands.is_empty());
    }
}
