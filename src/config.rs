//! Environment-driven configuration.
//!
//! Read once at startup and passed to [`crate::Infrastructure::from_config`].
//! Nothing else in the crate looks at the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `OUTBOX_PROJECT_ID` | unset: in-process backend; set: managed backend |
//! | `OUTBOX_DATA_DIR` | `./data` |
//! | `OUTBOX_CALLBACK_BASE_URL` | `http://127.0.0.1:8080` |
//! | `OUTBOX_PUSH_ENDPOINTS` | empty; `topic=url,topic=url` |
//! | `OUTBOX_LISTEN_ADDR` | `0.0.0.0:8080` |
//! | `OUTBOX_TRIGGER_DELAY_MS` | `3000` |
//! | `OUTBOX_DEDUP_WINDOW_SECS` | `3600` |
//! | `OUTBOX_MAX_ATTEMPTS` | `5` |
//! | `OUTBOX_QUEUE_POLL_MS` | `200` |
//! | `OUTBOX_SWEEP_INTERVAL_SECS` | `60` |
//! | `OUTBOX_SWEEP_GRACE_SECS` | `300` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Unsupported(String),
}

impl ConfigError {
    fn invalid_var(var: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidVar {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Which infrastructure the process runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    /// Mutex-guarded store, in-memory bus, in-process trigger callback.
    InProcess,
    /// Durable optimistic store, HTTP trigger callback, push delivery.
    Managed { project_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    pub topic: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub callback_base_url: String,
    pub push_endpoints: Vec<PushTarget>,
    pub listen_addr: String,
    pub trigger_delay_ms: u64,
    pub dedup_window_secs: u64,
    pub max_attempts: u32,
    pub queue_poll_ms: u64,
    pub sweep_interval_secs: u64,
    pub sweep_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::InProcess,
            data_dir: PathBuf::from("./data"),
            callback_base_url: "http://127.0.0.1:8080".into(),
            push_endpoints: Vec::new(),
            listen_addr: "0.0.0.0:8080".into(),
            trigger_delay_ms: 3000,
            dedup_window_secs: 3600,
            max_attempts: 5,
            queue_poll_ms: 200,
            sweep_interval_secs: 60,
            sweep_grace_secs: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Config::default();

        if let Some(project_id) = get("OUTBOX_PROJECT_ID") {
            config.backend = Backend::Managed {
                project_id: project_id.trim().to_string(),
            };
        }
        if let Some(dir) = get("OUTBOX_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("OUTBOX_CALLBACK_BASE_URL") {
            config.callback_base_url = parse_url("OUTBOX_CALLBACK_BASE_URL", &url)?;
        }
        if let Some(raw) = get("OUTBOX_PUSH_ENDPOINTS") {
            config.push_endpoints = parse_push_endpoints(&raw)?;
        }
        if let Some(addr) = get("OUTBOX_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        parse_into(&get, "OUTBOX_TRIGGER_DELAY_MS", &mut config.trigger_delay_ms)?;
        parse_into(&get, "OUTBOX_DEDUP_WINDOW_SECS", &mut config.dedup_window_secs)?;
        parse_into(&get, "OUTBOX_MAX_ATTEMPTS", &mut config.max_attempts)?;
        parse_into(&get, "OUTBOX_QUEUE_POLL_MS", &mut config.queue_poll_ms)?;
        parse_into(&get, "OUTBOX_SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs)?;
        parse_into(&get, "OUTBOX_SWEEP_GRACE_SECS", &mut config.sweep_grace_secs)?;

        if config.max_attempts == 0 {
            return Err(ConfigError::invalid_var(
                "OUTBOX_MAX_ATTEMPTS",
                "0",
                "must be at least 1",
            ));
        }
        Ok(config)
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.backend, Backend::Managed { .. })
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sweep_grace(&self) -> Duration {
        Duration::from_secs(self.sweep_grace_secs)
    }

    /// Location of the durable store snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("outbox.snapshot")
    }
}

fn parse_into<T, G>(get: &G, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid_var(var, &raw, e))?;
    }
    Ok(())
}

fn parse_url(var: &'static str, raw: &str) -> Result<String, ConfigError> {
    let url = raw.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::invalid_var(var, raw, "expected an http(s) URL"))
    }
}

fn parse_push_endpoints(raw: &str) -> Result<Vec<PushTarget>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (topic, url) = entry.split_once('=').ok_or_else(|| {
                ConfigError::invalid_var("OUTBOX_PUSH_ENDPOINTS", entry, "expected topic=url")
            })?;
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(ConfigError::invalid_var(
                    "OUTBOX_PUSH_ENDPOINTS",
                    entry,
                    "empty topic",
                ));
            }
            Ok(PushTarget {
                topic: topic.to_string(),
                url: parse_url("OUTBOX_PUSH_ENDPOINTS", url)?,
            })
        })
        .collect()
}
