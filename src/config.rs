//! Configuration types.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks older than this are dropped without side effects.
    pub freshness_window: Duration,
    /// Upper bound on reading the reply stream once it is open.
    pub stream_deadline: Duration,
    /// Attempt budget handed to the backend's request fix-up.
    pub fixup_attempts: usize,
    /// Maximum number of tasks executed concurrently.
    pub max_parallel_jobs: usize,
    /// Model id -> billing model id overrides.
    pub fee_aliases: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(15 * 60),
            stream_deadline: Duration::from_secs(120),
            fixup_attempts: 5,
            max_parallel_jobs: 10,
            fee_aliases: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from `GROUP_CHAT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let freshness_window = match parse_var::<u64>(&get, "GROUP_CHAT_FRESHNESS_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => defaults.freshness_window,
        };
        let stream_deadline = match parse_var::<u64>(&get, "GROUP_CHAT_STREAM_DEADLINE_SECS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "GROUP_CHAT_STREAM_DEADLINE_SECS".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.stream_deadline,
        };
        let fixup_attempts =
            parse_var(&get, "GROUP_CHAT_FIXUP_ATTEMPTS")?.unwrap_or(defaults.fixup_attempts);
        let max_parallel_jobs = match parse_var::<usize>(&get, "GROUP_CHAT_MAX_PARALLEL_JOBS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "GROUP_CHAT_MAX_PARALLEL_JOBS".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            Some(n) => n,
            None => defaults.max_parallel_jobs,
        };
        let fee_aliases = match get("GROUP_CHAT_FEE_ALIASES") {
            Some(raw) => parse_aliases(&raw)?,
            None => HashMap::new(),
        };

        Ok(Self {
            freshness_window,
            stream_deadline,
            fixup_attempts,
            max_parallel_jobs,
            fee_aliases,
        })
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

/// Parse `model=billing_model` pairs separated by commas.
fn parse_aliases(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                Ok((from.trim().to_string(), to.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "GROUP_CHAT_FEE_ALIASES".to_string(),
                message: format!("expected model=billing_model, got {pair:?}"),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = WorkerConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.freshness_window, Duration::from_secs(900));
        assert_eq!(config.stream_deadline, Duration::from_secs(120));
        assert_eq!(config.fixup_attempts, 5);
        assert_eq!(config.max_parallel_jobs, 10);
        assert!(config.fee_aliases.is_empty());
    }

    #[test]
    fn overrides_and_aliases() {
        let config = WorkerConfig::from_vars(vars(&[
            ("GROUP_CHAT_STREAM_DEADLINE_SECS", "30"),
            ("GROUP_CHAT_FIXUP_ATTEMPTS", "3"),
            ("GROUP_CHAT_FEE_ALIASES", "house-model=gpt-4, cheap = gpt-3.5-turbo ,"),
        ]))
        .unwrap();
        assert_eq!(config.stream_deadline, Duration::from_secs(30));
        assert_eq!(config.fixup_attempts, 3);
        assert_eq!(config.fee_aliases["house-model"], "gpt-4");
        assert_eq!(config.fee_aliases["cheap"], "gpt-3.5-turbo");
    }

    #[test]
    fn rejects_garbage() {
        let err = WorkerConfig::from_vars(vars(&[("GROUP_CHAT_FRESHNESS_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "GROUP_CHAT_FRESHNESS_SECS"
        ));

        assert!(WorkerConfig::from_vars(vars(&[("GROUP_CHAT_MAX_PARALLEL_JOBS", "0")])).is_err());
        assert!(WorkerConfig::from_vars(vars(&[("GROUP_CHAT_FEE_ALIASES", "gpt-4")])).is_err());
    }
}
