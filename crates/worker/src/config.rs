use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use manga_core::paths::{PathRewrite, StorageLayout};
use manga_pipeline::SupervisorConfig;
use manga_queue::{DispatcherConfig, LaneWeights, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration loaded from environment variables.
///
/// | Env Var                  | Default                |
/// |--------------------------|------------------------|
/// | `DATABASE_URL`           | required               |
/// | `DB_MAX_CONNECTIONS`     | `20`                   |
/// | `WORKER_PROGRAM`         | `python`               |
/// | `WORKER_SCRIPT`          | `../ai-worker/main.py` |
/// | `WORKER_DIR`             | `../ai-worker`         |
/// | `WORKER_CONCURRENCY`     | `1`                    |
/// | `WORKER_TIMEOUT_SECS`    | `600` (`0` = none)     |
/// | `STORAGE_PATH`           | `./storage`            |
/// | `STORAGE_CONTAINER_PATH` | unset                  |
/// | `QUEUE_POLL_INTERVAL_MS` | `1000`                 |
/// | `QUEUE_MAX_ATTEMPTS`     | `3`                    |
/// | `QUEUE_LEASE_SECS`       | `60`                   |
/// | `QUEUE_CRITICAL_WEIGHT`  | `6`                    |
/// | `QUEUE_DEFAULT_WEIGHT`   | `3`                    |
/// | `SHUTDOWN_GRACE_SECS`    | `30`                   |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub worker_program: String,
    /// `None` when `WORKER_SCRIPT` is set but empty.
    pub worker_script: Option<PathBuf>,
    pub worker_dir: PathBuf,
    pub concurrency: usize,
    pub worker_timeout: Option<Duration>,
    pub storage_path: PathBuf,
    pub storage_container_path: Option<String>,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub lease: Duration,
    pub critical_weight: u32,
    pub default_weight: u32,
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let database_url = env
            .get("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let worker_script = match lookup("WORKER_SCRIPT") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(PathBuf::from(value)),
            None => Some(PathBuf::from("../ai-worker/main.py")),
        };

        let timeout_secs: u64 = env.parse("WORKER_TIMEOUT_SECS", 600)?;

        Ok(Self {
            database_url,
            db_max_connections: env.positive("DB_MAX_CONNECTIONS", 20)?,
            worker_program: env
                .get("WORKER_PROGRAM")
                .unwrap_or_else(|| "python".into()),
            worker_script,
            worker_dir: env
                .get("WORKER_DIR")
                .map_or_else(|| PathBuf::from("../ai-worker"), PathBuf::from),
            concurrency: env.positive("WORKER_CONCURRENCY", 1)?,
            worker_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            storage_path: env
                .get("STORAGE_PATH")
                .map_or_else(|| PathBuf::from("./storage"), PathBuf::from),
            storage_container_path: env.get("STORAGE_CONTAINER_PATH"),
            poll_interval: Duration::from_millis(env.positive("QUEUE_POLL_INTERVAL_MS", 1000)?),
            max_attempts: env.positive("QUEUE_MAX_ATTEMPTS", 3)?,
            lease: Duration::from_secs(env.positive("QUEUE_LEASE_SECS", 60)?),
            critical_weight: env.positive("QUEUE_CRITICAL_WEIGHT", 6)?,
            default_weight: env.positive("QUEUE_DEFAULT_WEIGHT", 3)?,
            shutdown_grace: Duration::from_secs(env.parse("SHUTDOWN_GRACE_SECS", 30)?),
        })
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::new(&self.storage_path)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let rewrite = PathRewrite::new(self.storage_container_path.as_deref(), &self.storage_path);
        SupervisorConfig {
            program: self.worker_program.clone(),
            script: self.worker_script.clone(),
            working_dir: self.worker_dir.clone(),
            scratch_root: self.storage_layout().scratch_root(),
            timeout: self.worker_timeout,
            path_mapper: rewrite.into_mapper(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            lease: self.lease,
            weights: LaneWeights {
                critical: self.critical_weight,
                default: self.default_weight,
            },
            retry: RetryPolicy::default(),
            shutdown_grace: self.shutdown_grace,
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Trimmed value; empty counts as unset.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn positive<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(var, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                var,
                value: value.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    const DB: (&str, &str) = ("DATABASE_URL", "postgres://localhost/manga");

    #[test]
    fn defaults_apply() {
        let config = load(&[DB]).unwrap();

        assert_eq!(config.db_max_connections, 20);
        assert_eq!(config.worker_program, "python");
        assert_eq!(config.worker_script, Some(PathBuf::from("../ai-worker/main.py")));
        assert_eq!(config.worker_dir, PathBuf::from("../ai-worker"));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.worker_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.storage_path, PathBuf::from("./storage"));
        assert_eq!(config.storage_container_path, None);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.lease, Duration::from_secs(60));
        assert_eq!((config.critical_weight, config.default_weight), (6, 3));
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn database_url_is_required() {
        assert_matches!(load(&[]), Err(ConfigError::Missing("DATABASE_URL")));
        assert_matches!(
            load(&[("DATABASE_URL", "  ")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = load(&[DB, ("WORKER_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.worker_timeout, None);
    }

    #[test]
    fn empty_script_means_none() {
        let config = load(&[DB, ("WORKER_SCRIPT", ""), ("WORKER_PROGRAM", "/opt/translate")]).unwrap();
        assert_eq!(config.worker_script, None);
        assert_eq!(config.supervisor_config().program, "/opt/translate");
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[DB, ("WORKER_CONCURRENCY", "many")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { var: "WORKER_CONCURRENCY", .. });

        let err = load(&[DB, ("QUEUE_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { var: "QUEUE_MAX_ATTEMPTS", .. });
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn container_path_is_rewritten_for_the_worker() {
        let config = load(&[
            DB,
            ("STORAGE_PATH", "/srv/storage"),
            ("STORAGE_CONTAINER_PATH", "/app/storage"),
        ])
        .unwrap();

        let supervisor = config.supervisor_config();
        assert_eq!(
            (supervisor.path_mapper)("/app/storage/uploads/x/ch1.zip"),
            PathBuf::from("/srv/storage/uploads/x/ch1.zip")
        );
        assert_eq!(supervisor.scratch_root, PathBuf::from("/srv/storage/temp"));
    }

    #[test]
    fn dispatcher_config_carries_queue_settings() {
        let config = load(&[
            DB,
            ("WORKER_CONCURRENCY", "4"),
            ("QUEUE_LEASE_SECS", "90"),
            ("QUEUE_CRITICAL_WEIGHT", "2"),
            ("QUEUE_DEFAULT_WEIGHT", "1"),
        ])
        .unwrap();

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.concurrency, 4);
        assert_eq!(dispatcher.lease, Duration::from_secs(90));
        assert_eq!(dispatcher.weights.critical, 2);
        assert_eq!(dispatcher.weights.default, 1);
    }
}
