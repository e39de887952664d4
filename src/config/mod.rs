//! Daemon configuration.
//!
//! Priority (highest to lowest):
//!   1. CLI / env — passed as `Some(value)` from clap
//!   2. TOML config file (`--config <path>`)
//!   3. Built-in defaults

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_KILL_GRACE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("repo_dir is required (--repo, VIGILD_REPO, or repo_dir in the config file)")]
    MissingRepoDir,
    #[error(
        "validation_command is required (--command, VIGILD_COMMAND, or validation_command in the config file)"
    )]
    MissingCommand,
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
    #[error("repo directory does not exist: {0}")]
    RepoDirMissing(PathBuf),
    #[error("validation command not found: {0}")]
    CommandMissing(PathBuf),
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Resolved daemon configuration. Read once at startup; not hot-reloadable.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Local clone of the repository to watch.
    pub repo_dir: PathBuf,
    /// Branch tracked for new commits.
    pub branch: String,
    /// Command run against every changed file; the file path is appended as
    /// the last argument. Split on whitespace: first token is the program.
    pub validation_command: String,
    /// Maximum concurrently running validations.
    pub max_concurrent: usize,
    /// How often the watcher fetches and diffs the remote branch.
    pub poll_interval: Duration,
    /// Controller cycle interval (reap/preempt/admit cadence).
    pub tick_interval: Duration,
    /// How long a terminated worker may linger before SIGKILL.
    pub kill_grace: Duration,
    /// SSH identity passed to `git fetch` via GIT_SSH_COMMAND.
    pub ssh_key: Option<PathBuf>,
    /// Log level filter string, e.g. "debug" or "info,vigild=trace".
    pub log: String,
    /// Optional log file (rotated daily); stderr-only when unset.
    pub log_file: Option<PathBuf>,
}

/// TOML config file — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    repo_dir: Option<PathBuf>,
    branch: Option<String>,
    validation_command: Option<String>,
    max_concurrent: Option<usize>,
    poll_interval_secs: Option<u64>,
    tick_interval_ms: Option<u64>,
    kill_grace_secs: Option<u64>,
    ssh_key: Option<PathBuf>,
    log: Option<String>,
}

/// CLI/env values from clap; `Some` beats the TOML file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub repo_dir: Option<PathBuf>,
    pub branch: Option<String>,
    pub validation_command: Option<String>,
    pub max_concurrent: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub ssh_key: Option<PathBuf>,
    pub log: Option<String>,
    pub log_file: Option<PathBuf>,
}

fn load_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl DaemonConfig {
    /// Build config from CLI/env overrides + an optional TOML file, then
    /// validate. Unlike most settings, `repo_dir` and `validation_command`
    /// have no default — the daemon refuses to start without them.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let toml = match config_path {
            Some(path) => load_toml(path)?,
            None => TomlConfig::default(),
        };

        let repo_dir = overrides
            .repo_dir
            .or(toml.repo_dir)
            .ok_or(ConfigError::MissingRepoDir)?;
        let validation_command = overrides
            .validation_command
            .filter(|s| !s.trim().is_empty())
            .or(toml.validation_command)
            .ok_or(ConfigError::MissingCommand)?;

        let config = Self {
            repo_dir,
            branch: overrides
                .branch
                .or(toml.branch)
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            validation_command,
            max_concurrent: overrides
                .max_concurrent
                .or(toml.max_concurrent)
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            poll_interval: Duration::from_secs(
                overrides
                    .poll_interval_secs
                    .or(toml.poll_interval_secs)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            tick_interval: Duration::from_millis(
                toml.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
            kill_grace: Duration::from_secs(
                toml.kill_grace_secs.unwrap_or(DEFAULT_KILL_GRACE_SECS),
            ),
            ssh_key: overrides.ssh_key.or(toml.ssh_key),
            log: overrides
                .log
                .or(toml.log)
                .unwrap_or_else(|| "info".to_string()),
            log_file: overrides.log_file,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_concurrent",
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "poll_interval_secs",
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "tick_interval_ms",
            });
        }
        if !self.repo_dir.is_dir() {
            return Err(ConfigError::RepoDirMissing(self.repo_dir.clone()));
        }
        // When the command names a concrete path, fail fast instead of
        // producing a launch failure for every changed file later.
        if let Some(program) = self.validation_command.split_whitespace().next() {
            if program.contains(std::path::MAIN_SEPARATOR) && !Path::new(program).is_file() {
                return Err(ConfigError::CommandMissing(PathBuf::from(program)));
            }
        }
        Ok(())
    }
}
