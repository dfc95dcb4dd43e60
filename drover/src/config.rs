use crate::{backend::BackendError, job};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Unreadable { path: PathBuf, source: io::Error },
    #[error("config is not valid yaml: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("job name '{0}' is not a valid name")]
    InvalidName(String),
    #[error("batch name '{0}' is not a valid batch name")]
    InvalidBatchName(String),
    #[error("job '{0}' has non-positive weight {1}")]
    InvalidWeight(String, f64),
    #[error("job name '{0}' is used more than once")]
    DuplicateName(String),
    #[error("pool backend needs at least one node")]
    NoNodes,
    #[error("sweep '{0}' needs at least one value in every parameter range")]
    EmptySweep(String),
    #[error("could not determine the local hostname: {0}")]
    Hostname(nix::Error),
    #[error("backend failed to load")]
    Backend(#[from] BackendError),
    #[error("config contains errors")]
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// root directory under which every job materializes its working directory
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    pub backend: BackendConfig,

    // polling and caching knobs, all in seconds
    #[serde(default = "default_process_ttl")]
    pub process_ttl_secs: u64,
    #[serde(default = "default_node_cache")]
    pub node_cache_secs: u64,
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Which backend runs the work, see the variants under `backend::`
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Pool {
        nodes: Vec<String>,
    },
    Batch {
        partition: String,
        #[serde(default = "default_time_limit")]
        time_limit: String,
    },
    Local,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub batch: Option<String>,

    /// the command started inside the job directory
    pub command: String,
    /// files copied into the job directory by prepare
    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    // completion is read off this file, optionally checked for a marker text
    #[serde(default = "default_done_file")]
    pub done_file: String,
    #[serde(default)]
    pub done_pattern: Option<String>,

    /// optional repair command run locally in the job directory
    #[serde(default)]
    pub fix_command: Option<String>,
    /// optional node pin, honored by the batch backend
    #[serde(default)]
    pub node: Option<String>,

    /// expand this entry into one child job per parameter combination
    #[serde(default)]
    pub sweep: Option<SweepConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    pub ranges: BTreeMap<String, Vec<serde_yaml::Value>>,
    /// name template with `{parameter}` placeholders; default is the sorted
    /// parameter parts appended to the job name
    #[serde(default)]
    pub name_template: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&text)?;

        if config.preflight_checks() {
            Err(ConfigError::Invalid)
        } else {
            Ok(config)
        }
    }

    /// attempt to catch all config problems in one pass instead of
    /// piece-by-piece, to make debugging easier for users
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if let BackendConfig::Pool { nodes } = &self.backend {
            if nodes.is_empty() {
                error!("backend.nodes is empty, a pool without nodes cannot run anything");
                contains_error = true;
            }
        }

        for knob in [
            ("remote_timeout_secs", self.remote_timeout_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
        ] {
            if knob.1 == 0 {
                error!("{} cannot be 0", knob.0);
                contains_error = true;
            }
        }

        let mut seen = Vec::new();
        for config in self.jobs.iter() {
            if !job::valid_name(&config.name) {
                error!(
                    "jobs.{}.name contains characters outside of [a-zA-Z0-9_./+-]",
                    config.name
                );
                contains_error = true;
            }

            if let Some(batch) = &config.batch {
                if !job::valid_batch_name(batch) {
                    error!("jobs.{}.batch '{batch}' is not a valid batch name", config.name);
                    contains_error = true;
                }
            }

            if !(config.weight > 0.0) || !config.weight.is_finite() {
                error!(
                    "jobs.{}.weight must be a positive finite number, not {}",
                    config.name, config.weight
                );
                contains_error = true;
            }

            if seen.contains(&&config.name) {
                error!("jobs.{}.name is used more than once", config.name);
                contains_error = true;
            }
            seen.push(&config.name);

            if let Some(sweep) = &config.sweep {
                if sweep.ranges.is_empty() || sweep.ranges.values().any(|range| range.is_empty()) {
                    error!(
                        "jobs.{}.sweep.ranges must contain at least one value per parameter",
                        config.name
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_workspace() -> PathBuf {
    if let Some(dir) = env::var_os("DROVER_WORKSPACE") {
        return PathBuf::from(dir);
    }
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("drover"),
        None => PathBuf::from("drover"),
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_done_file() -> String {
    "result.txt".to_string()
}

fn default_time_limit() -> String {
    // days-hours:minutes:seconds, the sbatch syntax
    "03-00:00:00".to_string()
}

fn default_process_ttl() -> u64 {
    3
}

fn default_node_cache() -> u64 {
    600
}

fn default_remote_timeout() -> u64 {
    30
}

fn default_monitor_interval() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse(
            "backend:\n  kind: local\njobs:\n  - name: fit\n    command: ./run.sh\n",
        )
        .unwrap();

        assert_eq!(config.process_ttl_secs, 3);
        assert_eq!(config.node_cache_secs, 600);
        assert_eq!(config.monitor_interval_secs, 5);
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].weight, 1.0);
        assert_eq!(config.jobs[0].done_file, "result.txt");
        assert!(config.jobs[0].sweep.is_none());
        assert!(!config.preflight_checks());
    }

    #[test]
    fn backend_variants_parse() {
        let pool = parse("backend:\n  kind: pool\n  nodes: [n1, n2]\n").unwrap();
        match pool.backend {
            BackendConfig::Pool { nodes } => assert_eq!(nodes, vec!["n1", "n2"]),
            other => panic!("expected a pool backend, got {other:?}"),
        }

        let batch = parse("backend:\n  kind: batch\n  partition: compute\n").unwrap();
        match batch.backend {
            BackendConfig::Batch { partition, time_limit } => {
                assert_eq!(partition, "compute");
                assert_eq!(time_limit, "03-00:00:00");
            }
            other => panic!("expected a batch backend, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected_for_jobs() {
        let result = parse(
            "backend:\n  kind: local\njobs:\n  - name: fit\n    command: x\n    typo_field: 1\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn preflight_flags_bad_jobs() {
        let config = parse(
            "backend:\n  kind: pool\n  nodes: []\njobs:\n  - name: 'bad name'\n    command: x\n    weight: -2\n  - name: ok\n    command: x\n  - name: ok\n    command: x\n",
        )
        .unwrap();
        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_flags_empty_sweep_range() {
        let config = parse(
            "backend:\n  kind: local\njobs:\n  - name: scan\n    command: x\n    sweep:\n      ranges: {a: []}\n",
        )
        .unwrap();
        assert!(config.preflight_checks());
    }
}
