use super::{sidecar::Sidecar, valid_batch_name, valid_name, JobError, Status};
use crate::{
    backend::{Backend, BackendError, Submission},
    config::{ConfigError, JobConfig},
    shell::{quote, Shell},
};
use chrono::Utc;
use serde_yaml::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// log files a crashed job may have left behind, most telling first
const CRASH_LOGS: [&str; 2] = ["slurm.err", "run.log"];

/// A single shell command run to completion in its own directory.
///
/// The job carries no authoritative state. Everything below `status` is
/// re-derived from the directory and the backend on demand; `status` itself
/// is only the value of the last derivation, kept for display.
#[derive(Debug)]
pub struct ShellJob {
    name: String,
    batch: Option<String>,
    weight: f64,
    directory: PathBuf,
    command: String,
    inputs: Vec<PathBuf>,
    done_file: String,
    done_pattern: Option<String>,
    fix_command: Option<String>,
    pinned_node: Option<String>,
    node: Option<String>,
    pid: Option<u64>,
    status: Status,
}

impl ShellJob {
    pub fn new(workspace: &Path, config: &JobConfig) -> Result<Self, ConfigError> {
        if !valid_name(&config.name) {
            return Err(ConfigError::InvalidName(config.name.clone()));
        }
        if let Some(batch) = &config.batch {
            if !valid_batch_name(batch) {
                return Err(ConfigError::InvalidBatchName(batch.clone()));
            }
        }
        if !config.weight.is_finite() || config.weight <= 0.0 {
            return Err(ConfigError::InvalidWeight(config.name.clone(), config.weight));
        }

        let mut directory = workspace.to_path_buf();
        if let Some(batch) = &config.batch {
            directory.push(batch);
        }
        directory.push(&config.name);

        Ok(Self {
            name: config.name.clone(),
            batch: config.batch.clone(),
            weight: config.weight,
            directory,
            command: config.command.clone(),
            inputs: config.inputs.clone(),
            done_file: config.done_file.clone(),
            done_pattern: config.done_pattern.clone(),
            fix_command: config.fix_command.clone(),
            pinned_node: config.node.clone(),
            node: None,
            pid: None,
            status: Status::None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_name(&self) -> Option<&str> {
        self.batch.as_deref()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// the last derived status, not refreshed
    pub fn status(&self) -> Status {
        self.status
    }

    /// directory and all declared inputs exist
    pub fn is_prepared(&self) -> bool {
        self.directory.is_dir()
            && self.inputs.iter().all(|input| {
                input
                    .file_name()
                    .map(|name| self.directory.join(name).is_file())
                    .unwrap_or(false)
            })
    }

    /// the completion marker exists (and contains the pattern, if one is set)
    pub fn is_complete(&self) -> bool {
        if !self.is_prepared() {
            return false;
        }
        let marker = self.directory.join(&self.done_file);
        match &self.done_pattern {
            None => marker.is_file(),
            Some(pattern) => fs::read_to_string(marker)
                .map(|text| text.contains(pattern))
                .unwrap_or(false),
        }
    }

    /// a start record exists; loads (node, pid) into memory as a side effect
    pub fn is_started(&mut self) -> Result<bool, JobError> {
        if !self.is_prepared() {
            return Ok(false);
        }
        let sidecar = Sidecar::load(&self.directory).map_err(|source| JobError::Sidecar {
            path: Sidecar::path(&self.directory),
            source,
        })?;
        match sidecar {
            Some(sidecar) => {
                self.node = Some(sidecar.node);
                self.pid = Some(sidecar.pid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// the recorded pid shows up in the recorded node's process listing.
    ///
    /// A node the backend no longer knows is a hard error: treating it as
    /// "not running" would let a restart tear down a job that may well be
    /// alive out there.
    pub fn is_running(&mut self, backend: &Backend) -> Result<bool, JobError> {
        if !self.is_started()? {
            return Ok(false);
        }
        let (node, pid) = match (&self.node, self.pid) {
            (Some(node), Some(pid)) => (node.clone(), pid),
            _ => return Ok(false),
        };

        let listing = backend.processes(&node).map_err(|error| match error {
            BackendError::UnknownNode(node) => JobError::NodeVanished {
                name: self.name.clone(),
                node,
            },
            other => JobError::Backend(other),
        })?;
        Ok(listing.iter().any(|process| process.pid == pid))
    }

    /// derive the status from observation; completion wins over everything
    pub fn find_status(&mut self, backend: &Backend) -> Result<Status, JobError> {
        let status = if self.is_complete() {
            Status::Completed
        } else if self.is_started()? {
            if self.is_running(backend)? {
                Status::Running
            } else {
                Status::Crashed
            }
        } else if self.is_prepared() {
            Status::Prepared
        } else {
            Status::None
        };
        self.status = status;
        Ok(status)
    }

    /// create the directory and stage the inputs; 1 if work was done
    pub fn prepare(&mut self) -> Result<usize, JobError> {
        if self.is_prepared() {
            return Ok(0);
        }
        fs::create_dir_all(&self.directory).map_err(|source| JobError::Prepare {
            path: self.directory.clone(),
            source,
        })?;

        for input in self.inputs.clone() {
            let staged = input
                .file_name()
                .map(|name| self.directory.join(name))
                .ok_or_else(|| self.missing_input(&input))?;
            if let Err(error) = fs::copy(&input, &staged) {
                debug!(job = %self.name, error = ?error, "staging failed, dropping the half-made directory");
                let _ = fs::remove_dir_all(&self.directory);
                return Err(self.missing_input(&input));
            }
        }
        debug!(job = %self.name, "prepared in {}", self.directory.display());
        Ok(1)
    }

    fn missing_input(&self, input: &Path) -> JobError {
        JobError::MissingInput {
            name: self.name.clone(),
            path: input.to_path_buf(),
        }
    }

    /// launch on the given node and write the start record; 1 if launched
    pub fn start(
        &mut self,
        backend: &Backend,
        node: &str,
        force: bool,
    ) -> Result<usize, JobError> {
        let running = self.is_running(backend)?;
        if running || self.is_complete() {
            let status = if running {
                Status::Running
            } else {
                Status::Completed
            };
            if !force {
                warn!(job = %self.name, "already {status}, not starting it again without force");
                return Err(JobError::Active {
                    name: self.name.clone(),
                    status,
                });
            }
            if running {
                self.kill(backend)?;
            }
        }

        if !self.is_prepared() {
            self.prepare()?;
        }

        let submission = Submission {
            name: &self.name,
            batch: self.batch.as_deref(),
            directory: &self.directory,
            command: &self.command,
            weight: self.weight,
            node,
            pinned: self.pinned_node.as_deref(),
        };
        let pid = backend.submit(&submission)?;

        let sidecar = Sidecar {
            name: self.name.clone(),
            node: node.to_string(),
            pid,
            timestamp: Utc::now().timestamp(),
        };
        sidecar.save(&self.directory).map_err(|source| JobError::Sidecar {
            path: Sidecar::path(&self.directory),
            source,
        })?;
        self.node = Some(node.to_string());
        self.pid = Some(pid);

        info!(job = %self.name, node = %node, pid, "started");
        Ok(1)
    }

    /// best-effort stop of a running job; 1 if a cancel went out
    pub fn kill(&mut self, backend: &Backend) -> Result<usize, JobError> {
        if !self.is_running(backend)? {
            return Ok(0);
        }
        let (node, pid) = match (&self.node, self.pid) {
            (Some(node), Some(pid)) => (node.clone(), pid),
            _ => return Ok(0),
        };
        match backend.cancel(&node, pid) {
            Ok(()) => {
                info!(job = %self.name, node = %node, pid, "killed");
                Ok(1)
            }
            Err(error) => {
                warn!(job = %self.name, error = ?error, "cancel did not get through");
                Ok(0)
            }
        }
    }

    /// delete the working directory; refuses running/completed jobs
    /// unless forced
    pub fn cleanup(&mut self, backend: &Backend, force: bool) -> Result<usize, JobError> {
        if !force {
            let status = if self.is_complete() {
                Some(Status::Completed)
            } else if self.is_running(backend)? {
                Some(Status::Running)
            } else {
                None
            };
            if let Some(status) = status {
                return Err(JobError::Active {
                    name: self.name.clone(),
                    status,
                });
            }
        }

        self.node = None;
        self.pid = None;
        self.status = Status::None;
        if !self.directory.exists() {
            return Ok(0);
        }
        // the start record goes first, so a half-removed directory can
        // never look like a started job
        Sidecar::remove(&self.directory);
        if let Err(error) = fs::remove_dir_all(&self.directory) {
            warn!(job = %self.name, error = ?error, "directory only partially removed");
        }
        Ok(1)
    }

    /// run the configured repair command in the job directory; 1 on success
    pub fn fix(&self, shell: &Shell) -> Result<usize, JobError> {
        let command = match &self.fix_command {
            Some(command) => command,
            None => return Ok(0),
        };
        if !self.is_prepared() {
            return Ok(0);
        }
        let script = format!(
            "cd {}; {command}",
            quote(&self.directory.display().to_string())
        );
        match shell.run_on(None, &[script]) {
            Ok(_) => {
                debug!(job = %self.name, "fix command ran");
                Ok(1)
            }
            Err(error) => {
                warn!(job = %self.name, error = ?error, "fix command failed");
                Ok(0)
            }
        }
    }

    /// the parsed completion file, None unless complete
    pub fn result(&self) -> Option<Value> {
        if !self.is_complete() {
            return None;
        }
        let text = fs::read_to_string(self.directory.join(&self.done_file)).ok()?;
        match serde_yaml::from_str(&text) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(text)),
        }
    }

    /// last lines of whatever log the job left behind
    pub fn crash_reason(&self) -> Option<String> {
        for log in CRASH_LOGS {
            if let Ok(text) = fs::read_to_string(self.directory.join(log)) {
                let lines: Vec<&str> = text.lines().collect();
                let tail = lines[lines.len().saturating_sub(5)..].join("\n");
                if !tail.trim().is_empty() {
                    return Some(tail);
                }
            }
        }
        None
    }
}
