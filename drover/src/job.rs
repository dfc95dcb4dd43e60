pub mod shell;
pub mod sidecar;
pub mod sweep;

pub use self::shell::ShellJob;
pub use self::sweep::SweepJob;

use crate::{
    backend::{Backend, BackendError},
    config::{ConfigError, JobConfig},
    shell::Shell,
};
use serde_yaml::Value;
use std::{
    collections::BTreeSet,
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {name} needs input {path}, which does not exist")]
    MissingInput { name: String, path: PathBuf },
    #[error("could not prepare {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
    #[error("job {name} is {status}, not touching it without force")]
    Active { name: String, status: Status },
    #[error("job {name} was started on {node}, which the backend no longer knows")]
    NodeVanished { name: String, node: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("start record {path} is damaged: {source}")]
    Sidecar { path: PathBuf, source: io::Error },
}

/// What a job is currently doing, as far as the environment can tell.
///
/// The variants sort in display order, which also reflects progress:
/// crashed jobs surface first, completed jobs last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Crashed,
    None,
    Prepared,
    Running,
    Completed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Crashed,
        Status::None,
        Status::Prepared,
        Status::Running,
        Status::Completed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Status::Crashed => "crashed",
            Status::None => "nothing",
            Status::Prepared => "prepared",
            Status::Running => "running",
            Status::Completed => "completed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

/// Job names end up as directory names and in remote command lines, so the
/// charset is kept narrow: an alphanumeric or underscore first, then
/// alphanumerics and `_ . / + -`.
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '+' | '-'))
}

/// Batch names additionally become single path components, so no `/`,
/// and no `+` since they also feed scheduler job names.
pub fn valid_batch_name(name: &str) -> bool {
    valid_name(name) && !name.contains('/') && !name.contains('+')
}

/// A queue entry: either one shell command or a sweep that fans out into
/// many. All operations dispatch to the concrete kind.
#[derive(Debug)]
pub enum Jobs {
    Shell(ShellJob),
    Sweep(SweepJob),
}

impl Jobs {
    pub fn name(&self) -> &str {
        match self {
            Jobs::Shell(job) => job.name(),
            Jobs::Sweep(job) => job.name(),
        }
    }

    pub fn batch_name(&self) -> Option<&str> {
        match self {
            Jobs::Shell(job) => job.batch_name(),
            Jobs::Sweep(job) => job.batch_name(),
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Jobs::Shell(job) => job.weight(),
            Jobs::Sweep(job) => job.weight(),
        }
    }

    /// the last derived status, without refreshing it
    pub fn status(&self) -> Status {
        match self {
            Jobs::Shell(job) => job.status(),
            Jobs::Sweep(job) => job.status(),
        }
    }

    pub fn find_status(&mut self, backend: &Backend) -> Result<Status, JobError> {
        match self {
            Jobs::Shell(job) => job.find_status(backend),
            Jobs::Sweep(job) => job.find_status(backend),
        }
    }

    pub fn prepare(&mut self) -> Result<usize, JobError> {
        match self {
            Jobs::Shell(job) => job.prepare(),
            Jobs::Sweep(job) => job.prepare(),
        }
    }

    pub fn start(
        &mut self,
        backend: &Backend,
        node: &str,
        force: bool,
    ) -> Result<usize, JobError> {
        match self {
            Jobs::Shell(job) => job.start(backend, node, force),
            Jobs::Sweep(job) => job.start(backend, node, force),
        }
    }

    pub fn kill(&mut self, backend: &Backend) -> Result<usize, JobError> {
        match self {
            Jobs::Shell(job) => job.kill(backend),
            Jobs::Sweep(job) => job.kill(backend),
        }
    }

    pub fn cleanup(&mut self, backend: &Backend, force: bool) -> Result<usize, JobError> {
        match self {
            Jobs::Shell(job) => job.cleanup(backend, force),
            Jobs::Sweep(job) => job.cleanup(backend, force),
        }
    }

    pub fn fix(&self, shell: &Shell) -> Result<usize, JobError> {
        match self {
            Jobs::Shell(job) => job.fix(shell),
            Jobs::Sweep(job) => job.fix(shell),
        }
    }

    pub fn result(&self) -> Option<Value> {
        match self {
            Jobs::Shell(job) => job.result(),
            Jobs::Sweep(job) => job.result(),
        }
    }

    /// a short account of what went wrong, based on the cached status
    pub fn crash_report(&self) -> Option<String> {
        match self {
            Jobs::Shell(job) => (job.status() == Status::Crashed).then(|| {
                job.crash_reason()
                    .unwrap_or_else(|| "left no logs behind".to_string())
            }),
            Jobs::Sweep(job) => job.crash_report(),
        }
    }
}

/// Turn the configured entries into jobs, expanding sweeps, and make sure
/// no two jobs (sweep children included) claim the same name.
pub fn build_jobs(workspace: &Path, configs: &[JobConfig]) -> Result<Vec<Jobs>, ConfigError> {
    let mut jobs = Vec::with_capacity(configs.len());
    let mut names: BTreeSet<String> = BTreeSet::new();

    for config in configs {
        let job = match &config.sweep {
            Some(sweep) => Jobs::Sweep(SweepJob::new(workspace, config, sweep)?),
            None => Jobs::Shell(ShellJob::new(workspace, config)?),
        };

        let mut claimed = vec![job.name().to_string()];
        if let Jobs::Sweep(sweep) = &job {
            claimed.extend(sweep.children().iter().map(|child| child.name().to_string()));
        }
        for name in claimed {
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateName(name));
            }
        }

        jobs.push(job);
    }

    debug!("built {} jobs from {} config entries", jobs.len(), configs.len());
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[rstest]
    #[case::simple("run", true)]
    #[case::underscore_first("_hidden", true)]
    #[case::rich("a1/b.2+c-3_d", true)]
    #[case::dot_first(".run", false)]
    #[case::dash_first("-run", false)]
    #[case::space("run it", false)]
    #[case::quote("run'", false)]
    #[case::empty("", false)]
    fn job_name_charset(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(valid_name(name), ok, "{name:?}");
    }

    #[rstest]
    #[case::simple("survey", true)]
    #[case::dotted("survey.v2", true)]
    #[case::slash("a/b", false)]
    #[case::plus("a+b", false)]
    fn batch_name_charset(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(valid_batch_name(name), ok, "{name:?}");
    }

    #[test]
    fn statuses_sort_crashed_first_completed_last() {
        let mut shuffled = vec![
            Status::Completed,
            Status::Prepared,
            Status::Crashed,
            Status::Running,
            Status::None,
        ];
        shuffled.sort();
        assert_eq!(shuffled, Status::ALL);
        assert_eq!(Status::None.label(), "nothing");
        assert_eq!(Status::Crashed.to_string(), "crashed");
    }

    fn entry(name: &str) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            weight: 1.0,
            batch: None,
            command: "true".to_string(),
            inputs: Vec::new(),
            done_file: "result.txt".to_string(),
            done_pattern: None,
            fix_command: None,
            node: None,
            sweep: None,
        }
    }

    #[test]
    fn building_expands_sweeps_and_keeps_plain_jobs() {
        let workspace = TempDir::new().unwrap();
        let mut scan = entry("scan");
        scan.sweep = Some(crate::config::SweepConfig {
            ranges: BTreeMap::from([("n".to_string(), vec![1.into(), 2.into()])]),
            name_template: None,
        });

        let jobs = build_jobs(workspace.path(), &[entry("fit"), scan]).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name(), "fit");
        assert_eq!(jobs[1].name(), "scan");
        assert_eq!(jobs[1].weight(), 2.0);
    }

    #[test]
    fn duplicate_names_are_rejected_across_sweep_children() {
        let workspace = TempDir::new().unwrap();
        let mut scan = entry("scan");
        scan.sweep = Some(crate::config::SweepConfig {
            ranges: BTreeMap::from([("n".to_string(), vec![1.into()])]),
            name_template: None,
        });
        // collides with the sweep child scan__n01
        let squatter = entry("scan__n01");

        match build_jobs(workspace.path(), &[scan, squatter]) {
            Err(ConfigError::DuplicateName(name)) => assert_eq!(name, "scan__n01"),
            other => panic!("expected a duplicate name error, got {other:?}"),
        }
    }
}
