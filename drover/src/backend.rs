pub mod batch;
pub mod cache;
pub mod local;
pub mod pool;

use crate::{
    config::{BackendConfig, Config, ConfigError},
    shell::{quote, Shell, ShellError},
};
use batch::BatchBackend;
use cache::{NodeCache, DEFAULT_CACHE_DIR};
use local::LocalBackend;
use parking_lot::Mutex;
use pool::PoolBackend;
use std::{
    collections::BTreeMap,
    path::Path,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("node {node} is not reachable: {source}")]
    Unreachable { node: String, source: ShellError },
    #[error("node {0} is not part of this backend")]
    UnknownNode(String),
    #[error("no node answered the availability probe")]
    NoNodes,
    #[error("submission on {node} returned no usable id: {output:?}")]
    BadSubmission { node: String, output: String },
    #[error("scheduler tools are not usable: {0}")]
    SchedulerDown(ShellError),
    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// one entry of a node's process or queue listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProcess {
    pub pid: u64,
    pub user: String,
    pub name: String,
}

/// everything a backend needs to launch one job
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    pub name: &'a str,
    pub batch: Option<&'a str>,
    pub directory: &'a Path,
    pub command: &'a str,
    pub weight: f64,
    pub node: &'a str,
    /// hard node pin, only honored by the batch backend
    pub pinned: Option<&'a str>,
}

enum BackendKind {
    Pool(PoolBackend),
    Batch(BatchBackend),
    Local(LocalBackend),
}

/// Where jobs actually run: node listing, capacity estimates, process
/// listings, submit and cancel, with the concrete flavor picked once from
/// the config.
///
/// Process listings are cached per node for a few seconds so a burst of
/// status queries does not turn into a burst of remote calls.
pub struct Backend {
    kind: BackendKind,
    shell: Shell,
    process_ttl: Duration,
    listings: Mutex<BTreeMap<String, (Instant, Vec<RemoteProcess>)>>,
}

impl Backend {
    pub fn load(config: &Config) -> Result<Self, ConfigError> {
        let shell = Shell::new(Duration::from_secs(config.remote_timeout_secs));

        let kind = match &config.backend {
            BackendConfig::Pool { nodes } => {
                if nodes.is_empty() {
                    return Err(ConfigError::NoNodes);
                }
                BackendKind::Pool(PoolBackend {
                    nodes: nodes.clone(),
                    cache: NodeCache::new(
                        DEFAULT_CACHE_DIR.clone(),
                        Duration::from_secs(config.node_cache_secs),
                    ),
                })
            }
            BackendConfig::Batch {
                partition,
                time_limit,
            } => {
                let backend = BatchBackend {
                    partition: partition.clone(),
                    time_limit: time_limit.clone(),
                };
                backend.check(&shell)?;
                BackendKind::Batch(backend)
            }
            BackendConfig::Local => BackendKind::Local(LocalBackend::load()?),
        };

        Ok(Self {
            kind,
            shell,
            process_ttl: Duration::from_secs(config.process_ttl_secs),
            listings: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    /// every node this backend could run work on
    pub fn nodes(&self) -> Vec<String> {
        match &self.kind {
            BackendKind::Pool(pool) => pool.nodes.clone(),
            BackendKind::Batch(batch) => vec![batch.partition.clone()],
            BackendKind::Local(local) => vec![local.hostname.clone()],
        }
    }

    /// nodes with their free slots, served from the snapshot when fresh
    pub fn availability(&self) -> Result<(Vec<String>, Vec<f64>), BackendError> {
        match &self.kind {
            BackendKind::Pool(pool) => pool.availability(&self.shell),
            BackendKind::Batch(batch) => {
                // the scheduler owns packing, we pretend it is one huge node
                Ok((vec![batch.partition.clone()], vec![f64::INFINITY]))
            }
            BackendKind::Local(local) => {
                Ok((vec![local.hostname.clone()], vec![local.capacity()]))
            }
        }
    }

    /// drop any snapshot and probe again
    pub fn refresh_availability(&self) -> Result<(Vec<String>, Vec<f64>), BackendError> {
        if let BackendKind::Pool(pool) = &self.kind {
            pool.cache.clear();
        }
        self.availability()
    }

    /// the node's current process (or queue) listing
    pub fn processes(&self, node: &str) -> Result<Vec<RemoteProcess>, BackendError> {
        {
            let listings = self.listings.lock();
            if let Some((stamp, listing)) = listings.get(node) {
                if stamp.elapsed() <= self.process_ttl {
                    return Ok(listing.clone());
                }
            }
        }

        if !self.nodes().iter().any(|known| known == node) {
            return Err(BackendError::UnknownNode(node.to_string()));
        }

        let listing = match &self.kind {
            BackendKind::Pool(_) => {
                let blocks = self
                    .shell
                    .run_on(Some(node), &["ps ux".to_string()])
                    .map_err(|source| BackendError::Unreachable {
                        node: node.to_string(),
                        source,
                    })?;
                parse_ps(blocks.first().map(String::as_str).unwrap_or(""))
            }
            BackendKind::Local(_) => {
                let blocks = self.shell.run_on(None, &["ps ux".to_string()])?;
                parse_ps(blocks.first().map(String::as_str).unwrap_or(""))
            }
            BackendKind::Batch(batch) => batch.processes(&self.shell)?,
        };
        debug!(node = %node, "{} processes listed", listing.len());

        self.listings
            .lock()
            .insert(node.to_string(), (Instant::now(), listing.clone()));
        Ok(listing)
    }

    /// seed the process listing cache directly; used by bulk refreshes and
    /// by tests that stand in for a live node
    pub fn prime_processes(&self, node: &str, listing: Vec<RemoteProcess>) {
        self.listings
            .lock()
            .insert(node.to_string(), (Instant::now(), listing));
    }

    /// launch a job, returning an opaque handle for `cancel`
    pub fn submit(&self, submission: &Submission) -> Result<u64, BackendError> {
        match &self.kind {
            BackendKind::Pool(_) => {
                let command = nohup_command(submission);
                let blocks = self
                    .shell
                    .run_on(Some(submission.node), &[command])
                    .map_err(|source| BackendError::Unreachable {
                        node: submission.node.to_string(),
                        source,
                    })?;
                parse_launched_pid(&blocks, submission.node)
            }
            BackendKind::Local(_) => {
                let command = nohup_command(submission);
                let blocks = self.shell.run_on(None, &[command])?;
                parse_launched_pid(&blocks, submission.node)
            }
            BackendKind::Batch(batch) => {
                let command = batch.submit_command(submission);
                let blocks = self
                    .shell
                    .run_on(None, &[command])
                    .map_err(BackendError::SchedulerDown)?;
                let output = blocks.first().map(String::as_str).unwrap_or("");
                batch::parse_submission_id(output).ok_or_else(|| BackendError::BadSubmission {
                    node: submission.node.to_string(),
                    output: output.to_string(),
                })
            }
        }
    }

    /// best-effort remote stop; the next poll is the only confirmation
    pub fn cancel(&self, node: &str, handle: u64) -> Result<(), BackendError> {
        let command = match &self.kind {
            BackendKind::Batch(_) => format!("scancel {handle}"),
            _ => format!("kill {handle}"),
        };
        match &self.kind {
            BackendKind::Pool(_) => self
                .shell
                .run_on(Some(node), &[command])
                .map(|_| ())
                .map_err(|source| BackendError::Unreachable {
                    node: node.to_string(),
                    source,
                }),
            _ => Ok(self.shell.run_on(None, &[command]).map(|_| ())?),
        }
    }
}

/// detach the command in its directory and report the pid
fn nohup_command(submission: &Submission) -> String {
    format!(
        "cd {directory}; nohup bash -c {command} > run.log 2>&1 & echo $!",
        directory = quote(&submission.directory.display().to_string()),
        command = quote(submission.command),
    )
}

fn parse_launched_pid(blocks: &[String], node: &str) -> Result<u64, BackendError> {
    let output = blocks.first().map(String::as_str).unwrap_or("");
    output
        .lines()
        .last()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(|| BackendError::BadSubmission {
            node: node.to_string(),
            output: output.to_string(),
        })
}

/// turn `ps ux` output into processes, dropping the noise every login shell
/// brings along
pub fn parse_ps(output: &str) -> Vec<RemoteProcess> {
    let mut processes = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 11 {
            continue;
        }
        let pid = match fields[1].parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let name = fields[10..].join(" ");
        if name == "-bash" || name == "ps ux" || name.starts_with("sshd:") {
            continue;
        }
        processes.push(RemoteProcess {
            pid,
            user: fields[0].to_string(),
            name,
        });
    }
    processes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn local_config() -> Config {
        serde_yaml::from_str("backend:\n  kind: local\n").unwrap()
    }

    #[test]
    fn ps_listing_drops_shell_noise() {
        let output = "USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND\n\
                      me 4001 0.0 0.1 1000 200 pts/0 Ss 10:00 0:00 -bash\n\
                      me 4002 1.0 0.1 1000 200 ? S 10:01 0:02 bash -c ./run.sh --fast\n\
                      root 77 0.0 0.0 900 100 ? Ss 09:00 0:00 sshd: me [priv]\n\
                      me 4003 0.0 0.0 800 90 pts/0 R+ 10:02 0:00 ps ux\n";
        let processes = parse_ps(output);
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 4002);
        assert_eq!(processes[0].name, "bash -c ./run.sh --fast");
        assert_eq!(processes[0].user, "me");
    }

    #[test]
    fn short_ps_lines_are_skipped() {
        assert!(parse_ps("HEADER\ntoo short line\n").is_empty());
    }

    #[test]
    fn launched_pids_come_from_the_last_line() {
        let blocks = vec!["4711".to_string()];
        assert_eq!(parse_launched_pid(&blocks, "n1").unwrap(), 4711);

        let chatty = vec!["warning: something\n4712".to_string()];
        assert_eq!(parse_launched_pid(&chatty, "n1").unwrap(), 4712);

        let broken = vec!["no pid here".to_string()];
        assert!(matches!(
            parse_launched_pid(&broken, "n1"),
            Err(BackendError::BadSubmission { .. })
        ));
    }

    #[test]
    fn nohup_commands_quote_directory_and_command() {
        let submission = Submission {
            name: "fit",
            batch: None,
            directory: std::path::Path::new("/tmp/ws/fit"),
            command: "./run.sh 'x y'",
            weight: 1.0,
            node: "n1",
            pinned: None,
        };
        let command = nohup_command(&submission);
        assert!(command.starts_with("cd '/tmp/ws/fit'; nohup bash -c"));
        assert!(command.ends_with("> run.log 2>&1 & echo $!"));
    }

    #[test]
    fn primed_listings_are_served_from_cache() {
        let backend = Backend::load(&local_config()).unwrap();
        backend.prime_processes(
            "ghost",
            vec![RemoteProcess {
                pid: 1,
                user: "me".to_string(),
                name: "bash -c ./run.sh".to_string(),
            }],
        );

        let listing = backend.processes("ghost").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].pid, 1);
    }

    #[test]
    fn unknown_nodes_are_a_hard_error() {
        let backend = Backend::load(&local_config()).unwrap();
        assert!(matches!(
            backend.processes("nowhere"),
            Err(BackendError::UnknownNode(_))
        ));
    }

    #[test]
    fn pool_nodes_are_reported_verbatim() {
        let mut config = local_config();
        config.backend = BackendConfig::Pool {
            nodes: vec!["n1".to_string(), "n2".to_string()],
        };
        let backend = Backend::load(&config).unwrap();
        assert_eq!(backend.nodes(), vec!["n1".to_string(), "n2".to_string()]);
    }
}
