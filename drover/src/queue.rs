use crate::{
    backend::{Backend, BackendError},
    config::{Config, ConfigError},
    distribute,
    job::{self, JobError, Jobs, Status},
};
use chrono::Timelike;
use itertools::Itertools;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use serde_yaml::Value;
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    io::{self, Write},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("could not build the worker pool: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),
    #[error("could not render the summary: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// How much work a start cycle is allowed to put on the nodes.
#[derive(Clone, Copy, Debug)]
pub enum StartBudget {
    /// start every eligible job
    Everything,
    /// start eligible jobs up to this much total weight
    Weight(f64),
    /// top up until this much total weight is running
    Limit(f64),
}

/// Job indices grouped by freshly derived status, in display order.
#[derive(Debug)]
pub struct StatusReport {
    by_status: BTreeMap<Status, Vec<usize>>,
}

impl StatusReport {
    fn new() -> Self {
        Self {
            by_status: Status::ALL
                .iter()
                .map(|&status| (status, Vec::new()))
                .collect(),
        }
    }

    fn insert(&mut self, status: Status, index: usize) {
        self.by_status.entry(status).or_default().push(index);
    }

    pub fn indices(&self, status: Status) -> &[usize] {
        self.by_status
            .get(&status)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count(&self, status: Status) -> usize {
        self.indices(status).len()
    }

    pub fn total(&self) -> usize {
        self.by_status.values().map(Vec::len).sum()
    }
}

/// The controller: holds the jobs and the backend, derives status, selects
/// and distributes work, and runs the bulk operations behind the CLI.
///
/// There is no daemon and no lock file; two controllers over overlapping
/// job sets can race each other.
pub struct Queue {
    jobs: Vec<Jobs>,
    backend: Backend,
    pool: Option<ThreadPool>,
    monitor_interval: Duration,
    pub force: bool,
    pub restart: bool,
}

impl Queue {
    pub fn load(config: &Config, serial: bool) -> Result<Self, QueueError> {
        let backend = Backend::load(config)?;
        let jobs = job::build_jobs(&config.workspace, &config.jobs)?;
        let pool = if serial {
            None
        } else {
            // status polling is I/O bound, so oversubscribe the cores a bit
            let workers = (3 * num_cpus::get()).min(20);
            Some(ThreadPoolBuilder::new().num_threads(workers).build()?)
        };
        info!("queue loaded with {} jobs", jobs.len());

        Ok(Self {
            jobs,
            backend,
            pool,
            monitor_interval: Duration::from_secs(config.monitor_interval_secs),
            force: false,
            restart: false,
        })
    }

    /// derive every job's status from the environment
    pub fn refresh_status(&mut self) -> Result<StatusReport, QueueError> {
        let jobs = &mut self.jobs;
        let backend = &self.backend;
        let statuses: Result<Vec<Status>, JobError> = match &self.pool {
            Some(pool) => pool.install(|| {
                jobs.par_iter_mut()
                    .map(|job| job.find_status(backend))
                    .collect()
            }),
            None => jobs
                .iter_mut()
                .map(|job| job.find_status(backend))
                .collect(),
        };

        let mut report = StatusReport::new();
        for (index, status) in statuses?.into_iter().enumerate() {
            report.insert(status, index);
        }
        Ok(report)
    }

    /// Pick jobs worth starting, staying under `budget` total weight.
    ///
    /// Unprepared and prepared jobs are eligible, crashed ones too in
    /// restart mode. With a budget the heaviest jobs go first, crashed
    /// ones boosted ahead; a job that does not fit is skipped rather than
    /// ending the greedy pass. An empty pick with eligible work left still
    /// returns one job, so a start always makes progress.
    pub fn select(&self, report: &StatusReport, budget: Option<f64>) -> Vec<usize> {
        let mut eligible: Vec<usize> = Vec::new();
        eligible.extend_from_slice(report.indices(Status::Prepared));
        eligible.extend_from_slice(report.indices(Status::None));
        if self.restart {
            eligible.extend_from_slice(report.indices(Status::Crashed));
        }
        if eligible.is_empty() {
            return eligible;
        }

        let total: f64 = eligible.iter().map(|&index| self.jobs[index].weight()).sum();
        let budget = match budget {
            Some(budget) if budget < total => budget,
            _ => return eligible,
        };

        let priority = |index: usize| {
            let job = &self.jobs[index];
            job.weight() + if job.status() == Status::Crashed { 10.0 } else { 0.0 }
        };
        let mut ranked = eligible;
        ranked.sort_by(|&a, &b| {
            priority(b)
                .partial_cmp(&priority(a))
                .unwrap_or(Ordering::Equal)
        });

        let mut picked = Vec::new();
        let mut used = 0.0;
        for &index in &ranked {
            let weight = self.jobs[index].weight();
            if used + weight <= budget {
                picked.push(index);
                used += weight;
            }
        }
        if picked.is_empty() {
            if let Some(&top) = ranked.first() {
                picked.push(top);
            }
        }
        picked
    }

    /// One full run cycle: refresh, select within the budget, spread the
    /// picks over the nodes and start them. A job that fails to come up is
    /// counted and skipped; transport and vanished-node errors abort.
    pub fn start(&mut self, budget: StartBudget) -> Result<usize, QueueError> {
        self.quota_warning();
        let report = self.refresh_status()?;

        let cap = match budget {
            StartBudget::Everything => None,
            StartBudget::Weight(weight) => {
                info!("starting jobs up to weight {weight}");
                Some(weight)
            }
            StartBudget::Limit(ceiling) => {
                let running: f64 = report
                    .indices(Status::Running)
                    .iter()
                    .map(|&index| self.jobs[index].weight())
                    .sum();
                let open = (ceiling - running).max(0.0);
                if open == 0.0 {
                    info!("limit {ceiling} already reached with weight {running} running");
                    return Ok(0);
                }
                info!("topping up to {ceiling}: weight {running} running, {open} to go");
                Some(open)
            }
        };

        let selected = self.select(&report, cap);
        if selected.is_empty() {
            if self.restart {
                info!("no jobs to restart");
            } else {
                info!("no jobs to start");
            }
            return Ok(0);
        }

        let (nodes, slots) = self.backend.availability()?;
        let weights: Vec<f64> = selected
            .iter()
            .map(|&index| self.jobs[index].weight())
            .collect();
        let spread = distribute::distribute(&weights, &slots);
        {
            let labels: Vec<&str> = selected
                .iter()
                .map(|&index| self.jobs[index].name())
                .collect();
            debug!("\n{}", spread.render(&labels, &weights, &nodes, &slots));
        }

        let force = self.force;
        let backend = &self.backend;
        let jobs = &mut self.jobs;
        let mut started = 0;
        let mut failed = 0;
        for (node_index, bucket) in spread.buckets.iter().enumerate() {
            for &slot in bucket {
                let job = &mut jobs[selected[slot]];
                match start_one(job, backend, &nodes[node_index], force) {
                    Ok(count) => started += count,
                    Err(error) if is_fatal(&error) => return Err(error.into()),
                    Err(error) => {
                        warn!(job = %job.name(), error = %error, "start failed, moving on");
                        failed += 1;
                    }
                }
            }
        }
        if failed > 0 {
            warn!("{failed} jobs failed to start");
        }
        if self.restart {
            info!("(re)started {started} jobs");
        } else {
            info!("started {started} jobs");
        }
        Ok(started)
    }

    /// prepare every job; jobs with missing inputs are reported and skipped
    pub fn prepare_all(&mut self) -> Result<usize, QueueError> {
        let mut prepared = 0;
        let mut failed = 0;
        for job in &mut self.jobs {
            match job.prepare() {
                Ok(count) => prepared += count,
                Err(error @ (JobError::MissingInput { .. } | JobError::Prepare { .. })) => {
                    warn!(error = %error, "preparation failed, moving on");
                    failed += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
        if failed > 0 {
            warn!("{failed} jobs could not be prepared");
        }
        info!("prepared {prepared} jobs");
        Ok(prepared)
    }

    pub fn kill_all(&mut self) -> Result<usize, QueueError> {
        let backend = &self.backend;
        let mut killed = 0;
        for job in self.jobs.iter_mut() {
            killed += job.kill(backend)?;
        }
        info!("killed {killed} jobs");
        Ok(killed)
    }

    /// remove every job directory; running/completed jobs make this fail
    /// unless force is set
    pub fn cleanup_all(&mut self) -> Result<usize, QueueError> {
        let force = self.force;
        let backend = &self.backend;
        let mut cleaned = 0;
        for job in self.jobs.iter_mut() {
            cleaned += job.cleanup(backend, force)?;
        }
        info!("cleaned up {cleaned} jobs");
        Ok(cleaned)
    }

    /// run every job's repair command
    pub fn fix_all(&self) -> Result<usize, QueueError> {
        let jobs = &self.jobs;
        let shell = self.backend.shell();
        let counts: Result<Vec<usize>, JobError> = match &self.pool {
            Some(pool) => pool.install(|| jobs.par_iter().map(|job| job.fix(shell)).collect()),
            None => jobs.iter().map(|job| job.fix(shell)).collect(),
        };
        let fixed: usize = counts?.into_iter().sum();
        info!("fixed {fixed} jobs");
        Ok(fixed)
    }

    /// completed jobs' parsed results, keyed by job name
    pub fn results(&self) -> BTreeMap<String, Value> {
        let jobs = &self.jobs;
        let collected: Vec<(String, Option<Value>)> = match &self.pool {
            Some(pool) => pool.install(|| {
                jobs.par_iter()
                    .map(|job| (job.name().to_string(), job.result()))
                    .collect()
            }),
            None => jobs
                .iter()
                .map(|job| (job.name().to_string(), job.result()))
                .collect(),
        };
        let results: BTreeMap<String, Value> = collected
            .into_iter()
            .filter_map(|(name, result)| result.map(|value| (name, value)))
            .collect();
        info!("collected results for {} of {} jobs", results.len(), jobs.len());
        results
    }

    /// dump all collected results as one yaml document on stdout
    pub fn summary(&self) -> Result<(), QueueError> {
        let results = self.results();
        print!("{}", serde_yaml::to_string(&results)?);
        Ok(())
    }

    pub fn list_jobs(&self) {
        let cols = 2;
        let rows = (self.jobs.len() + cols - 1) / cols;
        for row in 0..rows {
            let line = (0..cols)
                .map(|col| row + col * rows)
                .filter(|&index| index < self.jobs.len())
                .map(|index| {
                    let job = &self.jobs[index];
                    format!(
                        "{:2}. {:20} {:>10}",
                        index + 1,
                        format!("{} [{}]", job.name(), job.weight()),
                        job.status().label()
                    )
                })
                .join("  | ");
            println!("{line}");
        }
    }

    /// re-probe the nodes and print what they have to offer
    pub fn show_availability(&self) -> Result<(), QueueError> {
        let (nodes, slots) = self.backend.refresh_availability()?;
        for (node, slot) in nodes.iter().zip(&slots) {
            println!("{node:>8}  {slot:5.1} free slots");
        }
        info!(
            "{} nodes with {} free slots",
            nodes.len(),
            slots.iter().sum::<f64>()
        );
        Ok(())
    }

    /// dry run of the distribution over all jobs, nothing is started
    pub fn show_distribution(&self) -> Result<(), QueueError> {
        let (nodes, slots) = self.backend.availability()?;
        let weights: Vec<f64> = self.jobs.iter().map(Jobs::weight).collect();
        let labels: Vec<&str> = self.jobs.iter().map(Jobs::name).collect();
        let spread = distribute::distribute(&weights, &slots);
        println!("{}", spread.render(&labels, &weights, &nodes, &slots));
        Ok(())
    }

    pub fn show_status(&self, report: &StatusReport, verbose: bool) {
        info!("status for {} jobs:", report.total());
        println!("{}", self.format_status(report, verbose));
        if verbose {
            for job in &self.jobs {
                if let Some(reason) = job.crash_report() {
                    println!("--- {} ---\n{reason}", job.name());
                }
            }
        }
    }

    fn format_status(&self, report: &StatusReport, verbose: bool) -> String {
        let mut lines = Vec::new();
        for status in Status::ALL {
            let names = report
                .indices(status)
                .iter()
                .map(|&index| self.jobs[index].name())
                .join(" ");
            let names = if verbose || names.len() <= 40 {
                names
            } else {
                format!("{}...", &names[..37])
            };
            lines.push(format!(" {:3} {:<12} {names}", report.count(status), status.label()));
        }
        lines.join("\n")
    }

    /// Redraw the status table at every wall-clock tick of the configured
    /// interval until nothing is running anymore (or the operator
    /// interrupts).
    pub fn monitor(&mut self) -> Result<(), QueueError> {
        info!("monitoring status, ctrl+c stops");
        let lines = Status::ALL.len() + 1;
        print!("{}", "\n".repeat(lines));

        loop {
            let report = self.refresh_status()?;
            let running = report.indices(Status::Running);
            let weight: f64 = running.iter().map(|&index| self.jobs[index].weight()).sum();
            let header = format!(
                "{} - {} running, weight {weight}:",
                chrono::Local::now().format("%H:%M:%S"),
                running.len()
            );
            reprint(&format!("{header}\n{}", self.format_status(&report, false)), lines);

            if running.is_empty() {
                info!("monitoring done, nothing is running anymore");
                return Ok(());
            }

            let now = chrono::Local::now();
            let clock = f64::from(now.second()) + f64::from(now.nanosecond()) / 1e9;
            let pause = tick_pause(self.monitor_interval.as_secs_f64(), clock);
            thread::sleep(Duration::from_secs_f64(pause));
        }
    }

    /// a heads-up when the filesystem quota is nearly used up; stays quiet
    /// when there is no quota command or no quota at all
    fn quota_warning(&self) {
        let blocks = match self.backend.shell().run_on(None, &["quota -Q".to_string()]) {
            Ok(blocks) => blocks,
            Err(_) => return,
        };
        let fields: Vec<f64> = blocks
            .first()
            .and_then(|block| block.lines().last())
            .map(|line| {
                line.split_whitespace()
                    .filter_map(|field| field.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        if fields.len() < 2 {
            return;
        }
        let (used, avail) = (fields[0], fields[1]);
        if avail - used < 1e7 && used / avail > 0.8 {
            warn!(
                "only {}MB free ({}%) on this filesystem",
                ((avail - used) / 1024.0) as u64,
                (100.0 * (1.0 - used / avail)) as u64
            );
        }
    }
}

/// one slot of the run cycle: clear out if forced, then prepare and launch
fn start_one(job: &mut Jobs, backend: &Backend, node: &str, force: bool) -> Result<usize, JobError> {
    if force {
        job.cleanup(backend, true)?;
    }
    job.prepare()?;
    job.start(backend, node, force)
}

fn is_fatal(error: &JobError) -> bool {
    matches!(
        error,
        JobError::Backend(_) | JobError::NodeVanished { .. }
    )
}

/// seconds until the next whole multiple of `interval` on the clock
fn tick_pause(interval: f64, clock: f64) -> f64 {
    (interval - (clock + 0.01) % interval).max(0.0)
}

/// rewrite the last `lines` terminal lines in place
fn reprint(text: &str, lines: usize) {
    print!("\x1b[{lines}A");
    for line in text.lines() {
        print!("\x1b[2K{line}\n");
    }
    let _ = io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::RemoteProcess, config::JobConfig, job::sidecar::Sidecar};
    use std::path::Path;
    use tempfile::TempDir;

    fn entry(name: &str, weight: f64) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            weight,
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

    fn queue(workspace: &Path, entries: Vec<JobConfig>) -> Queue {
        let mut config: Config = serde_yaml::from_str("backend:\n  kind: local\n").unwrap();
        config.workspace = workspace.to_path_buf();
        config.jobs = entries;
        Queue::load(&config, true).unwrap()
    }

    fn record_start(workspace: &Path, name: &str, node: &str, pid: u64) {
        let directory = workspace.join(name);
        std::fs::create_dir_all(&directory).unwrap();
        Sidecar {
            name: name.to_string(),
            node: node.to_string(),
            pid,
            timestamp: 0,
        }
        .save(&directory)
        .unwrap();
    }

    /// one job in each of the four non-trivial states, every weight 2
    fn mixed_queue(workspace: &Path) -> Queue {
        let queue = queue(
            workspace,
            vec![
                entry("prep", 2.0),
                entry("crash", 2.0),
                entry("run", 2.0),
                entry("done", 2.0),
            ],
        );
        std::fs::create_dir_all(workspace.join("prep")).unwrap();
        record_start(workspace, "crash", "nX", 7);
        record_start(workspace, "run", "nX", 8);
        let done = workspace.join("done");
        std::fs::create_dir_all(&done).unwrap();
        std::fs::write(done.join("result.txt"), "ok\n").unwrap();
        queue.backend.prime_processes(
            "nX",
            vec![RemoteProcess {
                pid: 8,
                user: "me".to_string(),
                name: "bash -c true".to_string(),
            }],
        );
        queue
    }

    #[test]
    fn report_groups_jobs_by_status() {
        let workspace = TempDir::new().unwrap();
        let mut queue = mixed_queue(workspace.path());
        let report = queue.refresh_status().unwrap();

        assert_eq!(report.count(Status::Prepared), 1);
        assert_eq!(report.count(Status::Crashed), 1);
        assert_eq!(report.count(Status::Running), 1);
        assert_eq!(report.count(Status::Completed), 1);
        assert_eq!(report.count(Status::None), 0);
        assert_eq!(report.total(), 4);
    }

    #[test]
    fn selector_prefers_crashed_within_budget() {
        let workspace = TempDir::new().unwrap();
        let mut queue = mixed_queue(workspace.path());
        queue.restart = true;
        let report = queue.refresh_status().unwrap();

        // budget fits one job of weight 2; the crashed one outranks prepared
        let picked = queue.select(&report, Some(2.0));
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn selector_without_restart_skips_crashed() {
        let workspace = TempDir::new().unwrap();
        let mut queue = mixed_queue(workspace.path());
        let report = queue.refresh_status().unwrap();

        assert_eq!(queue.select(&report, Some(2.0)), vec![0]);
        assert_eq!(queue.select(&report, None), vec![0]);
    }

    #[test]
    fn infinite_budget_returns_the_eligible_set() {
        let workspace = TempDir::new().unwrap();
        let mut queue = mixed_queue(workspace.path());
        queue.restart = true;
        let report = queue.refresh_status().unwrap();

        let mut picked = queue.select(&report, None);
        picked.sort_unstable();
        assert_eq!(picked, vec![0, 1]);
    }

    #[test]
    fn zero_budget_still_makes_progress() {
        let workspace = TempDir::new().unwrap();
        let mut queue = mixed_queue(workspace.path());
        queue.restart = true;
        let report = queue.refresh_status().unwrap();

        assert_eq!(queue.select(&report, Some(0.0)), vec![1]);
    }

    #[test]
    fn oversized_jobs_are_skipped_for_smaller_ones() {
        let workspace = TempDir::new().unwrap();
        let mut queue = queue(
            workspace.path(),
            vec![entry("big", 5.0), entry("small", 2.0)],
        );
        let report = queue.refresh_status().unwrap();

        assert_eq!(queue.select(&report, Some(3.0)), vec![1]);
    }

    #[test]
    fn start_runs_the_full_cycle_locally() {
        let workspace = TempDir::new().unwrap();
        let mut queue = queue(workspace.path(), vec![entry("noop", 1.0)]);

        let started = queue.start(StartBudget::Everything).unwrap();
        assert_eq!(started, 1);
        assert!(workspace.path().join("noop").join("job.pid").is_file());
    }

    #[test]
    fn full_limit_starts_nothing() {
        let workspace = TempDir::new().unwrap();
        let mut queue = queue(
            workspace.path(),
            vec![entry("prep", 2.0), entry("run", 2.0)],
        );
        std::fs::create_dir_all(workspace.path().join("prep")).unwrap();
        record_start(workspace.path(), "run", "nX", 8);
        queue.backend.prime_processes(
            "nX",
            vec![RemoteProcess {
                pid: 8,
                user: "me".to_string(),
                name: "bash -c true".to_string(),
            }],
        );

        let started = queue.start(StartBudget::Limit(2.0)).unwrap();
        assert_eq!(started, 0);
        assert!(!workspace.path().join("prep").join("job.pid").exists());
    }

    #[test]
    fn cleanup_refuses_finished_work_unless_forced() {
        let workspace = TempDir::new().unwrap();
        let mut queue = queue(workspace.path(), vec![entry("done", 1.0)]);
        let directory = workspace.path().join("done");
        std::fs::create_dir_all(&directory).unwrap();
        std::fs::write(directory.join("result.txt"), "ok\n").unwrap();

        assert!(matches!(
            queue.cleanup_all(),
            Err(QueueError::Job(JobError::Active { .. }))
        ));

        queue.force = true;
        assert_eq!(queue.cleanup_all().unwrap(), 1);
        assert!(!directory.exists());
    }

    #[test]
    fn missing_inputs_do_not_block_other_preparations() {
        let workspace = TempDir::new().unwrap();
        let mut broken = entry("broken", 1.0);
        broken.inputs = vec![workspace.path().join("nowhere.dat")];
        let mut queue = queue(workspace.path(), vec![broken, entry("fine", 1.0)]);

        assert_eq!(queue.prepare_all().unwrap(), 1);
        assert!(workspace.path().join("fine").is_dir());
        assert!(!workspace.path().join("broken").exists());
    }

    #[test]
    fn status_lines_carry_counts_and_names() {
        let workspace = TempDir::new().unwrap();
        let mut queue = mixed_queue(workspace.path());
        let report = queue.refresh_status().unwrap();

        let text = queue.format_status(&report, false);
        assert!(text.contains("   1 crashed      crash"), "{text}");
        assert!(text.contains("   0 nothing"), "{text}");
        assert!(text.contains("   1 completed    done"), "{text}");
    }

    #[test]
    fn long_name_lists_are_truncated_unless_verbose() {
        let workspace = TempDir::new().unwrap();
        let names: Vec<JobConfig> = (0..8)
            .map(|index| entry(&format!("quite_a_long_job_name_{index}"), 1.0))
            .collect();
        let mut queue = queue(workspace.path(), names);
        let report = queue.refresh_status().unwrap();

        let short = queue.format_status(&report, false);
        assert!(short.contains("..."), "{short}");
        let long = queue.format_status(&report, true);
        assert!(!long.contains("..."), "{long}");
    }

    #[test]
    fn results_collect_only_completed_jobs() {
        let workspace = TempDir::new().unwrap();
        let queue = queue(
            workspace.path(),
            vec![entry("done", 1.0), entry("pending", 1.0)],
        );
        let directory = workspace.path().join("done");
        std::fs::create_dir_all(&directory).unwrap();
        std::fs::write(directory.join("result.txt"), "score: 9\n").unwrap();

        let results = queue.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results["done"]["score"], Value::from(9));
    }

    #[test]
    fn ticks_align_to_the_wall_clock() {
        assert!((tick_pause(5.0, 12.0) - 2.99).abs() < 1e-9);
        assert!((tick_pause(5.0, 4.99) - 5.0).abs() < 1e-9);
        assert!(tick_pause(5.0, 59.995) <= 5.0);
    }
}
