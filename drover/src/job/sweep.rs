use super::{shell::ShellJob, valid_name, JobError, Status};
use crate::{
    backend::Backend,
    config::{ConfigError, JobConfig, SweepConfig},
    shell::Shell,
};
use itertools::Itertools;
use serde_yaml::Value;
use std::{collections::BTreeMap, path::Path};
use tracing::debug;

/// One parameter assignment of a sweep point, in the two spellings the
/// expansion needs
struct Binding<'a> {
    parameter: &'a str,
    /// substituted into commands and file names
    raw: String,
    /// substituted into job names, integers zero-padded so names sort
    padded: String,
}

#[derive(Clone, Copy)]
enum Spelling {
    Raw,
    Padded,
}

/// A parameter sweep treated as one logical job.
///
/// The cross product of the configured ranges fans out into one child per
/// combination. The sweep itself owns no directory and no pid; every
/// predicate is a reduction over the children (AND for prepared/started/
/// complete, OR for running) and every action sums the children's counts.
#[derive(Debug)]
pub struct SweepJob {
    name: String,
    batch: Option<String>,
    children: Vec<ShellJob>,
    status: Status,
    aggregate: Option<fn(&BTreeMap<String, Value>) -> Value>,
}

impl SweepJob {
    pub fn new(
        workspace: &Path,
        config: &JobConfig,
        sweep: &SweepConfig,
    ) -> Result<Self, ConfigError> {
        if !valid_name(&config.name) {
            return Err(ConfigError::InvalidName(config.name.clone()));
        }
        if sweep.ranges.is_empty() || sweep.ranges.values().any(|range| range.is_empty()) {
            return Err(ConfigError::EmptySweep(config.name.clone()));
        }

        let parameters: Vec<&String> = sweep.ranges.keys().collect();
        let mut children = Vec::new();
        for combination in sweep
            .ranges
            .values()
            .map(|range| range.iter())
            .multi_cartesian_product()
        {
            let bindings: Vec<Binding> = parameters
                .iter()
                .zip(combination)
                .map(|(parameter, value)| Binding {
                    parameter: parameter.as_str(),
                    raw: raw_value(value),
                    padded: padded_value(value),
                })
                .collect();

            let mut child = config.clone();
            child.sweep = None;
            child.name = match &sweep.name_template {
                Some(template) => substitute(template, &bindings, Spelling::Padded),
                None => {
                    let parts = bindings
                        .iter()
                        .map(|binding| format!("{}{}", binding.parameter, binding.padded))
                        .join("_");
                    format!("{}__{parts}", config.name)
                }
            };
            child.command = substitute(&config.command, &bindings, Spelling::Raw);
            child.done_file = substitute(&config.done_file, &bindings, Spelling::Raw);
            child.done_pattern = config
                .done_pattern
                .as_ref()
                .map(|pattern| substitute(pattern, &bindings, Spelling::Raw));
            child.fix_command = config
                .fix_command
                .as_ref()
                .map(|command| substitute(command, &bindings, Spelling::Raw));

            children.push(ShellJob::new(workspace, &child)?);
        }

        children.sort_by(|a, b| a.name().cmp(b.name()));
        for pair in children.windows(2) {
            if pair[0].name() == pair[1].name() {
                return Err(ConfigError::DuplicateName(pair[0].name().to_string()));
            }
        }
        debug!(sweep = %config.name, "expanded into {} children", children.len());

        Ok(Self {
            name: config.name.clone(),
            batch: config.batch.clone(),
            children,
            status: Status::None,
            aggregate: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_name(&self) -> Option<&str> {
        self.batch.as_deref()
    }

    pub fn children(&self) -> &[ShellJob] {
        &self.children
    }

    pub fn weight(&self) -> f64 {
        self.children.iter().map(ShellJob::weight).sum()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// replace the default name-keyed result map with a custom reduction
    pub fn set_aggregate(&mut self, aggregate: fn(&BTreeMap<String, Value>) -> Value) {
        self.aggregate = Some(aggregate);
    }

    pub fn is_prepared(&self) -> bool {
        self.children.iter().all(ShellJob::is_prepared)
    }

    pub fn is_complete(&self) -> bool {
        self.children.iter().all(ShellJob::is_complete)
    }

    pub fn is_started(&mut self) -> Result<bool, JobError> {
        for child in &mut self.children {
            if !child.is_started()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_running(&mut self, backend: &Backend) -> Result<bool, JobError> {
        for child in &mut self.children {
            if child.is_running(backend)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// refresh every child, then reduce; the per-node process cache keeps
    /// the repeated liveness checks off the wire
    pub fn find_status(&mut self, backend: &Backend) -> Result<Status, JobError> {
        for child in &mut self.children {
            child.find_status(backend)?;
        }
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

    pub fn prepare(&mut self) -> Result<usize, JobError> {
        let mut prepared = 0;
        for child in &mut self.children {
            prepared += child.prepare()?;
        }
        Ok(prepared)
    }

    /// start what is left: finished and live children are skipped, so a
    /// partially-run sweep resumes instead of tripping over its own
    /// completed children
    pub fn start(
        &mut self,
        backend: &Backend,
        node: &str,
        force: bool,
    ) -> Result<usize, JobError> {
        let mut started = 0;
        for child in &mut self.children {
            if !force && (child.is_complete() || child.is_running(backend)?) {
                continue;
            }
            started += child.start(backend, node, force)?;
        }
        Ok(started)
    }

    pub fn kill(&mut self, backend: &Backend) -> Result<usize, JobError> {
        let mut killed = 0;
        for child in &mut self.children {
            killed += child.kill(backend)?;
        }
        Ok(killed)
    }

    pub fn cleanup(&mut self, backend: &Backend, force: bool) -> Result<usize, JobError> {
        let mut removed = 0;
        for child in &mut self.children {
            removed += child.cleanup(backend, force)?;
        }
        self.status = Status::None;
        Ok(removed)
    }

    pub fn fix(&self, shell: &Shell) -> Result<usize, JobError> {
        let mut fixed = 0;
        for child in &self.children {
            fixed += child.fix(shell)?;
        }
        Ok(fixed)
    }

    /// None until every child is complete, then the aggregate (or a
    /// name-keyed map of the children's results)
    pub fn result(&self) -> Option<Value> {
        if !self.is_complete() {
            return None;
        }
        let mut results = BTreeMap::new();
        for child in &self.children {
            results.insert(child.name().to_string(), child.result()?);
        }
        match self.aggregate {
            Some(aggregate) => Some(aggregate(&results)),
            None => Some(Value::Mapping(
                results
                    .into_iter()
                    .map(|(name, value)| (Value::String(name), value))
                    .collect(),
            )),
        }
    }

    /// run-length summary over the children plus the first concrete reason
    pub fn crash_report(&self) -> Option<String> {
        if self.status != Status::Crashed {
            return None;
        }
        let markers: String = self
            .children
            .iter()
            .map(|child| match child.status() {
                Status::Completed => '+',
                Status::Crashed => 'X',
                Status::Running => '>',
                _ => '.',
            })
            .collect();
        let summary = format!("children: {}", rle(&markers));
        let reason = self
            .children
            .iter()
            .find(|child| child.status() == Status::Crashed)
            .and_then(ShellJob::crash_reason);
        Some(match reason {
            Some(reason) => format!("{summary}\n{reason}"),
            None => summary,
        })
    }
}

fn raw_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

fn padded_value(value: &Value) -> String {
    match value {
        Value::Number(number) if number.is_i64() => {
            format!("{:02}", number.as_i64().unwrap_or_default())
        }
        other => raw_value(other),
    }
}

fn substitute(text: &str, bindings: &[Binding], spelling: Spelling) -> String {
    let mut out = text.to_string();
    for binding in bindings {
        let value = match spelling {
            Spelling::Raw => &binding.raw,
            Spelling::Padded => &binding.padded,
        };
        out = out.replace(&format!("{{{}}}", binding.parameter), value);
    }
    out
}

fn rle(markers: &str) -> String {
    let mut out = String::new();
    let mut chars = markers.chars();
    let (mut run_char, mut run_len) = match chars.next() {
        Some(first) => (first, 1usize),
        None => return out,
    };
    for c in chars {
        if c == run_char {
            run_len += 1;
        } else {
            out.push_str(&format!("{run_len}{run_char}"));
            run_char = c;
            run_len = 1;
        }
    }
    out.push_str(&format!("{run_len}{run_char}"));
    out
}
