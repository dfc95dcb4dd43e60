use super::{BackendError, RemoteProcess, Submission};
use crate::shell::{quote, Shell};
use tracing::{debug, warn};

/// squeue states that mean a job is still owned by the scheduler;
/// COMPLETING/COMPLETED stay in so a job flushing its output is not
/// misread as crashed before the result file lands
const LIVE_STATES: [&str; 5] = [
    "PENDING",
    "RUNNING",
    "SUSPENDED",
    "COMPLETING",
    "COMPLETED",
];

/// SLURM partition behaving as a single node of unlimited capacity.
///
/// Packing is the scheduler's problem; we only submit, list and cancel.
#[derive(Debug, Clone)]
pub struct BatchBackend {
    pub partition: String,
    pub time_limit: String,
}

impl BatchBackend {
    /// one-time connectivity check, sbatch without a scheduler helps nobody
    pub fn check(&self, shell: &Shell) -> Result<(), BackendError> {
        shell
            .run_on(None, &["sinfo --version".to_string()])
            .map_err(BackendError::SchedulerDown)?;
        debug!(partition = %self.partition, "slurm tools answer");
        Ok(())
    }

    pub fn processes(&self, shell: &Shell) -> Result<Vec<RemoteProcess>, BackendError> {
        let listing = format!(
            "squeue --partition {} --user $USER --format '%A %B %P %T %u %j'",
            self.partition
        );
        let blocks = shell
            .run_on(None, &[listing])
            .map_err(|source| BackendError::Unreachable {
                node: self.partition.clone(),
                source,
            })?;
        Ok(parse_squeue(blocks.first().map(String::as_str).unwrap_or("")))
    }

    pub fn submit_command(&self, submission: &Submission) -> String {
        let directory = submission.directory.display();
        let size = submission.weight.ceil().max(1.0) as u64;
        let comment = format!(
            "{}/{} (weight {})",
            submission.batch.unwrap_or("-"),
            submission.name,
            submission.weight
        );

        let mut command = format!(
            "sbatch --job-name {name} --comment {comment} --partition {partition} \
             --chdir {directory} --time {time} --mem {size}G --nodes 1 --ntasks {size} \
             --output {output} --error {errors}",
            name = quote(submission.name),
            comment = quote(&comment),
            partition = self.partition,
            directory = quote(&directory.to_string()),
            time = self.time_limit,
            output = quote(&format!("{directory}/slurm.out")),
            errors = quote(&format!("{directory}/slurm.err")),
        );
        if let Some(node) = submission.pinned {
            command.push_str(&format!(" --nodelist {node} --no-requeue"));
        }
        command.push_str(&format!(" --wrap {}", quote(submission.command)));
        command
    }
}

pub fn parse_squeue(output: &str) -> Vec<RemoteProcess> {
    let mut processes = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let pid = match fields[0].parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let state = fields[3];
        if !LIVE_STATES.contains(&state) {
            warn!("queue entry {pid} is {state}, assuming it crashed");
            continue;
        }
        processes.push(RemoteProcess {
            pid,
            user: fields[4].to_string(),
            name: fields[5..].join(" "),
        });
    }
    processes
}

/// pull the job id out of "Submitted batch job 123"
pub fn parse_submission_id(output: &str) -> Option<u64> {
    let marker = "Submitted batch job";
    let start = output.find(marker)? + marker.len();
    output[start..].split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn squeue_output_parses_and_filters() {
        let output = "JOBID EXEC_HOST PARTITION STATE USER NAME\n\
                      101 n01 compute RUNNING me fit_a\n\
                      102 n02 compute PENDING me fit_b\n\
                      103 n03 compute FAILED me fit_c\n\
                      104 n01 compute COMPLETING me long name\n";
        let processes = parse_squeue(output);
        assert_eq!(processes.len(), 3);
        assert_eq!(processes[0].pid, 101);
        assert_eq!(processes[0].name, "fit_a");
        assert_eq!(processes[2].name, "long name");
    }

    #[test]
    fn submission_ids_are_found_in_sbatch_chatter() {
        assert_eq!(parse_submission_id("Submitted batch job 4242"), Some(4242));
        assert_eq!(
            parse_submission_id("some banner\nSubmitted batch job 7 on cluster x\n"),
            Some(7)
        );
        assert_eq!(parse_submission_id("sbatch: error: oh no"), None);
    }

    #[test]
    fn submit_command_carries_the_job_shape() {
        let backend = BatchBackend {
            partition: "compute".to_string(),
            time_limit: "01-00:00:00".to_string(),
        };
        let submission = Submission {
            name: "fit_a",
            batch: Some("survey"),
            directory: Path::new("/scratch/survey/fit_a"),
            command: "./run.sh --fast",
            weight: 2.5,
            node: "compute",
            pinned: Some("n07"),
        };

        let command = backend.submit_command(&submission);
        assert!(command.starts_with("sbatch --job-name 'fit_a'"));
        assert!(command.contains("--comment 'survey/fit_a (weight 2.5)'"));
        assert!(command.contains("--partition compute"));
        assert!(command.contains("--chdir '/scratch/survey/fit_a'"));
        assert!(command.contains("--time 01-00:00:00"));
        assert!(command.contains("--mem 3G --nodes 1 --ntasks 3"));
        assert!(command.contains("--nodelist n07 --no-requeue"));
        assert!(command.ends_with("--wrap './run.sh --fast'"));
    }
}
