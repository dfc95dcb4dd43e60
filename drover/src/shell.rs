use std::{
    io::{self, Read},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::trace;
use wait_timeout::ChildExt;

/// separates the outputs of commands that were joined into one remote call
pub const SPLIT_MARKER: &str = "#%&split_here&%#";

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn { command: String, source: std::io::Error },
    #[error("failed to read command output: {0}")]
    Output(#[from] std::io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed: {0}")]
    Failed(String),
    #[error("expected {expected} output blocks but got {actual}")]
    MissingOutput { expected: usize, actual: usize },
}

/// wrap a string in single quotes so a shell passes it through untouched
pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// join commands with marker echos so their outputs can be split apart again
pub fn compose(cmds: &[String]) -> String {
    cmds.join(&format!("; echo '{SPLIT_MARKER}'; "))
}

/// Runs command batches locally through `bash -c` or remotely through ssh.
///
/// Several commands go out as a single call and come back as one output
/// stream, split at the marker echos; this keeps the connection count down
/// when a poll needs more than one answer from the same node.
#[derive(Debug, Clone)]
pub struct Shell {
    timeout: Duration,
}

impl Shell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// run commands on a node (or locally for `None`) and return one trimmed
    /// output block per command
    pub fn run_on(&self, node: Option<&str>, cmds: &[String]) -> Result<Vec<String>, ShellError> {
        let script = compose(cmds);
        let output = self.run_raw(node, &script)?;

        let blocks: Vec<String> = output
            .split(SPLIT_MARKER)
            .map(|block| block.trim().to_string())
            .collect();
        if blocks.len() != cmds.len() {
            return Err(ShellError::MissingOutput {
                expected: cmds.len(),
                actual: blocks.len(),
            });
        }
        Ok(blocks)
    }

    fn run_raw(&self, node: Option<&str>, script: &str) -> Result<String, ShellError> {
        trace!(node = ?node, "running: {script}");

        let mut command = match node {
            Some(node) => {
                let mut command = Command::new("ssh");
                // fail fast on dead nodes instead of hanging on a prompt
                command
                    .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"])
                    .arg(node)
                    .arg(script);
                command
            }
            None => {
                let mut command = Command::new("bash");
                command.arg("-c").arg(script);
                command
            }
        };

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ShellError::Spawn {
                command: script.to_string(),
                source,
            })?;

        // the pipes must drain while the wait runs; a child that fills
        // the pipe buffer blocks in write and never reaches its exit
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ShellError::Timeout(self.timeout));
            }
        };

        let output = gather(stdout)?;
        let errors = gather(stderr)?;

        // anything on stderr means the other side is not usable for us,
        // same for a failure exit without any explanation
        if !errors.trim().is_empty() {
            return Err(ShellError::Failed(errors.trim().to_string()));
        }
        if !status.success() {
            return Err(ShellError::Failed(format!("exit status {status}")));
        }

        Ok(output)
    }
}

/// read a pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut text)?;
        }
        Ok(text)
    })
}

fn gather(reader: thread::JoinHandle<io::Result<String>>) -> Result<String, ShellError> {
    match reader.join() {
        Ok(text) => Ok(text?),
        Err(_) => Err(ShellError::Output(io::Error::new(
            io::ErrorKind::Other,
            "output reader panicked",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Shell {
        Shell::new(Duration::from_secs(5))
    }

    #[test]
    fn quoting_survives_embedded_quotes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn compose_joins_with_marker_echos() {
        let script = compose(&["ls".to_string(), "uptime".to_string()]);
        assert_eq!(script, format!("ls; echo '{SPLIT_MARKER}'; uptime"));
        assert_eq!(compose(&["ls".to_string()]), "ls");
    }

    #[test]
    fn local_outputs_split_per_command() {
        let blocks = shell()
            .run_on(None, &["echo one".to_string(), "echo two".to_string()])
            .unwrap();
        assert_eq!(blocks, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn single_command_keeps_multiline_output() {
        let blocks = shell()
            .run_on(None, &["printf 'a\\nb\\n'".to_string()])
            .unwrap();
        assert_eq!(blocks, vec!["a\nb".to_string()]);
    }

    #[test]
    fn stderr_output_is_a_failure() {
        let result = shell().run_on(None, &["echo broken >&2".to_string()]);
        match result {
            Err(ShellError::Failed(message)) => assert!(message.contains("broken")),
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn silent_nonzero_exit_is_a_failure() {
        let result = shell().run_on(None, &["exit 3".to_string()]);
        assert!(matches!(result, Err(ShellError::Failed(_))));
    }

    #[test]
    fn slow_commands_time_out() {
        let quick = Shell::new(Duration::from_millis(200));
        let result = quick.run_on(None, &["sleep 5".to_string()]);
        assert!(matches!(result, Err(ShellError::Timeout(_))));
    }

    #[test]
    fn output_beyond_the_pipe_buffer_does_not_time_out() {
        // ~170 KiB, well past the usual 64 KiB pipe buffer
        let quick = Shell::new(Duration::from_secs(2));
        let blocks = quick.run_on(None, &["seq 1 30000".to_string()]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lines().count(), 30000);
        assert!(blocks[0].ends_with("30000"));
    }
}
