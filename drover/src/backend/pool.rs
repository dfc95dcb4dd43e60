use super::{cache::NodeCache, BackendError};
use crate::shell::Shell;
use tracing::{debug, warn};

/// counts physical cores on the remote side
const CPU_COUNT_CMD: &str = "grep 'model name' /proc/cpuinfo | wc -l";

/// Ad-hoc pool of machines reached over ssh.
///
/// Capacity is probed, not configured: a node offers its core count minus its
/// one-minute load, so other users' work shrinks what we schedule onto it.
#[derive(Debug, Clone)]
pub struct PoolBackend {
    pub nodes: Vec<String>,
    pub cache: NodeCache,
}

impl PoolBackend {
    /// probe every node for free slots, dropping the ones that do not answer
    pub fn availability(&self, shell: &Shell) -> Result<(Vec<String>, Vec<f64>), BackendError> {
        if let Some(snapshot) = self.cache.load() {
            return Ok(snapshot);
        }

        let mut names = Vec::new();
        let mut slots = Vec::new();
        for node in self.nodes.iter() {
            let blocks = match shell.run_on(
                Some(node),
                &[CPU_COUNT_CMD.to_string(), "uptime".to_string()],
            ) {
                Ok(blocks) => blocks,
                Err(error) => {
                    warn!(node = %node, error = ?error, "node did not answer, leaving it out");
                    continue;
                }
            };

            match free_slots(&blocks[0], &blocks[1]) {
                Some(free) => {
                    debug!(node = %node, "{free:.2} free slots");
                    names.push(node.clone());
                    slots.push(free);
                }
                None => {
                    warn!(node = %node, "could not make sense of the probe output, leaving it out");
                }
            }
        }

        if names.is_empty() {
            return Err(BackendError::NoNodes);
        }
        if let Err(error) = self.cache.save(&names, &slots) {
            warn!(error = ?error, "could not save the node snapshot");
        }
        Ok((names, slots))
    }
}

/// slots = cores - 1min load, floored at zero
fn free_slots(cpu_count: &str, uptime: &str) -> Option<f64> {
    let cores: f64 = cpu_count.trim().parse::<u32>().ok()? as f64;
    let load = parse_load(uptime)?;
    Some((cores - load).max(0.0))
}

/// pick the one-minute load average out of an `uptime` line
fn parse_load(uptime: &str) -> Option<f64> {
    let fields: Vec<&str> = uptime.split_whitespace().collect();
    if fields.len() < 3 {
        return None;
    }
    // third field from the end, the line ends in "load average: a, b, c"
    fields[fields.len() - 3]
        .trim_end_matches(',')
        .parse()
        .ok()
}
