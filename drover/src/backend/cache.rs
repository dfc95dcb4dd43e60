use chrono::Utc;
use once_cell::sync::Lazy;
use std::{env, fs, io, path::PathBuf, time::Duration};
use tracing::debug;

/// where availability snapshots land unless configured otherwise
pub static DEFAULT_CACHE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    let base = env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("drover")
});

const TIMESTAMP_FILE: &str = "timestamp.nodes";
const NAMES_FILE: &str = "names.nodes";
const SLOTS_FILE: &str = "slots.nodes";

/// On-disk snapshot of node availability.
///
/// Probing a pool takes one ssh round trip per node, so the result is kept
/// in a shared temp directory and reused by every invocation within the
/// memory window. Three files: a unix timestamp, node names and slot counts,
/// one entry per line.
#[derive(Debug, Clone)]
pub struct NodeCache {
    directory: PathBuf,
    window: Duration,
}

impl NodeCache {
    pub fn new(directory: PathBuf, window: Duration) -> Self {
        Self { directory, window }
    }

    /// snapshot if one exists and is younger than the memory window
    pub fn load(&self) -> Option<(Vec<String>, Vec<f64>)> {
        let stamp: i64 = fs::read_to_string(self.directory.join(TIMESTAMP_FILE))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let age = Utc::now().timestamp().saturating_sub(stamp);
        if age < 0 || age as u64 > self.window.as_secs() {
            debug!("node snapshot is {age}s old, ignoring it");
            return None;
        }

        let names: Vec<String> = fs::read_to_string(self.directory.join(NAMES_FILE))
            .ok()?
            .lines()
            .map(str::to_string)
            .collect();
        let slots: Vec<f64> = fs::read_to_string(self.directory.join(SLOTS_FILE))
            .ok()?
            .lines()
            .map(|line| line.trim().parse().ok())
            .collect::<Option<Vec<f64>>>()?;

        if names.is_empty() || names.len() != slots.len() {
            return None;
        }
        debug!("reusing a {age}s old node snapshot for {} nodes", names.len());
        Some((names, slots))
    }

    pub fn save(&self, names: &[String], slots: &[f64]) -> io::Result<()> {
        fs::create_dir_all(&self.directory)?;
        fs::write(self.directory.join(NAMES_FILE), names.join("\n"))?;
        let formatted: Vec<String> = slots.iter().map(|slot| format!("{slot:.4}")).collect();
        fs::write(self.directory.join(SLOTS_FILE), formatted.join("\n"))?;
        // the timestamp goes last so a torn write never looks fresh
        fs::write(
            self.directory.join(TIMESTAMP_FILE),
            Utc::now().timestamp().to_string(),
        )?;
        Ok(())
    }

    /// drop the snapshot so the next load forces a fresh probe
    pub fn clear(&self) {
        for file in [TIMESTAMP_FILE, NAMES_FILE, SLOTS_FILE] {
            let _ = fs::remove_file(self.directory.join(file));
        }
    }
}
