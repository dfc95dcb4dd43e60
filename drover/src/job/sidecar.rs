use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// file name of the start record inside a job directory
pub const SIDECAR_FILE: &str = "job.pid";

/// Where and as what a job was last started.
///
/// Written next to the job's own files on start, so a completely fresh
/// controller process can pick a running job back up just by looking at the
/// directory. Four lines: name, node, pid, unix timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub name: String,
    pub node: String,
    pub pid: u64,
    pub timestamp: i64,
}

impl Sidecar {
    pub fn path(directory: &Path) -> PathBuf {
        directory.join(SIDECAR_FILE)
    }

    pub fn save(&self, directory: &Path) -> io::Result<()> {
        fs::write(
            Self::path(directory),
            format!("{}\n{}\n{}\n{}\n", self.name, self.node, self.pid, self.timestamp),
        )
    }

    /// `Ok(None)` when no record exists; a record that cannot be parsed is an
    /// error, not an absence, so a mangled file never looks like "not started"
    pub fn load(directory: &Path) -> io::Result<Option<Self>> {
        let text = match fs::read_to_string(Self::path(directory)) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };

        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < 4 {
            return Err(corrupt(&format!("{} of 4 lines", lines.len())));
        }
        let pid = lines[2]
            .trim()
            .parse()
            .map_err(|_| corrupt(&format!("pid line {:?}", lines[2])))?;
        let timestamp = lines[3]
            .trim()
            .parse()
            .map_err(|_| corrupt(&format!("timestamp line {:?}", lines[3])))?;

        Ok(Some(Self {
            name: lines[0].trim().to_string(),
            node: lines[1].trim().to_string(),
            pid,
            timestamp,
        }))
    }

    pub fn remove(directory: &Path) {
        let _ = fs::remove_file(Self::path(directory));
    }
}

fn corrupt(detail: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("start record is damaged: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip_keeps_node_and_pid() {
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar {
            name: "fit_a".to_string(),
            node: "n03".to_string(),
            pid: 4711,
            timestamp: 1_700_000_000,
        };
        sidecar.save(dir.path()).unwrap();

        let loaded = Sidecar::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, sidecar);
    }

    #[test]
    fn missing_record_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Sidecar::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn damaged_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SIDECAR_FILE), "fit\nn01\nnot-a-pid\n123\n").unwrap();
        assert!(Sidecar::load(dir.path()).is_err());

        std::fs::write(dir.path().join(SIDECAR_FILE), "fit\nn01\n").unwrap();
        assert!(Sidecar::load(dir.path()).is_err());
    }

    #[test]
    fn remove_clears_the_record() {
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar {
            name: "fit".to_string(),
            node: "n1".to_string(),
            pid: 1,
            timestamp: 0,
        };
        sidecar.save(dir.path()).unwrap();
        Sidecar::remove(dir.path());
        assert!(Sidecar::load(dir.path()).unwrap().is_none());
    }
}
