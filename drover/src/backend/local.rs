use crate::config::ConfigError;

/// The machine drover itself runs on, as a pool of one.
///
/// Same command set as the ssh pool, just without the ssh. Mostly useful for
/// trying a queue out before pointing it at real hardware.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    pub hostname: String,
}

impl LocalBackend {
    pub fn load() -> Result<Self, ConfigError> {
        let hostname = nix::unistd::gethostname()
            .map_err(ConfigError::Hostname)?
            .to_string_lossy()
            .into_owned();
        Ok(Self { hostname })
    }

    pub fn capacity(&self) -> f64 {
        num_cpus::get() as f64
    }
}
