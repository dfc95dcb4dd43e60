//! A controller for herds of long-running batch jobs.
//!
//! drover keeps no database: a job's status is derived on every query from
//! what the filesystem and the remote process tables actually show. On top of
//! that sit a weight-based job selector, a randomized load distributor and a
//! small set of exchangeable backends (ssh pool, SLURM, local machine).

pub mod backend;
pub mod config;
pub mod distribute;
pub mod job;
pub mod queue;
pub mod shell;

pub use backend::{Backend, BackendError, RemoteProcess};
pub use config::{Config, ConfigError};
pub use job::{JobError, Jobs, Status};
pub use queue::{Queue, QueueError, StartBudget};
