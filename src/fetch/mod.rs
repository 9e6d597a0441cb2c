//! Driving the external fetch tool
//!
//! This module builds aria2c command lines, supervises the running process,
//! parses its progress output and resolves descriptor files.

mod command;
pub mod descriptor;
mod progress;
mod registry;
mod supervisor;

use thiserror::Error;

pub use command::{Aria2Options, DEFAULT_TRACKERS, FetchCommand};
pub use descriptor::{DescriptorError, DescriptorFetcher};
pub use progress::ProgressSample;
pub use registry::ProcessRegistry;
pub use supervisor::{FetchOutcome, FetchSupervisor, SupervisorSettings};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Fetch process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
