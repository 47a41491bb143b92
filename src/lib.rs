//! Buildbox - remote build service.
//!
//! Clients upload a source archive to `POST /build/<package>`; one of a fixed
//! set of workers extracts it into its own sandbox directory, runs the
//! toolchain there, and the compiled binary (or the build log) is returned.

#[cfg(not(target_os = "linux"))]
compile_error!("buildbox only works on Linux.");

pub mod archive;
pub mod config;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod job;
pub mod queue;
pub mod sandbox;
pub mod state;
pub mod worker;

pub use config::Config;
pub use error::{ApiError, JobError};
pub use state::AppState;
