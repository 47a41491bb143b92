//! Error types for the build pipeline and the HTTP surface.

use std::fmt;
use std::io;
use std::path::PathBuf;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

/// Fixed body returned when an upload exceeds the archive cap.
pub const TOO_LARGE_MESSAGE: &str = "request body too large";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// A filesystem operation on a sandbox directory failed.
#[derive(Debug, thiserror::Error)]
#[error("sandbox {op} {}: {source}", path.display())]
pub struct SandboxError {
    pub path: PathBuf,
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

/// Why a job did not produce an artifact.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{}", TOO_LARGE_MESSAGE)]
    ArchiveTooLarge,

    #[error("extract archive: {0}")]
    Extract(#[source] io::Error),

    /// The toolchain could not be launched, exited non-zero, or timed out.
    #[error("build failed: {reason}")]
    Build { reason: String, log: Vec<u8> },

    #[error("build reported success but {} is missing: {source}", path.display())]
    ArtifactMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("build cancelled")]
    Cancelled,
}

/// Coarse classification of a [`JobError`], used for logging and job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ArchiveTooLarge,
    Extract,
    Build,
    ArtifactMissing,
    Sandbox,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArchiveTooLarge => "archive_too_large",
            Self::Extract => "extract",
            Self::Build => "build",
            Self::ArtifactMissing => "artifact_missing",
            Self::Sandbox => "sandbox",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ArchiveTooLarge => FailureKind::ArchiveTooLarge,
            Self::Extract(_) => FailureKind::Extract,
            Self::Build { .. } => FailureKind::Build,
            Self::ArtifactMissing { .. } => FailureKind::ArtifactMissing,
            Self::Sandbox(_) => FailureKind::Sandbox,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Captured toolchain output, if the failure produced any.
    pub fn log(&self) -> Option<&[u8]> {
        match self {
            Self::Build { log, .. } if !log.is_empty() => Some(log),
            _ => None,
        }
    }

    /// Text shown to the client: the build log verbatim, or the error itself.
    pub fn diagnostic(&self) -> Vec<u8> {
        match self.log() {
            Some(log) => log.to_vec(),
            None => format!("{}\n", self).into_bytes(),
        }
    }
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid package path: {0}")]
    InvalidPackage(String),

    #[error("server busy: build queue is full")]
    Busy,

    #[error("worker dropped the job without reporting a result")]
    WorkerGone,

    #[error("range not satisfiable")]
    RangeNotSatisfiable { len: u64 },

    #[error("stream artifact: {0}")]
    Artifact(#[source] io::Error),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let text = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
        match self {
            ApiError::InvalidPackage(_) => {
                warn!(error = %self, "Rejected build request");
                (StatusCode::BAD_REQUEST, text, format!("{}\n", self)).into_response()
            }
            ApiError::Busy => {
                warn!("Build queue full, refusing request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8"), (header::RETRY_AFTER, "1")],
                    format!("{}\n", self),
                )
                    .into_response()
            }
            ApiError::WorkerGone | ApiError::Artifact(_) => {
                error!(error = %self, "Internal error serving build");
                (StatusCode::INTERNAL_SERVER_ERROR, text, format!("{}\n", self)).into_response()
            }
            ApiError::RangeNotSatisfiable { len } => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", len))],
            )
                .into_response(),
            ApiError::Job(JobError::ArchiveTooLarge) => {
                warn!("Archive exceeds size cap");
                (StatusCode::PAYLOAD_TOO_LARGE, text, TOO_LARGE_MESSAGE).into_response()
            }
            ApiError::Job(err) => {
                warn!(kind = %err.kind(), error = %err, "Build failed");
                (StatusCode::UNPROCESSABLE_ENTITY, text, err.diagnostic()).into_response()
            }
        }
    }
}
