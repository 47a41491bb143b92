//! Build jobs: the unit of work handed from the HTTP layer to a worker.

use std::fmt;

use tokio::fs::File;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::ArchiveStream;
use crate::error::{ApiError, FailureKind, JobError};

/// What a finished job hands back to its requester.
pub type JobOutcome = Result<Artifact, JobError>;

/// A validated package identifier, e.g. `example/hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePath(String);

impl PackagePath {
    /// Validate a package identifier taken from the request path.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err("package path is empty".to_string());
        }
        if trimmed.starts_with('-') {
            return Err(format!("package path {:?} looks like a flag", trimmed));
        }
        if trimmed.chars().any(|c| c == '\0' || c.is_whitespace()) {
            return Err(format!("package path {:?} contains whitespace or NUL", trimmed));
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(format!("package path {:?} has an invalid segment", trimmed));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name the toolchain gives the installed binary.
    pub fn binary_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The immutable description of one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: Uuid,
    pub package: PackagePath,
    /// Allow dependency fetches over unvalidated transport.
    pub insecure: bool,
}

impl BuildRequest {
    pub fn new(package: PackagePath, insecure: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            package,
            insecure,
        }
    }
}

/// A queued build. Owned by exactly one worker once dequeued.
pub struct Job {
    pub request: BuildRequest,
    /// Read once, by the worker that runs the build.
    pub archive: ArchiveStream,
    /// Cancelled when the requester goes away.
    pub cancel: CancellationToken,
    pub done: CompletionSignal,
}

impl Job {
    /// Create a job and the handle its requester waits on.
    pub fn new(
        request: BuildRequest,
        archive: ArchiveStream,
        cancel: CancellationToken,
    ) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            request,
            archive,
            cancel,
            done: CompletionSignal(tx),
        };
        (job, Completion(rx))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("request", &self.request)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Worker side of the one-shot completion signal.
#[derive(Debug)]
pub struct CompletionSignal(oneshot::Sender<JobOutcome>);

impl CompletionSignal {
    /// Deliver the outcome. Returns `false` if nobody is waiting any more.
    pub fn fire(self, outcome: JobOutcome) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Requester side of the one-shot completion signal.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<JobOutcome>);

impl Completion {
    pub async fn wait(self) -> Result<JobOutcome, ApiError> {
        self.0.await.map_err(|_| ApiError::WorkerGone)
    }
}

/// A compiled binary, held open after its sandbox directory is gone.
#[derive(Debug)]
pub struct Artifact {
    pub file: File,
    pub len: u64,
    pub name: String,
}

/// Progress of a job through the build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Extracting,
    Building,
    Succeeded,
    Failed(FailureKind),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    pub fn can_advance_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (Self::Submitted, Self::Extracting) => true,
            (Self::Extracting, Self::Building) => true,
            (Self::Building, Self::Succeeded) => true,
            (current, Self::Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next`, returning whether the transition was legal.
    pub fn advance(&mut self, next: JobState) -> bool {
        if self.can_advance_to(&next) {
            *self = next;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => f.write_str("submitted"),
            Self::Extracting => f.write_str("extracting"),
            Self::Building => f.write_str("building"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}
