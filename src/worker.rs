//! Worker loop and the per-job build pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::{self, ArchiveStream, UnpackOptions};
use crate::error::JobError;
use crate::executor::BuildExecutor;
use crate::job::{BuildRequest, Job, JobOutcome, JobState};
use crate::queue::JobReceiver;
use crate::sandbox::SandboxSlot;

/// A long-lived consumer bound to one sandbox slot.
pub struct Worker {
    slot: SandboxSlot,
    executor: Arc<BuildExecutor>,
    jobs: JobReceiver,
    unpack: UnpackOptions,
    busy: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(
        slot: SandboxSlot,
        executor: Arc<BuildExecutor>,
        jobs: JobReceiver,
        unpack: UnpackOptions,
        busy: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            slot,
            executor,
            jobs,
            unpack,
            busy,
        }
    }

    /// Serve jobs until the queue closes.
    pub async fn run(mut self) {
        let index = self.slot.index();
        info!(worker = index, "Worker started");
        while let Some(job) = self.jobs.next().await {
            self.process(job).await;
        }
        info!(worker = index, "Job queue closed, worker exiting");
    }

    async fn process(&mut self, job: Job) {
        let Job {
            request,
            archive,
            cancel,
            done,
        } = job;
        let span = info_span!(
            "job",
            job_id = %request.id,
            package = %request.package,
            worker = self.slot.index()
        );

        async {
            self.busy.fetch_add(1, Ordering::SeqCst);
            let outcome = build_once(
                &mut self.slot,
                &self.executor,
                &request,
                archive,
                &cancel,
                self.unpack,
            )
            .await;
            self.busy.fetch_sub(1, Ordering::SeqCst);

            match &outcome {
                Ok(artifact) => info!(bytes = artifact.len, "Build succeeded"),
                Err(e) => warn!(kind = %e.kind(), error = %e, "Build failed"),
            }
            if !done.fire(outcome) {
                debug!("Requester gone before completion");
            }
        }
        .instrument(span)
        .await
    }
}

/// Run one job through the pipeline on `slot`.
///
/// The slot directory is removed before this returns, on every path; a
/// successful artifact stays readable through its open handle.
pub async fn build_once(
    slot: &mut SandboxSlot,
    executor: &BuildExecutor,
    request: &BuildRequest,
    archive: ArchiveStream,
    cancel: &CancellationToken,
    unpack: UnpackOptions,
) -> JobOutcome {
    let mut state = JobState::Submitted;
    if cancel.is_cancelled() {
        state.advance(JobState::Failed(JobError::Cancelled.kind()));
        return Err(JobError::Cancelled);
    }

    let outcome = match slot.checkout().await {
        Ok(lease) => {
            let outcome = run_pipeline(
                lease.path(),
                executor,
                request,
                archive,
                cancel,
                unpack,
                &mut state,
            )
            .await;
            lease.release().await;
            outcome
        }
        Err(e) => Err(e.into()),
    };

    let terminal = match &outcome {
        Ok(_) => JobState::Succeeded,
        Err(e) => JobState::Failed(e.kind()),
    };
    state.advance(terminal);
    if !state.is_terminal() {
        warn!(from = %state, to = %terminal, "Unexpected job state transition");
    }
    debug!(state = %state, "Job finished");
    outcome
}

async fn run_pipeline(
    sandbox: &std::path::Path,
    executor: &BuildExecutor,
    request: &BuildRequest,
    archive: ArchiveStream,
    cancel: &CancellationToken,
    unpack: UnpackOptions,
    state: &mut JobState,
) -> JobOutcome {
    state.advance(JobState::Extracting);
    debug!(state = %state, sandbox = %sandbox.display(), "Extracting archive");
    archive::extract(archive, sandbox, unpack).await?;
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    state.advance(JobState::Building);
    debug!(state = %state, "Invoking toolchain");
    executor
        .run_toolchain(sandbox, &request.package, request.insecure, cancel)
        .await?;

    executor.resolve_artifact(sandbox, &request.package).await
}
