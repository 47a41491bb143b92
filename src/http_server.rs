//! HTTP server implementation using Axum.

use std::io::{self, SeekFrom};
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::archive::ArchiveStream;
use crate::error::{ApiError, JobError};
use crate::job::{Artifact, BuildRequest, Job, PackagePath};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
struct BuildParams {
    #[serde(default)]
    insecure: Option<String>,
}

impl BuildParams {
    fn insecure(&self) -> bool {
        self.insecure.as_deref() == Some("true")
    }
}

#[derive(Serialize)]
struct StatusResponse {
    workers: usize,
    busy: usize,
    queued: usize,
    queue_capacity: usize,
    max_archive_bytes: u64,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/build/*package", post(build))
        // Uploads are capped by the build handler itself.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `0.0.0.0:<port>` and serve until the listener fails.
pub async fn run_server(port: u16, state: AppState) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state).await
}

/// Serve on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.info.clone(),
    )
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        workers: state.config.workers,
        busy: state.busy(),
        queued: state.queue.depth(),
        queue_capacity: state.queue.capacity(),
        max_archive_bytes: state.config.max_archive_bytes,
    })
}

async fn build(
    State(state): State<AppState>,
    Path(package): Path<String>,
    Query(params): Query<BuildParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let package = PackagePath::parse(&package).map_err(ApiError::InvalidPackage)?;
    let limit = state.config.max_archive_bytes;

    // A declared oversize body is refused before any work is queued.
    if content_length(&headers).is_some_and(|len| len > limit) {
        return Err(JobError::ArchiveTooLarge.into());
    }

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let archive = ArchiveStream::new(reader, limit);
    let request = BuildRequest::new(package, params.insecure());
    info!(job_id = %request.id, package = %request.package, insecure = request.insecure, "POST /build");

    // Dropping this handler (client disconnect) cancels the build.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let (job, completion) = Job::new(request, archive, cancel);
    state.queue.submit(job)?;

    let outcome = completion.wait().await;
    guard.disarm();
    let artifact = outcome??;

    serve_artifact(artifact, headers.get(header::RANGE)).await
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Stream the artifact, honouring a single byte range if one was requested.
/// The file handle is closed when the body finishes or is dropped.
async fn serve_artifact(artifact: Artifact, range: Option<&HeaderValue>) -> Result<Response, ApiError> {
    let Artifact { mut file, len, name } = artifact;
    let disposition = format!("attachment; filename=\"{}\"", name);

    let Some((start, end)) = parse_range(range, len)? else {
        debug!(bytes = len, "Streaming artifact");
        let body = Body::from_stream(ReaderStream::new(file));
        return Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, len.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            body,
        )
            .into_response());
    };

    file.seek(SeekFrom::Start(start))
        .await
        .map_err(ApiError::Artifact)?;
    let part_len = end - start + 1;
    debug!(start, end, bytes = part_len, "Streaming artifact range");
    let body = Body::from_stream(ReaderStream::new(file.take(part_len)));
    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, part_len.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// Parse a single `bytes=` range into inclusive offsets.
///
/// Headers we do not understand (multiple ranges, other units) are ignored
/// and the whole artifact is served.
fn parse_range(header: Option<&HeaderValue>, len: u64) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(spec) = header
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
    else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((first, last)) = spec.split_once('-') else {
        return Ok(None);
    };
    let unsatisfiable = ApiError::RangeNotSatisfiable { len };

    match (first.trim(), last.trim()) {
        ("", suffix) => {
            let Ok(n) = suffix.parse::<u64>() else {
                return Ok(None);
            };
            if n == 0 || len == 0 {
                return Err(unsatisfiable);
            }
            Ok(Some((len.saturating_sub(n), len - 1)))
        }
        (first, last) => {
            let Ok(start) = first.parse::<u64>() else {
                return Ok(None);
            };
            let end = if last.is_empty() {
                len.saturating_sub(1)
            } else {
                match last.parse::<u64>() {
                    Ok(end) if end >= start => end.min(len.saturating_sub(1)),
                    _ => return Ok(None),
                }
            };
            if start >= len {
                return Err(unsatisfiable);
            }
            Ok(Some((start, end)))
        }
    }
}
