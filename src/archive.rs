//! Size-capped archive streams and their extraction into a sandbox.

use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use flate2::read::GzDecoder;
use tar::Archive;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};
use tokio_util::io::SyncIoBridge;

use crate::error::JobError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A read-once upload, capped at a fixed number of bytes.
///
/// Reading past the cap fails and marks the stream as oversized, so the
/// caller can tell an oversized upload apart from a malformed one.
pub struct ArchiveStream {
    reader: CappedReader<BoxedReader>,
    exceeded: Arc<AtomicBool>,
}

impl ArchiveStream {
    pub fn new<R>(reader: R, limit: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let exceeded = Arc::new(AtomicBool::new(false));
        let boxed: BoxedReader = Box::new(reader);
        Self {
            reader: CappedReader {
                inner: boxed.take(limit.saturating_add(1)),
                limit,
                seen: 0,
                exceeded: exceeded.clone(),
            },
            exceeded,
        }
    }

    /// True once more than the cap has been read.
    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }
}

impl AsyncRead for ArchiveStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

struct CappedReader<R> {
    inner: Take<R>,
    limit: u64,
    seen: u64,
    exceeded: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CappedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.seen += (buf.filled().len() - before) as u64;
        if self.seen > self.limit {
            self.exceeded.store(true, Ordering::Release);
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive exceeds {} bytes", self.limit),
            )));
        }
        Poll::Ready(Ok(()))
    }
}

/// Options for unpacking an archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions {
    /// Keep suid/sgid/sticky bits from the archive.
    pub preserve_permissions: bool,
}

/// Stream-extract `stream` into `dest`.
///
/// The tar reader is blocking, so it runs on the blocking pool, fed from the
/// async stream through a bridge. Bytes after the end-of-archive marker are
/// read too, so the whole upload counts toward the cap.
pub async fn extract(stream: ArchiveStream, dest: &Path, options: UnpackOptions) -> Result<(), JobError> {
    let exceeded = stream.exceeded.clone();
    let mut bridge = SyncIoBridge::new(stream);
    let dest: PathBuf = dest.to_path_buf();

    let result = tokio::task::spawn_blocking(move || {
        unpack(&mut bridge, &dest, options)?;
        io::copy(&mut bridge, &mut io::sink()).map(drop)
    })
    .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));

    match result {
        Ok(()) => Ok(()),
        Err(_) if exceeded.load(Ordering::Acquire) => Err(JobError::ArchiveTooLarge),
        Err(e) => Err(JobError::Extract(e)),
    }
}

/// Unpack a tar (optionally gzip-compressed) archive into `dest`.
///
/// Entries that would land outside `dest` are skipped by the tar crate.
pub fn unpack<R: Read>(reader: R, dest: &Path, options: UnpackOptions) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let source: Box<dyn Read + '_> = if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut archive = Archive::new(source);
    archive.set_preserve_permissions(options.preserve_permissions);
    archive.set_unpack_xattrs(false);
    archive.unpack(dest)
}
