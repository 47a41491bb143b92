//! Per-worker scratch directories.
//!
//! Each worker owns one [`SandboxSlot`]. A slot's directory exists only while
//! a job is checked out on it: it is recreated empty at checkout and removed
//! again on release.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::SandboxError;

/// The fixed set of sandbox slots, one per worker.
#[derive(Debug)]
pub struct SandboxPool {
    root: PathBuf,
    slots: Vec<SandboxSlot>,
}

impl SandboxPool {
    /// Create the pool root and `count` slots at `<root>/<index>`.
    pub fn new(root: impl Into<PathBuf>, count: usize) -> Result<Self, SandboxError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| SandboxError {
            path: root.clone(),
            op: "create root",
            source,
        })?;
        let slots = (0..count)
            .map(|index| SandboxSlot {
                index,
                path: root.join(index.to_string()),
            })
            .collect();
        Ok(Self { root, slots })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hand out the slots, in index order, to their owning workers.
    pub fn into_slots(self) -> Vec<SandboxSlot> {
        self.slots
    }
}

/// One reusable sandbox directory.
#[derive(Debug)]
pub struct SandboxSlot {
    index: usize,
    path: PathBuf,
}

impl SandboxSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reset the directory and lend it out for a single job.
    pub async fn checkout(&mut self) -> Result<SandboxLease<'_>, SandboxError> {
        remove_dir(&self.path).await?;
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|source| SandboxError {
                path: self.path.clone(),
                op: "create",
                source,
            })?;
        debug!(slot = self.index, path = %self.path.display(), "Sandbox ready");
        Ok(SandboxLease { slot: self })
    }
}

/// Exclusive use of a slot's directory for the duration of one job.
#[derive(Debug)]
pub struct SandboxLease<'a> {
    slot: &'a mut SandboxSlot,
}

impl SandboxLease<'_> {
    pub fn path(&self) -> &Path {
        &self.slot.path
    }

    /// Remove the directory. Failure is logged; the slot is reset again on
    /// its next checkout anyway.
    pub async fn release(self) {
        if let Err(e) = remove_dir(&self.slot.path).await {
            warn!(slot = self.slot.index, error = %e, "Sandbox cleanup failed");
        }
    }
}

async fn remove_dir(path: &Path) -> Result<(), SandboxError> {
    let result = match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            // Archives and module caches can leave read-only directories.
            debug!(path = %path.display(), "Restoring write access before removal");
            let target = path.to_path_buf();
            tokio::task::spawn_blocking(move || make_dirs_writable(&target))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e)))
                .map_err(|source| SandboxError {
                    path: path.to_path_buf(),
                    op: "chmod",
                    source,
                })?;
            tokio::fs::remove_dir_all(path).await
        }
        other => other,
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SandboxError {
            path: path.to_path_buf(),
            op: "remove",
            source,
        }),
    }
}

/// Give the owner full access to every directory under `path`.
///
/// Symlinks are not followed.
fn make_dirs_writable(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o700);
    std::fs::set_permissions(path, perms)?;
    for entry in std::fs::read_dir(path)? {
        make_dirs_writable(&entry?.path())?;
    }
    Ok(())
}
