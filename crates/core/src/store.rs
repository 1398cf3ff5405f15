//! Registry of in-flight uploads.
//!
//! Per path the store moves through `Absent → Live → Sealed`, or
//! `Live → Deleted` on an explicit delete. Only live paths have a registry
//! entry; sealed resources are plain files below the storage root.
//!
//! The registry lock is held for map operations only. Creating files,
//! appending, reading and removing all happen after it is released.

use crate::error::{Error, Result};
use crate::path::ResourcePath;
use crate::resource::{LiveResource, ReaderCursor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Registry entry for a path with an upload in progress
#[derive(Debug)]
struct Slot {
    upload_id: u64,
    /// `None` while the backing file is being created
    resource: Option<Arc<LiveResource>>,
}

/// Observable state of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Absent,
    Live,
    Sealed,
}

/// What a delete removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    /// An in-flight upload was aborted and its partial file removed
    Live,
    /// A completed file was removed
    Sealed,
    /// Nothing existed at the path
    Absent,
}

#[derive(Debug)]
pub struct LiveStreamStore {
    root: PathBuf,
    live: Mutex<HashMap<ResourcePath, Slot>>,
    next_upload_id: AtomicU64,
}

impl LiveStreamStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            live: Mutex::new(HashMap::new()),
            next_upload_id: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, path: &ResourcePath) -> PathBuf {
        path.to_file_path(&self.root)
    }

    /// Number of paths with an upload in progress
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn state(&self, path: &ResourcePath) -> PathState {
        if self.live.lock().contains_key(path) {
            return PathState::Live;
        }
        if self.file_path(path).is_file() {
            PathState::Sealed
        } else {
            PathState::Absent
        }
    }

    /// Start a new upload at `path`.
    ///
    /// Fails with [`Error::Conflict`] while another upload to the same path is
    /// in progress. A sealed file at the path is superseded: it is unlinked
    /// first, so readers still streaming it keep their copy.
    pub async fn begin_upload(self: &Arc<Self>, path: &ResourcePath) -> Result<Upload> {
        if path.is_root() {
            return Err(Error::InvalidPath("Cannot upload to the storage root".to_string()));
        }

        let upload_id = self.next_upload_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut live = self.live.lock();
            if live.contains_key(path) {
                return Err(Error::Conflict(path.to_string()));
            }
            live.insert(
                path.clone(),
                Slot {
                    upload_id,
                    resource: None,
                },
            );
        }

        let resource = match self.create_backing(path).await {
            Ok(resource) => resource,
            Err(err) => {
                self.release(path, upload_id);
                return Err(err);
            }
        };

        let published = {
            let mut live = self.live.lock();
            match live.get_mut(path) {
                Some(slot) if slot.upload_id == upload_id => {
                    slot.resource = Some(Arc::clone(&resource));
                    true
                }
                _ => false,
            }
        };

        if !published {
            // Deleted while the backing file was being created
            resource.abort("deleted");
            resource.close().await;
            return Err(Error::Aborted {
                path: path.to_string(),
                reason: "deleted".to_string(),
            });
        }

        info!(path = %path, upload_id, "Upload started");
        Ok(Upload {
            store: Arc::clone(self),
            path: path.clone(),
            upload_id,
            resource,
            finished: false,
        })
    }

    async fn create_backing(&self, path: &ResourcePath) -> Result<Arc<LiveResource>> {
        let file_path = self.file_path(path);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        remove_if_exists(&file_path).await?;
        LiveResource::open(file_path).await
    }

    /// Drop the registry entry if it still belongs to `upload_id`
    fn release(&self, path: &ResourcePath, upload_id: u64) -> bool {
        let mut live = self.live.lock();
        match live.get(path) {
            Some(slot) if slot.upload_id == upload_id => {
                live.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Attach a reader to the in-flight upload at `path`, if there is one
    pub fn attach(&self, path: &ResourcePath) -> Option<ReaderCursor> {
        let resource = self
            .live
            .lock()
            .get(path)
            .and_then(|slot| slot.resource.clone())?;
        debug!(path = %path, written = resource.written(), "Attached live reader");
        Some(resource.new_reader())
    }

    /// Remove whatever is stored at `path`.
    ///
    /// A live upload is aborted first, so its blocked readers fail instead
    /// of seeing a clean end-of-stream. Removing a missing file is a no-op.
    pub async fn delete(&self, path: &ResourcePath) -> Result<Deleted> {
        if path.is_root() {
            return Err(Error::InvalidPath("Cannot delete the storage root".to_string()));
        }

        let slot = self.live.lock().remove(path);
        let file_path = self.file_path(path);

        match slot {
            Some(slot) => {
                if let Some(resource) = slot.resource {
                    resource.abort("deleted");
                }
                remove_if_exists(&file_path).await?;
                info!(path = %path, upload_id = slot.upload_id, "Deleted live resource");
                Ok(Deleted::Live)
            }
            None => {
                if remove_if_exists(&file_path).await? {
                    info!(path = %path, "Deleted sealed resource");
                    Ok(Deleted::Sealed)
                } else {
                    debug!(path = %path, "Delete of absent resource");
                    Ok(Deleted::Absent)
                }
            }
        }
    }
}

/// Returns whether a file was removed. Directories are left alone and
/// count as nothing removed.
async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {
                warn!(path = %path.display(), "Refusing to remove a directory");
                Ok(false)
            }
            _ => Err(Error::Io(err)),
        },
    }
}

/// Write side of an in-flight upload.
///
/// Dropping an `Upload` without calling [`Upload::seal`] or
/// [`Upload::abort`] seals it at the length received so far.
#[derive(Debug)]
pub struct Upload {
    store: Arc<LiveStreamStore>,
    path: ResourcePath,
    upload_id: u64,
    resource: Arc<LiveResource>,
    finished: bool,
}

impl Upload {
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.resource.written()
    }

    pub async fn append(&self, data: &[u8]) -> Result<()> {
        self.resource.append(data).await
    }

    /// Close the resource cleanly and remove its registry entry
    pub async fn seal(mut self) -> u64 {
        self.finished = true;
        self.resource.close().await;
        self.store.release(&self.path, self.upload_id);
        let written = self.resource.written();
        info!(path = %self.path, written, "Upload sealed");
        written
    }

    /// Fail the resource for every reader and remove its registry entry.
    /// The bytes written so far stay on disk.
    pub async fn abort(mut self, reason: impl Into<String>) {
        self.finished = true;
        let reason = reason.into();
        warn!(path = %self.path, reason = %reason, "Upload aborted");
        self.resource.abort(reason);
        self.resource.close().await;
        self.store.release(&self.path, self.upload_id);
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if !self.finished {
            warn!(path = %self.path, written = self.resource.written(), "Upload dropped, sealing");
            self.resource.mark_closed();
            self.store.release(&self.path, self.upload_id);
        }
    }
}
