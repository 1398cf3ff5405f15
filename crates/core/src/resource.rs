//! Single-writer, multi-reader byte sequence backed by an append-only file.
//!
//! The writer appends through [`LiveResource::append`]; every reader owns a
//! [`ReaderCursor`] and tails the file independently with positional reads on
//! a handle opened together with the file. Writer and readers only meet at a
//! `watch` channel carrying the flushed length and the lifecycle state, so a
//! slow reader never holds up the writer or another reader.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

/// Lifecycle of a live resource. Leaves `Live` exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Live,
    Closed,
    Aborted(String),
}

/// Snapshot published to readers after every state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Bytes written and flushed to the backing file
    pub written: u64,
    pub state: ResourceState,
}

#[derive(Debug)]
pub struct LiveResource {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    /// Read handle on the inode created by `open`. Stays valid after the
    /// path is unlinked or reused by a later upload.
    reader: Arc<std::fs::File>,
    progress: watch::Sender<Progress>,
}

impl LiveResource {
    /// Create the backing file (truncating any previous content) and the
    /// control block.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        let reader = File::open(&path).await?.into_std().await;

        let (progress, _) = watch::channel(Progress {
            written: 0,
            state: ResourceState::Live,
        });

        debug!(path = %path.display(), "Opened live resource");

        Ok(Arc::new(Self {
            path,
            writer: Mutex::new(Some(file)),
            reader: Arc::new(reader),
            progress,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn written(&self) -> u64 {
        self.progress.borrow().written
    }

    pub fn state(&self) -> ResourceState {
        self.progress.borrow().state.clone()
    }

    pub fn is_live(&self) -> bool {
        self.progress.borrow().state == ResourceState::Live
    }

    /// Append `data` and wake every reader waiting at the previous length.
    ///
    /// Appends are serialized by the writer lock, which readers never take.
    /// The new length is published only once the bytes are flushed.
    pub async fn append(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.check_writable()?;
        if data.is_empty() {
            return Ok(());
        }

        let Some(file) = writer.as_mut() else {
            return Err(Error::Closed(self.path.display().to_string()));
        };

        let write = async {
            file.write_all(data).await?;
            file.flush().await
        };
        if let Err(err) = write.await {
            warn!(path = %self.path.display(), error = %err, "Append failed, aborting resource");
            writer.take();
            self.abort(err.to_string());
            return Err(Error::Io(err));
        }

        let len = data.len() as u64;
        self.progress.send_modify(|p| p.written += len);
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        match &self.progress.borrow().state {
            ResourceState::Live => Ok(()),
            ResourceState::Closed => Err(Error::Closed(self.path.display().to_string())),
            ResourceState::Aborted(reason) => Err(Error::Aborted {
                path: self.path.display().to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Release the file handle and mark the resource closed. Readers drain the
    /// remaining bytes and then see end-of-stream. No-op once closed or aborted.
    pub async fn close(&self) {
        let file = self.writer.lock().await.take();
        if let Some(mut file) = file {
            if let Err(err) = file.flush().await {
                warn!(path = %self.path.display(), error = %err, "Flush on close failed");
            }
        }
        self.mark_closed();
    }

    /// Synchronous close used when the writer goes away without finishing.
    /// Every published byte is already flushed, so nothing is lost.
    pub(crate) fn mark_closed(&self) -> bool {
        self.progress.send_if_modified(|p| {
            if p.state == ResourceState::Live {
                p.state = ResourceState::Closed;
                true
            } else {
                false
            }
        })
    }

    /// Close with an error. Blocked and future reads fail with `reason`
    /// regardless of their offset. No-op once closed.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.progress.send_if_modified(|p| {
            if p.state == ResourceState::Live {
                p.state = ResourceState::Aborted(reason);
                true
            } else {
                false
            }
        })
    }

    /// New cursor at offset 0, independent of all other cursors and of the
    /// writer position.
    pub fn new_reader(self: &Arc<Self>) -> ReaderCursor {
        ReaderCursor {
            resource: Arc::clone(self),
            progress: self.progress.subscribe(),
            offset: 0,
        }
    }
}

/// A reader's private position in a live resource
#[derive(Debug)]
pub struct ReaderCursor {
    resource: Arc<LiveResource>,
    progress: watch::Receiver<Progress>,
    offset: u64,
}

impl ReaderCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.resource.path
    }

    /// Read up to `max` bytes.
    ///
    /// Returns available bytes immediately, waits (without polling) while
    /// caught up with a live writer, and returns `None` once a cleanly closed
    /// resource is exhausted. An aborted resource fails every read.
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>> {
        let offset = self.offset;
        let progress = self
            .progress
            .wait_for(|p| p.written > offset || p.state != ResourceState::Live)
            .await
            .map_err(|_| Error::Closed(self.resource.path.display().to_string()))?
            .clone();

        if let ResourceState::Aborted(reason) = progress.state {
            return Err(Error::Aborted {
                path: self.resource.path.display().to_string(),
                reason,
            });
        }

        if progress.written <= offset || max == 0 {
            return Ok(None);
        }

        let want = (progress.written - offset).min(max as u64) as usize;
        let chunk = self.read_exact_at_cursor(want).await?;
        self.offset += chunk.len() as u64;
        Ok(Some(chunk))
    }

    async fn read_exact_at_cursor(&self, want: usize) -> Result<Bytes> {
        let file = Arc::clone(&self.resource.reader);
        let offset = self.offset;
        let chunk = tokio::task::spawn_blocking(move || read_exact_at(&file, offset, want))
            .await
            .map_err(io::Error::other)?;
        match chunk {
            Ok(chunk) => Ok(chunk),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while being read", self.resource.path.display()),
                )))
            }
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Turn the cursor into a stream of chunks of at most `chunk_size` bytes,
    /// ending at end-of-stream and failing with the abort reason.
    pub fn into_stream(mut self, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> {
        async_stream::stream! {
            loop {
                match self.read(chunk_size).await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(io::Error::other(err));
                        break;
                    }
                }
            }
        }
    }
}

fn read_exact_at(file: &std::fs::File, mut offset: u64, want: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(want);
    let mut filled = 0;
    while filled < want {
        match read_at(file, &mut buf[filled..], offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                filled += n;
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(buf.freeze())
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

// The read handle is separate from the writer's, so moving its cursor is harmless
#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
