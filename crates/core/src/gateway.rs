//! Filesystem fallback for paths without an upload in progress.

use crate::limiter::{TokenBucket, throttle};
use crate::path::ResourcePath;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

const INDEX_FILE: &str = "index.html";

/// Response header hints derived from a resource's extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentHints {
    pub content_type: Option<&'static str>,
    pub cache_control: Option<&'static str>,
}

/// Content type for the handful of extensions browsers need help with.
/// Applies to live and sealed responses alike. Matching is case-sensitive.
pub fn content_type_for(path: &ResourcePath) -> Option<&'static str> {
    match path.extension() {
        Some("css") => Some("text/css"),
        Some("js") => Some("text/javascript"),
        _ => None,
    }
}

/// Hints for a sealed file. Completed media segments never change, so they
/// can be cached.
pub fn hints_for(path: &ResourcePath) -> ContentHints {
    let cache_control = match path.extension() {
        Some("m4s") | Some("mp4") => Some("max-age=3600"),
        _ => None,
    };
    ContentHints {
        content_type: content_type_for(path),
        cache_control,
    }
}

/// Outcome of resolving a request against the storage root
#[derive(Debug)]
pub enum Resolved {
    File {
        file: File,
        path: PathBuf,
        len: u64,
        hints: ContentHints,
    },
    /// A directory was requested without a trailing slash
    Redirect,
    NotFound,
}

/// Resolve `path` below `root`.
///
/// Directories resolve to their `index.html`, but only when the request
/// ended in a slash; otherwise the caller is told to redirect so relative
/// links inside the index keep working.
pub async fn resolve(root: &Path, path: &ResourcePath, has_trailing_slash: bool) -> Resolved {
    let file_path = path.to_file_path(root);

    let metadata = match tokio::fs::metadata(&file_path).await {
        Ok(metadata) => metadata,
        Err(_) => return Resolved::NotFound,
    };

    if metadata.is_dir() {
        if !has_trailing_slash {
            return Resolved::Redirect;
        }
        let index_path = file_path.join(INDEX_FILE);
        let index_key = ResourcePath::from_uri_path(&format!("{}/{}", path.as_str(), INDEX_FILE));
        return match (open_file(&index_path).await, index_key) {
            (Some((file, len)), Ok(key)) => Resolved::File {
                file,
                path: index_path,
                len,
                hints: hints_for(&key),
            },
            _ => Resolved::NotFound,
        };
    }

    match open_file(&file_path).await {
        Some((file, len)) => Resolved::File {
            file,
            path: file_path,
            len,
            hints: hints_for(path),
        },
        None => Resolved::NotFound,
    }
}

async fn open_file(path: &Path) -> Option<(File, u64)> {
    let file = File::open(path).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    debug!(path = %path.display(), len = metadata.len(), "Serving file");
    Some((file, metadata.len()))
}

/// Stream an open file in chunks of at most `chunk_size` bytes
pub fn file_stream(mut file: File, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> {
    async_stream::try_stream! {
        loop {
            let mut buf = BytesMut::zeroed(chunk_size);
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            yield buf.freeze();
        }
    }
}

/// Stream an open file through a token bucket
pub fn paced_file_stream(
    file: File,
    chunk_size: usize,
    bucket: TokenBucket,
) -> impl Stream<Item = io::Result<Bytes>> {
    throttle(file_stream(file, chunk_size), bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::fs;
    use tempfile::TempDir;

    fn key(raw: &str) -> ResourcePath {
        ResourcePath::from_uri_path(raw).unwrap()
    }

    async fn collect(file: File, chunk_size: usize) -> Vec<u8> {
        let chunks: Vec<Bytes> = file_stream(file, chunk_size)
            .map(|c| c.unwrap())
            .collect()
            .await;
        chunks.concat()
    }

    #[tokio::test]
    async fn test_resolves_plain_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("vod")).unwrap();
        fs::write(dir.path().join("vod/seg1.m4s"), b"segment").unwrap();

        match resolve(dir.path(), &key("/vod/seg1.m4s"), false).await {
            Resolved::File { file, len, hints, .. } => {
                assert_eq!(len, 7);
                assert_eq!(hints.cache_control, Some("max-age=3600"));
                assert_eq!(hints.content_type, None);
                assert_eq!(collect(file, 3).await, b"segment");
            }
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve(dir.path(), &key("/nothing/here.mp4"), false).await;
        assert!(matches!(resolved, Resolved::NotFound));
    }

    #[tokio::test]
    async fn test_directory_without_slash_redirects() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("player")).unwrap();
        let resolved = resolve(dir.path(), &key("/player"), false).await;
        assert!(matches!(resolved, Resolved::Redirect));
    }

    #[tokio::test]
    async fn test_directory_with_slash_serves_index() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("player")).unwrap();
        fs::write(dir.path().join("player/index.html"), b"<html></html>").unwrap();

        match resolve(dir.path(), &key("/player/"), true).await {
            Resolved::File { path, file, .. } => {
                assert!(path.ends_with("player/index.html"));
                assert_eq!(collect(file, 64).await, b"<html></html>");
            }
            other => panic!("expected index, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_directory_without_index_is_not_found() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        let resolved = resolve(dir.path(), &key("/empty/"), true).await;
        assert!(matches!(resolved, Resolved::NotFound));
    }

    #[test]
    fn test_content_hints() {
        assert_eq!(content_type_for(&key("/site/style.css")), Some("text/css"));
        assert_eq!(content_type_for(&key("/site/app.js")), Some("text/javascript"));
        assert_eq!(content_type_for(&key("/site/APP.JS")), None);
        assert_eq!(content_type_for(&key("/live/manifest.mpd")), None);

        assert_eq!(hints_for(&key("/live/init.mp4")).cache_control, Some("max-age=3600"));
        assert_eq!(hints_for(&key("/live/SEG1.M4S")), ContentHints::default());
        assert_eq!(hints_for(&key("/live/manifest.mpd")), ContentHints::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_file_stream_is_throttled() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("big.mp4"), vec![7u8; 64 * 1024]).unwrap();
        let file = File::open(dir.path().join("big.mp4")).await.unwrap();

        let start = tokio::time::Instant::now();
        let bucket = TokenBucket::new(16 * 1024, 16 * 1024);
        let total: usize = paced_file_stream(file, 8 * 1024, bucket)
            .map(|c| c.unwrap().len())
            .fold(0, |acc, n| async move { acc + n })
            .await;

        assert_eq!(total, 64 * 1024);
        // (64 KiB - 16 KiB burst) / 16 KiB/s
        assert!(start.elapsed() >= std::time::Duration::from_secs(3));
    }
}
