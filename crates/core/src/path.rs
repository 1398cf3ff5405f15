use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Normalized key for a stored resource, derived from a request path.
///
/// The key never contains empty, `.` or `..` segments and has no leading
/// slash, so it always maps to a location inside the storage root. The empty
/// key is the root directory itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Build a key from the (still percent-encoded) path of a request URI.
    ///
    /// `..` segments are resolved lexically and clamp at the root, the same
    /// way a cleaned `root.join(path)` behaves:
    ///
    /// ```text
    /// "/live/seg1.m4s"        → "live/seg1.m4s"
    /// "/live//./seg1.m4s"     → "live/seg1.m4s"
    /// "/a/b/../c"             → "a/c"
    /// "/../../etc/passwd"     → "etc/passwd"
    /// "/"                     → ""
    /// ```
    pub fn from_uri_path(raw: &str) -> Result<Self> {
        let decoded = urlencoding::decode(raw)
            .map_err(|e| Error::InvalidPath(format!("'{}' is not valid UTF-8: {}", raw, e)))?;

        let mut segments: Vec<&str> = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s if s.contains('\\') || s.contains('\0') => {
                    return Err(Error::InvalidPath(format!(
                        "Illegal character in path segment '{}'",
                        s
                    )));
                }
                s => segments.push(s),
            }
        }

        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Location of the backing file below `root`
    pub fn to_file_path(&self, root: &Path) -> PathBuf {
        self.0
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
    }

    /// Extension of the last segment, if any. Case is preserved.
    pub fn extension(&self) -> Option<&str> {
        let name = self.0.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}
