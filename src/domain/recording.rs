//! Recording identity and content fingerprint.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Stable key for a recording, derived from its absolute path (12 hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingId(String);

impl RecordingId {
    /// Derive the identity from a source path
    pub fn from_path(path: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..6]))
    }

    /// Wrap an identity read back from storage or typed by a user
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` characters, for log lines and file names
    pub fn short(&self, n: usize) -> &str {
        &self.0[..n.min(self.0.len())]
    }
}

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content fingerprint used to detect that a recording changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA256 of the content (first 16 hex chars)
    pub content_hash: String,

    /// File size in bytes
    pub size: u64,

    /// Modification time, milliseconds since the Unix epoch
    pub modified_ms: i64,
}

impl Fingerprint {
    /// Hash the file at `path` and combine with its metadata
    pub async fn compute(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let digest = hasher.finalize();
        Ok(Self {
            content_hash: hex::encode(&digest[..8]),
            size: metadata.len(),
            modified_ms: modified_ms(&metadata),
        })
    }

    /// Same content: hash and size agree. Touching a file does not count as a change.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.content_hash == other.content_hash && self.size == other.size
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}b", self.content_hash, self.size)
    }
}

/// Milliseconds since the epoch of a file's mtime (0 when unavailable)
pub fn modified_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One source audio file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,

    /// Absolute source location
    pub path: PathBuf,

    pub fingerprint: Fingerprint,

    /// When the file was first seen
    pub discovered_at: DateTime<Utc>,
}

impl Recording {
    pub fn new(path: PathBuf, fingerprint: Fingerprint, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id: RecordingId::from_path(&path),
            path,
            fingerprint,
            discovered_at,
        }
    }

    /// File name only
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_stable_per_path() {
        let a = RecordingId::from_path(Path::new("/rec/Monday at 10-00.m4a"));
        let b = RecordingId::from_path(Path::new("/rec/Monday at 10-00.m4a"));
        let c = RecordingId::from_path(Path::new("/rec/Tuesday at 10-00.m4a"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 12);
        assert_eq!(a.short(6).len(), 6);
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("memo.m4a");

        tokio::fs::write(&path, b"first take").await.unwrap();
        let first = Fingerprint::compute(&path).await.unwrap();
        let again = Fingerprint::compute(&path).await.unwrap();
        assert!(first.same_content(&again));
        assert_eq!(first.size, 10);
        assert_eq!(first.content_hash.len(), 16);

        tokio::fs::write(&path, b"second take").await.unwrap();
        let second = Fingerprint::compute(&path).await.unwrap();
        assert!(!first.same_content(&second));
    }

    #[test]
    fn test_mtime_only_change_is_same_content() {
        let a = Fingerprint {
            content_hash: "abcd".to_string(),
            size: 4,
            modified_ms: 1,
        };
        let b = Fingerprint {
            modified_ms: 2,
            ..a.clone()
        };
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }
}
