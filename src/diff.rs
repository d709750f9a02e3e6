//! Diff model and file content comparison.

use crate::binary_path::BinaryPath;
use crate::digest::{Digest, StreamingHasher};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Chunk size used by [`ContentHasher`] and the DiffKey content-hash rule.
pub const STREAM_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Filesystem entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    Device,
    Fifo,
    Socket,
}

impl NodeKind {
    /// ASCII spelling used in the DiffKey canonical encoding (§4.3.4).
    pub fn canonical_str(self) -> &'static str {
        match self {
            NodeKind::Regular => "reg",
            NodeKind::Directory => "dir",
            NodeKind::Symlink => "sym",
            NodeKind::Device => "dev",
            NodeKind::Fifo => "fifo",
            NodeKind::Socket => "sock",
        }
    }
}

/// Classification of a `Modified` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifiedKind {
    MetadataOnly,
    ContentChanged,
    TypeChanged,
    SymlinkTargetChanged,
}

impl ModifiedKind {
    /// ASCII spelling used in the DiffKey canonical encoding (§4.3.4).
    pub fn canonical_str(self) -> &'static str {
        match self {
            ModifiedKind::MetadataOnly => "meta",
            ModifiedKind::ContentChanged => "content",
            ModifiedKind::TypeChanged => "type",
            ModifiedKind::SymlinkTargetChanged => "symlink",
        }
    }
}

/// Shared attributes on `Added`/`Modified` records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeAttributes {
    pub permissions: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub link_target: Option<BinaryPath>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub xattrs: Option<BTreeMap<Vec<u8>, Vec<u8>>>,
    pub dev_major: Option<u32>,
    pub dev_minor: Option<u32>,
    pub nlink: Option<u32>,
}

/// One entry describing an addition, modification, or deletion between
/// two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diff {
    Added {
        path: BinaryPath,
        node: NodeKind,
        attrs: NodeAttributes,
    },
    Modified {
        path: BinaryPath,
        kind: ModifiedKind,
        node: NodeKind,
        attrs: NodeAttributes,
    },
    Deleted {
        path: BinaryPath,
    },
}

impl Diff {
    /// The path this record describes.
    pub fn path(&self) -> &BinaryPath {
        match self {
            Diff::Added { path, .. } => path,
            Diff::Modified { path, .. } => path,
            Diff::Deleted { path } => path,
        }
    }
}

/// Streaming SHA-256 hasher over a file's contents, 4 MiB chunks.
pub struct ContentHasher;

impl ContentHasher {
    /// Hash a file on disk.
    pub fn hash_file(path: &Path) -> Result<Digest> {
        let file = File::open(path)?;
        Self::hash_reader(file)
    }

    /// Hash any `Read` implementation, 4 MiB at a time.
    pub fn hash_reader<R: Read>(mut reader: R) -> Result<Digest> {
        let mut hasher = StreamingHasher::new();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}

/// Compares two optional file paths to classify content changes.
///
/// Callers are responsible for routing symlinks to metadata comparison
/// and never invoking this for sockets or devices — this differ only
/// implements the regular-file content comparison contract.
pub struct FileContentDiffer;

impl FileContentDiffer {
    /// Compare `left` (base) and `right` (target).
    ///
    /// If `attributes_only` is set the result is `MetadataOnly`
    /// immediately. If either side is absent the result is
    /// `ContentChanged`. Otherwise both files are stream-hashed and
    /// compared.
    pub fn compare(
        left: Option<&Path>,
        right: Option<&Path>,
        attributes_only: bool,
    ) -> Result<ModifiedKind> {
        if attributes_only {
            return Ok(ModifiedKind::MetadataOnly);
        }
        let (left, right) = match (left, right) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(ModifiedKind::ContentChanged),
        };
        let left_digest = ContentHasher::hash_file(left)?;
        let right_digest = ContentHasher::hash_file(right)?;
        if left_digest == right_digest {
            Ok(ModifiedKind::MetadataOnly)
        } else {
            Ok(ModifiedKind::ContentChanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn attributes_only_short_circuits() {
        let a = write_temp(b"a");
        let b = write_temp(b"b");
        let result = FileContentDiffer::compare(Some(a.path()), Some(b.path()), true).unwrap();
        assert_eq!(result, ModifiedKind::MetadataOnly);
    }

    #[test]
    fn either_side_absent_is_content_changed() {
        let a = write_temp(b"a");
        assert_eq!(
            FileContentDiffer::compare(Some(a.path()), None, false).unwrap(),
            ModifiedKind::ContentChanged
        );
        assert_eq!(
            FileContentDiffer::compare(None, Some(a.path()), false).unwrap(),
            ModifiedKind::ContentChanged
        );
    }

    #[test]
    fn identical_content_is_metadata_only() {
        let a = write_temp(b"same bytes");
        let b = write_temp(b"same bytes");
        assert_eq!(
            FileContentDiffer::compare(Some(a.path()), Some(b.path()), false).unwrap(),
            ModifiedKind::MetadataOnly
        );
    }

    #[test]
    fn differing_content_is_content_changed() {
        let a = write_temp(b"left");
        let b = write_temp(b"right");
        assert_eq!(
            FileContentDiffer::compare(Some(a.path()), Some(b.path()), false).unwrap(),
            ModifiedKind::ContentChanged
        );
    }

    #[test]
    fn content_hasher_matches_digest_of() {
        let f = write_temp(b"hash me");
        let via_file = ContentHasher::hash_file(f.path()).unwrap();
        let direct = Digest::of(b"hash me");
        assert_eq!(via_file, direct);
    }
}
