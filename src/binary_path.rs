//! Byte-preserving filesystem path type.
//!
//! `BinaryPath` keeps raw path bytes verbatim, including non-UTF-8
//! byte sequences, and compares by unsigned-byte lexicographic order
//! rather than `str`/`OsStr` collation.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::{CStr, CString};
use std::path::Path;

const SEPARATOR: u8 = b'/';

/// An ordered sequence of raw path bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BinaryPath(Vec<u8>);

impl BinaryPath {
    /// Build from a UTF-8 string.
    pub fn from_utf8(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }

    /// Build from raw bytes, which may not be valid UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Build from a null-terminated C string, excluding the NUL.
    pub fn from_cstr(s: &CStr) -> Self {
        Self(s.to_bytes().to_vec())
    }

    /// Build from a host path representation. Uses raw OS bytes on
    /// unix; falls back to a lossless UTF-8 round-trip elsewhere.
    pub fn from_host_path(path: &Path) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            Self(path.as_os_str().as_bytes().to_vec())
        }
        #[cfg(not(unix))]
        {
            Self(path.to_string_lossy().into_owned().into_bytes())
        }
    }

    /// Raw bytes, verbatim.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `true` if the path has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a path component. Inserts `/` between the receiver and
    /// the component when the receiver is non-empty and does not
    /// already end in `/`; strips exactly one leading `/` from the
    /// component first.
    pub fn append(&self, component: &[u8]) -> Self {
        let component = component.strip_prefix(&[SEPARATOR][..]).unwrap_or(component);
        let mut out = self.0.clone();
        if !out.is_empty() && *out.last().unwrap() != SEPARATOR {
            out.push(SEPARATOR);
        }
        out.extend_from_slice(component);
        Self(out)
    }

    /// Everything before the last `/`. Returns `/` if the last
    /// separator is at byte 0; returns empty if there is no separator.
    pub fn deleting_last_path_component(&self) -> Self {
        match self.0.iter().rposition(|&b| b == SEPARATOR) {
            Some(0) => Self(vec![SEPARATOR]),
            Some(idx) => Self(self.0[..idx].to_vec()),
            None => Self(Vec::new()),
        }
    }

    /// Bytes after the last `/`, or the whole path if there is none.
    pub fn last_path_component(&self) -> &[u8] {
        match self.0.iter().rposition(|&b| b == SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Split on `/`, discarding empty segments.
    pub fn components(&self) -> Vec<&[u8]> {
        self.0
            .split(|&b| b == SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    /// Raw-byte prefix check.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Raw-byte suffix check.
    pub fn has_suffix(&self, suffix: &[u8]) -> bool {
        self.0.ends_with(suffix)
    }

    /// Bytes after `base + "/"`. `Some(&[])` if `self == base`; `None`
    /// if `self` is not `base` or a descendant of it.
    pub fn relative_path(&self, base: &BinaryPath) -> Option<&[u8]> {
        if self.0 == base.0 {
            return Some(&[]);
        }
        let mut prefix = base.0.clone();
        if prefix.last() != Some(&SEPARATOR) {
            prefix.push(SEPARATOR);
        }
        self.0.strip_prefix(prefix.as_slice())
    }

    /// Provide a null-terminated view of the path bytes.
    pub fn with_cstring<R>(&self, body: impl FnOnce(&CStr) -> R) -> Result<R> {
        let cstring = CString::new(self.0.clone())
            .map_err(|e| Error::EncodingFailed(format!("interior NUL in path: {e}")))?;
        Ok(body(cstring.as_c_str()))
    }
}

impl Ord for BinaryPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for BinaryPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for BinaryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "BinaryPath({s:?})"),
            Err(_) => write!(f, "BinaryPath(bytes: {:?})", self.0),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BinaryPathWire {
    Utf8(String),
    Binary { __binary__: Vec<u8> },
}

impl Serialize for BinaryPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(s) => BinaryPathWire::Utf8(s.to_string()).serialize(serializer),
            Err(_) => BinaryPathWire::Binary {
                __binary__: self.0.clone(),
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for BinaryPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match BinaryPathWire::deserialize(deserializer)? {
            BinaryPathWire::Utf8(s) => Ok(BinaryPath::from_utf8(&s)),
            BinaryPathWire::Binary { __binary__ } => Ok(BinaryPath::from_bytes(__binary__)),
        }
    }
}
