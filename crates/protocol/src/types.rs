use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 tree-hash digest.
///
/// Displays and serializes as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash([u8; DIGEST_LEN]);

impl TreeHash {
    /// Wraps a raw digest.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Returns the lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", self.to_hex())
    }
}

/// Error returned when parsing a [`TreeHash`] from text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseTreeHashError {
    #[error("tree hash must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("invalid hex in tree hash: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for TreeHash {
    type Err = ParseTreeHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(ParseTreeHashError::Length {
                expected: DIGEST_LEN * 2,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for TreeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TreeHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A contiguous byte range `[start, start + length)` of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Exclusive end offset.
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Renders the range as an HTTP `Content-Range` value with an unknown
    /// total, e.g. `bytes 0-1048575/*`.
    ///
    /// Returns `None` for an empty range, which has no inclusive form.
    pub fn content_range(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(format!("bytes {}-{}/*", self.start, self.end() - 1))
    }
}

/// Same text as [`ByteRange::content_range`]; empty ranges render as
/// `bytes <start>+0`.
impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.content_range() {
            Some(range) => f.write_str(&range),
            None => write!(f, "bytes {}+0", self.start),
        }
    }
}

/// Lifecycle state of an upload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` once the run has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}
