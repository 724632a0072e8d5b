// src/hash.rs

//! Content hashing for stored images
//!
//! An image is identified by the first [`CONTENT_HASH_LEN`] hex characters of
//! the SHA-256 digest of its exact bytes. The first two characters are the
//! shard prefix used as a directory level under both the image root and the
//! mount point.
//!
//! Images can be many gigabytes, so hashing always streams.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Length of a content hash in hex characters
pub const CONTENT_HASH_LEN: usize = 24;

/// Length of the shard prefix
pub const SHARD_LEN: usize = 2;

/// Read buffer size used while streaming image bytes
const READ_BLOCK: usize = 64 * 1024;

/// Hash parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Hash string has the wrong length
    InvalidLength { expected: usize, got: usize },
    /// Hash string contains non-hex characters
    InvalidHex(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength { expected, got } => {
                write!(f, "invalid hash length: expected {}, got {}", expected, got)
            }
            Self::InvalidHex(s) => write!(f, "invalid hex in hash: {}", s),
        }
    }
}

impl std::error::Error for HashError {}

/// Truncated SHA-256 digest identifying one stored image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Validate and wrap a hex string
    pub fn new(value: impl Into<String>) -> Result<Self, HashError> {
        let value = value.into();
        if value.len() != CONTENT_HASH_LEN {
            return Err(HashError::InvalidLength {
                expected: CONTENT_HASH_LEN,
                got: value.len(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(value));
        }
        Ok(Self(value.to_lowercase()))
    }

    /// Get the hash as a hex string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard directory name
    #[inline]
    pub fn shard(&self) -> &str {
        &self.0[..SHARD_LEN]
    }

    /// Recover the hash from an image or manifest file name
    ///
    /// Accepts `<hash>_<suffix>.<ext>`, `<hash>.<ext>` and a bare `<hash>`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let candidate = name.get(..CONTENT_HASH_LEN)?;
        let rest = &name[CONTENT_HASH_LEN..];
        if !(rest.is_empty() || rest.starts_with('_') || rest.starts_with('.')) {
            return None;
        }
        Self::new(candidate).ok()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Incremental hasher producing a [`ContentHash`]
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and truncate to [`CONTENT_HASH_LEN`]
    pub fn finalize(self) -> ContentHash {
        let mut full = hex::encode(self.inner.finalize());
        full.truncate(CONTENT_HASH_LEN);
        ContentHash(full)
    }
}

/// Hash everything a reader yields
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; READ_BLOCK];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Hash an image file on disk
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let mut reader = BufReader::with_capacity(READ_BLOCK, File::open(path)?);
    hash_reader(&mut reader)
}

/// Hash an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}
