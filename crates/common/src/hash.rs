//! SHA-1 content identity for graph vertices.
//!
//! A [`Hash`] is the 40-character lowercase hex rendering of a SHA-1
//! digest. Binaries are hashed by content; paths that cannot be read are
//! hashed by their string form instead, so unresolved imports still get a
//! stable identifier that a later scan can reconcile.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUFFER_SIZE: usize = 8192;

/// Rendered SHA-1 digest. Total order and equality follow the hex string.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(String);

impl Hash {
    /// Hashes the contents of `path`, falling back to the path string when
    /// the file cannot be opened. The fallback keeps placeholder vertices
    /// stable across scans.
    pub fn of_path(path: &Path) -> Self {
        match File::open(path) {
            Ok(file) => Self::of_reader(file).unwrap_or_else(|_| Self::of_str(&path.to_string_lossy())),
            Err(_) => Self::of_str(&path.to_string_lossy()),
        }
    }

    /// Hashes the bytes of `s`.
    pub fn of_str(s: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(s.as_bytes());
        Hash(hex::encode(hasher.finalize()))
    }

    fn of_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Hash(hex::encode(hasher.finalize())))
    }

    /// Wraps an already rendered digest string.
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Hash(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
