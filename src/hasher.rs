//! Content fingerprints for change detection.
//!
//! A fingerprint is the SHA-256 of the raw file bytes, rendered as lowercase
//! hex. It only has to detect changes between runs, so the digest is not a
//! security boundary; SHA-256 is used because it is already in the stack.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read size for streaming the file through the digest.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hex digest of a file's content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a digest previously produced by [`fingerprint`] (e.g. read back
    /// from the ledger).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint the content of `path`.
///
/// The file is read in [`CHUNK_SIZE`] chunks, so memory use is constant.
///
/// # Errors
/// Any I/O error (missing file, permission denied, read failure mid-hash) is
/// returned unchanged so callers can tell `NotFound` apart.
pub fn fingerprint(path: impl AsRef<Path>) -> io::Result<Fingerprint> {
    let mut file = File::open(path.as_ref())?;
    fingerprint_reader(&mut file)
}

/// Fingerprint an arbitrary byte stream.
///
/// # Errors
/// Returns the first read error of the stream.
pub fn fingerprint_reader<R: Read>(reader: &mut R) -> io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}
