//! Checksums for finalized tables and fingerprints for row deduplication

use crate::error::{HdxError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Separator between fingerprint fields; never appears in normalized values
const FIELD_SEPARATOR: u8 = 0x1f;

/// Compute the SHA-256 checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hashing = HashingReader::new(reader);
    std::io::copy(&mut hashing, &mut std::io::sink())?;
    Ok(hashing.finish())
}

/// Reader that hashes every byte passing through it.
///
/// Lets a caller parse a file and checksum it in the same pass.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Hex SHA-256 of everything read so far
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Verify the SHA-256 checksum of a file
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = compute_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(HdxError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Stable 128-bit identity of a normalized row.
///
/// Two rows with equal fingerprints are treated as exact duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Fingerprint an ordered list of normalized field values
    pub fn of<S: AsRef<str>>(fields: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_ref().as_bytes());
            hasher.update([FIELD_SEPARATOR]);
        }
        let digest = hasher.finalize();

        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);
        Self(u128::from_be_bytes(head))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
