//! Content fingerprinting for duplicate detection.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Lowercase hex SHA-256 of the full file bytes. Used as the dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint by streaming the file in 8 KiB chunks, so large
/// scans never have to be materialized in memory a second time.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

/// Fingerprint of an in-memory buffer. Same digest as [`fingerprint_file`]
/// over the same bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_and_buffer_digests_agree() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"invoice bytes 123").unwrap();
        let from_file = fingerprint_file(f.path()).unwrap();
        let from_bytes = fingerprint_bytes(b"invoice bytes 123");
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn identical_bytes_identical_fingerprint() {
        assert_eq!(fingerprint_bytes(b"abc"), fingerprint_bytes(b"abc"));
        assert_ne!(fingerprint_bytes(b"abc"), fingerprint_bytes(b"abd"));
    }
}
