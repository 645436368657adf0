//! Content digests for installed-file verification.
//!
//! Manifest hashes are lowercase hex. The digest algorithm is picked from the
//! hash length: 32 hex characters is MD5, 64 is SHA-256.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{UpdateError, UpdateResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Md5,
    Sha256,
}

impl DigestKind {
    /// Infer the algorithm from a hex digest.
    pub fn from_hex(hex: &str) -> UpdateResult<Self> {
        match hex.trim().len() {
            32 => Ok(Self::Md5),
            64 => Ok(Self::Sha256),
            other => Err(UpdateError::InvalidEntry(format!(
                "unsupported digest length {} in '{}'",
                other, hex
            ))),
        }
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl Hasher {
    fn new(kind: DigestKind) -> Self {
        match kind {
            DigestKind::Md5 => Self::Md5(md5::Context::new()),
            DigestKind::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Sha256(hasher) => format!("{:x}", hasher.finalize()),
        }
    }
}

/// Calculate the hex digest of a file.
pub fn file_digest(path: &Path, kind: DigestKind) -> UpdateResult<String> {
    let mut file = File::open(path).map_err(|e| UpdateError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Hasher::new(kind);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| UpdateError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish())
}

/// Verify that a file matches an expected hex digest.
pub fn verify_digest(path: &Path, expected: &str) -> UpdateResult<()> {
    verify_digest_as(path, expected, &display_name(path))
}

/// Like [`verify_digest`], reporting a mismatch under `name` (useful when
/// `path` is a temporary file).
pub fn verify_digest_as(path: &Path, expected: &str, name: &str) -> UpdateResult<()> {
    let kind = DigestKind::from_hex(expected)?;
    let actual = file_digest(path, kind)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(UpdateError::ChecksumMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Whether the file at `path` already matches the manifest size and digest.
///
/// Any read problem counts as "does not match".
pub fn matches_manifest(path: &Path, expected_hash: &str, expected_size: u64) -> bool {
    let size_ok = path
        .metadata()
        .map(|m| m.is_file() && m.len() == expected_size)
        .unwrap_or(false);
    size_ok && verify_digest(path, expected_hash).is_ok()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn write_hello(temp: &TempDir) -> std::path::PathBuf {
        let file_path = temp.path().join("test.txt");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"hello world").unwrap();
        file_path
    }

    #[test]
    fn test_md5_digest() {
        let temp = TempDir::new().unwrap();
        let path = write_hello(&temp);
        assert_eq!(file_digest(&path, DigestKind::Md5).unwrap(), HELLO_MD5);
    }

    #[test]
    fn test_sha256_digest() {
        let temp = TempDir::new().unwrap();
        let path = write_hello(&temp);
        assert_eq!(file_digest(&path, DigestKind::Sha256).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_digest_kind_from_hex() {
        assert_eq!(DigestKind::from_hex(HELLO_MD5).unwrap(), DigestKind::Md5);
        assert_eq!(DigestKind::from_hex(HELLO_SHA256).unwrap(), DigestKind::Sha256);
        assert!(DigestKind::from_hex("abc").is_err());
    }

    #[test]
    fn test_verify_digest_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = write_hello(&temp);
        assert!(verify_digest(&path, &HELLO_MD5.to_uppercase()).is_ok());
    }

    #[test]
    fn test_verify_digest_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = write_hello(&temp);

        match verify_digest(&path, "00000000000000000000000000000000") {
            Err(UpdateError::ChecksumMismatch { name, actual, .. }) => {
                assert_eq!(name, "test.txt");
                assert_eq!(actual, HELLO_MD5);
            }
            other => panic!("Expected ChecksumMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_matches_manifest() {
        let temp = TempDir::new().unwrap();
        let path = write_hello(&temp);

        assert!(matches_manifest(&path, HELLO_MD5, 11));
        assert!(!matches_manifest(&path, HELLO_MD5, 12));
        assert!(!matches_manifest(&temp.path().join("missing"), HELLO_MD5, 11));
    }

    #[test]
    fn test_large_file_digest_is_stable() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("large.bin");
        std::fs::write(&file_path, vec![0xABu8; 100_000]).unwrap();

        let first = file_digest(&file_path, DigestKind::Md5).unwrap();
        let second = file_digest(&file_path, DigestKind::Md5).unwrap();
        assert_eq!(first, second);
    }
}
