//! File fingerprinting - SHA-256 over file name + content
//!
//! The name participates in identity: providers encode business metadata in
//! file names, so two files with the same bytes are still distinct arrivals.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// Hex-encoded SHA-256 digest (64 lowercase chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a file on disk. The content is streamed, so the file is read once.
pub fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {}", path.display()),
        )
    })?;

    // 原始字节，非 UTF-8 文件名也不能互相冲突
    let mut hasher = Sha256::new();
    hasher.update(name.as_encoded_bytes());

    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Fingerprint from an in-memory name and content
pub fn fingerprint_bytes(name: &str, content: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(content);
    Fingerprint(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_is_fixed_length_hex() {
        let fp = fingerprint_bytes("a.cdr", b"payload");
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn test_file_matches_in_memory_digest() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cdr_001.csv");
        fs::write(&path, b"1;2;3\n").unwrap();

        assert_eq!(fingerprint(&path).unwrap(), fingerprint_bytes("cdr_001.csv", b"1;2;3\n"));
    }

    #[test]
    fn test_directory_does_not_change_identity() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("same.cdr"), b"x").unwrap();
        fs::write(b.join("same.cdr"), b"x").unwrap();

        assert_eq!(
            fingerprint(&a.join("same.cdr")).unwrap(),
            fingerprint(&b.join("same.cdr")).unwrap()
        );
    }

    #[test]
    fn test_filename_sensitivity() {
        assert_ne!(fingerprint_bytes("a.cdr", b"same"), fingerprint_bytes("b.cdr", b"same"));
    }

    #[cfg(unix)]
    #[test]
    fn test_filename_sensitivity_non_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempdir().unwrap();
        let a = temp.path().join(OsStr::from_bytes(b"cdr_\xff.csv"));
        let b = temp.path().join(OsStr::from_bytes(b"cdr_\xfe.csv"));
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();

        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_content_sensitivity() {
        assert_ne!(fingerprint_bytes("a.cdr", b"v1"), fingerprint_bytes("a.cdr", b"v2"));
    }

    #[test]
    fn test_large_file_spans_chunks() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("big.cdr");
        let content = vec![7u8; READ_CHUNK * 2 + 13];
        fs::write(&path, &content).unwrap();

        assert_eq!(fingerprint(&path).unwrap(), fingerprint_bytes("big.cdr", &content));
    }

    #[test]
    fn test_vanished_file_is_io_error() {
        let temp = tempdir().unwrap();
        let err = fingerprint(&temp.path().join("gone.cdr")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
