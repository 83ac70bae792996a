//! Weight file integrity checks

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Checks a file on disk against an expected digest.
pub trait FileVerifier: Send + Sync {
    /// `false` when the file is missing, unreadable, or does not match.
    fn verify(&self, path: &Path, expected_hash: &str) -> bool;
}

/// Streams the file through SHA-256 and compares lowercase hex digests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Verifier;

impl FileVerifier for Sha256Verifier {
    fn verify(&self, path: &Path, expected_hash: &str) -> bool {
        match sha256_file(path) {
            Ok(actual) => {
                let matches = actual == expected_hash.trim().to_lowercase();
                if !matches {
                    log::warn!(
                        "SHA256 mismatch for {}: expected {}, got {}",
                        path.display(),
                        expected_hash,
                        actual
                    );
                }
                matches
            }
            Err(e) => {
                log::debug!("Cannot hash {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
