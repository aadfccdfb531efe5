//! Size and checksum verification.
//!
//! Downloads are verified on their temporary file before promotion; a file that
//! fails is deleted (quarantined) and never reaches its final path. The same
//! checks run over installed files in [`repair_scan`].

pub mod repair;

pub use repair::{repair_scan, CorruptFile, RepairReport};

use crate::error::IntegrityError;
use crate::registry::{ChecksumAlgorithm, FileSpec};
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const HASH_BUFFER: usize = 1024 * 1024;

/// Hex digest of a file, computed on a blocking thread
pub async fn compute_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
        .await
        .map_err(io::Error::other)?
}

fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(path),
        ChecksumAlgorithm::Sha512 => digest_file::<Sha512>(path),
    }
}

fn digest_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buffer = vec![0_u8; HASH_BUFFER];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check size (when declared) and checksum (when declared)
pub async fn verify_file(path: &Path, spec: &FileSpec) -> Result<(), IntegrityError> {
    let actual = tokio::fs::metadata(path).await?.len();
    if spec.size > 0 && actual != spec.size {
        return Err(IntegrityError::SizeMismatch {
            expected: spec.size,
            actual,
        });
    }

    if let Some(checksum) = &spec.checksum {
        let digest = compute_checksum(path, checksum.algorithm).await?;
        if !digest.eq_ignore_ascii_case(&checksum.value) {
            return Err(IntegrityError::ChecksumMismatch {
                algorithm: checksum.algorithm,
                expected: checksum.value.clone(),
                actual: digest,
            });
        }
    }

    Ok(())
}

/// Verify a freshly downloaded temp file, deleting it on any failure
pub async fn verify_download(temp_path: &Path, spec: &FileSpec) -> Result<(), IntegrityError> {
    let result = verify_file(temp_path, spec).await;
    if let Err(err) = &result {
        tracing::warn!("Quarantining {}: {err}", temp_path.display());
        quarantine(temp_path).await;
    }
    result
}

async fn quarantine(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::error!("Failed to delete {}: {e}", path.display());
        }
    }
}

/// Temporary download path, next to the final target
#[must_use]
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}
