//! Download and verify digits artifacts.

use std::path::{Path, PathBuf};

use llwatch_core::models::ArtifactDescriptor;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::api::{ComputeApi, ComputeService, FetchError};

/// Errors while saving an artifact locally.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("SHA-256 mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Reduce a server-supplied filename to a single safe path component.
pub fn local_filename(artifact: &ArtifactDescriptor) -> String {
    let name = Path::new(&artifact.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name.is_empty() || name.starts_with('.') {
        format!("{}.txt", artifact.job_id)
    } else {
        name.to_string()
    }
}

/// Stream the artifact into `dest_dir`, checking size and digest.
///
/// The body is written to a `.part` file first and renamed into place only
/// after both checks pass; on mismatch the partial file is removed.
pub async fn download_artifact(
    api: &ComputeApi,
    artifact: &ArtifactDescriptor,
    dest_dir: &Path,
) -> Result<PathBuf, DownloadError> {
    let url = api.download_url(&artifact.job_id);
    let final_path = dest_dir.join(local_filename(artifact));
    let part_path = final_path.with_extension("part");

    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|source| DownloadError::Io {
            path: dest_dir.to_path_buf(),
            source,
        })?;

    let response = api.http().get(&url).send().await.map_err(FetchError::from)?;
    let mut response = ComputeApi::ensure_success(&url, response).await?;

    let io_err = |source: std::io::Error| DownloadError::Io {
        path: part_path.clone(),
        source,
    };
    let mut file = tokio::fs::File::create(&part_path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;

    while let Some(chunk) = response.chunk().await.map_err(FetchError::from)? {
        hasher.update(&chunk);
        received += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;
    drop(file);

    let digest = format!("{:x}", hasher.finalize());
    let verdict = if received != artifact.size_bytes {
        Err(DownloadError::SizeMismatch {
            expected: artifact.size_bytes,
            actual: received,
        })
    } else if !digest.eq_ignore_ascii_case(&artifact.sha256) {
        Err(DownloadError::DigestMismatch {
            expected: artifact.sha256.clone(),
            actual: digest,
        })
    } else {
        Ok(())
    };

    if let Err(e) = verdict {
        tracing::warn!(job_id = %artifact.job_id, error = %e, "Discarding artifact download");
        let _ = tokio::fs::remove_file(&part_path).await;
        return Err(e);
    }

    tokio::fs::rename(&part_path, &final_path)
        .await
        .map_err(|source| DownloadError::Io {
            path: final_path.clone(),
            source,
        })?;

    tracing::info!(
        job_id = %artifact.job_id,
        path = %final_path.display(),
        size_bytes = received,
        "Artifact saved",
    );
    Ok(final_path)
}
