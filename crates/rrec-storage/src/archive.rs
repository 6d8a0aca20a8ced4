use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Where an applied spreadsheet export was archived.
#[derive(Debug, Clone)]
pub struct ArchivedExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes had already been archived by an earlier run.
    pub deduplicated: bool,
}

/// Keeps an immutable copy of every export that was applied to the store,
/// addressed by content hash and bucketed by import month.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        imported_at: DateTime<Utc>,
        content_hash: &str,
        source_name: &Path,
    ) -> PathBuf {
        let ext = source_name
            .extension()
            .and_then(|e| e.to_str())
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or("csv");
        PathBuf::from(imported_at.format("%Y-%m").to_string()).join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive(
        &self,
        imported_at: DateTime<Utc>,
        source_name: &Path,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedExport> {
        let content_hash = Self::content_hash(bytes);
        let relative_path = Self::relative_path_for(imported_at, &content_hash, source_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let archived = |deduplicated| ArchivedExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;
        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let staging = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::File::create(&staging)
            .await
            .with_context(|| format!("creating {}", staging.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", staging.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&staging, &absolute_path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err).with_context(|| {
                format!("moving {} into the archive", absolute_path.display())
            });
        }
        Ok(archived(false))
    }
}
