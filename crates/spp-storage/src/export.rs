//! History snapshot files. Each export run gets one directory,
//! `<root>/<run stamp>/`, holding `<sha256>.<ext>` snapshots and the run manifest.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Csv,
    Parquet,
}

impl SnapshotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }

    /// Entry name in the run manifest.
    pub fn manifest_name(self) -> &'static str {
        match self {
            Self::Csv => "history_csv",
            Self::Parquet => "history_parquet",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub format: SnapshotFormat,
    pub sha256: String,
    /// Relative to the export root.
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The run directory already held a snapshot with these exact bytes.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_stamp(created_at: DateTime<Utc>) -> String {
        created_at.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn run_dir(&self, created_at: DateTime<Utc>) -> PathBuf {
        self.root.join(Self::run_stamp(created_at))
    }

    pub fn manifest_path(&self, created_at: DateTime<Utc>) -> PathBuf {
        self.run_dir(created_at).join(MANIFEST_FILE)
    }

    /// Snapshots are content addressed and never rewritten.
    pub async fn write_snapshot(
        &self,
        created_at: DateTime<Utc>,
        format: SnapshotFormat,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let sha256 = hex::encode(Sha256::digest(bytes));
        let relative_path =
            PathBuf::from(Self::run_stamp(created_at)).join(format!("{sha256}.{}", format.extension()));
        let absolute_path = self.root.join(&relative_path);
        let run_dir = self.run_dir(created_at);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating export run {}", run_dir.display()))?;

        let written = write_via_temp(&run_dir, &absolute_path, bytes, false).await?;
        Ok(StoredSnapshot {
            format,
            sha256,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            reused: !written,
        })
    }

    /// Replaces the run manifest; a repeated run lists its files again.
    pub async fn write_manifest(&self, created_at: DateTime<Utc>, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let run_dir = self.run_dir(created_at);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating export run {}", run_dir.display()))?;
        let path = self.manifest_path(created_at);
        write_via_temp(&run_dir, &path, bytes, true).await?;
        Ok(path)
    }
}

/// Writes a temp file in `dir` and renames it onto `target`, so readers never
/// see a half-written export. Returns false, writing nothing, when `target`
/// exists and `overwrite` is off.
async fn write_via_temp(dir: &Path, target: &Path, bytes: &[u8], overwrite: bool) -> anyhow::Result<bool> {
    if !overwrite
        && fs::try_exists(target)
            .await
            .with_context(|| format!("checking {}", target.display()))?
    {
        return Ok(false);
    }

    let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp, target).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(err).with_context(|| format!("writing {}", target.display()));
    }
    Ok(true)
}
