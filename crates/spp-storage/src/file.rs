use std::path::{Path, PathBuf};

use async_trait::async_trait;
use spp_core::Row;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{set_grid_cell, StoreError, TabularStore};

/// Grid persisted as a local CSV file. Every mutation rewrites the file through
/// a temp-file rename, and a mutex serializes all calls.
#[derive(Debug)]
pub struct CsvFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Row>, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path).await?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(rows)
    }

    async fn persist(&self, rows: &[Row]) -> Result<(), StoreError> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| StoreError::Io(err.into_error()))?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl TabularStore for CsvFileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn read_all(&self) -> Result<Vec<Row>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn append_row(&self, row: Row) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        rows.push(row);
        self.persist(&rows).await
    }

    async fn append_rows(&self, new_rows: &[Row]) -> Result<(), crate::PartialAppend> {
        let _guard = self.lock.lock().await;
        let wrap = |source| crate::PartialAppend {
            committed: 0,
            source,
        };
        let mut rows = self.load().await.map_err(wrap)?;
        rows.extend_from_slice(new_rows);
        self.persist(&rows).await.map_err(wrap)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.persist(&[]).await
    }

    async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        set_grid_cell(&mut rows, row, col, value)?;
        self.persist(&rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_grid() {
        let dir = tempdir().expect("tempdir");
        let store = CsvFileStore::new(dir.path().join("nested/store.csv"));
        assert!(store.read_all().await.unwrap().is_empty());
        assert_eq!(store.read_header().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rows_survive_reopen_with_quoting_intact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.csv");
        let store = CsvFileStore::new(&path);
        store.append_row(row(&["No", "Name", "Actual Performance"])).await.unwrap();
        store
            .append_rows(&[row(&["1", "Putri, S.", ""]), row(&["2", "Budi \"B\"", ""])])
            .await
            .unwrap();
        store.update_cell(3, 3, "4".into()).await.unwrap();

        let reopened = CsvFileStore::new(&path);
        let rows = reopened.read_all().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], row(&["1", "Putri, S.", ""]));
        assert_eq!(rows[2], row(&["2", "Budi \"B\"", "4"]));

        reopened.clear().await.unwrap();
        assert!(store.read_all().await.unwrap().is_empty());
    }
}
