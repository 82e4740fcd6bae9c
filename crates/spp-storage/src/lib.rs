//! Tabular store access for SPP: backends, timeouts and read retries.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use spp_core::{Row, SppError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

mod export;
mod file;
mod postgres;
mod sheets;

pub use export::{ExportStore, SnapshotFormat, StoredSnapshot, MANIFEST_FILE};
pub use file::CsvFileStore;
pub use postgres::PgGridStore;
pub use sheets::{column_letters, SheetsConfig, SheetsStore};

pub const CRATE_NAME: &str = "spp-storage";

/// Sheets answers 429 when the per-minute quota is spent and 408 when it gave
/// up waiting on the request; both pass like an outage does.
fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    /// A later attempt at the same call may succeed: the store was slow,
    /// unreachable or throttling. Rejected requests and bad grids are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Io(_) => true,
            Self::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).is_ok_and(status_is_transient),
            Self::Database(err) => matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
            Self::Csv(_) | Self::Invalid(_) => false,
        }
    }

    pub fn into_spp(self, operation: &str) -> SppError {
        SppError::store(operation, self.is_transient(), self.to_string())
    }
}

/// A multi-row append that stopped early. Rows before `committed` are in the store.
#[derive(Debug, Error)]
#[error("append stopped after {committed} rows: {source}")]
pub struct PartialAppend {
    pub committed: usize,
    #[source]
    pub source: StoreError,
}

/// Row/column addressed grid with append-only writes plus clear and single-cell update.
/// Row and column indices are 1-based; the header is row 1.
#[async_trait]
pub trait TabularStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn read_all(&self) -> Result<Vec<Row>, StoreError>;

    async fn read_header(&self) -> Result<Option<Row>, StoreError> {
        Ok(self.read_all().await?.into_iter().next())
    }

    async fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.read_all().await?.len())
    }

    async fn append_row(&self, row: Row) -> Result<(), StoreError>;

    async fn append_rows(&self, rows: &[Row]) -> Result<(), PartialAppend> {
        for (committed, row) in rows.iter().enumerate() {
            self.append_row(row.clone())
                .await
                .map_err(|source| PartialAppend { committed, source })?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError>;

    async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<(), StoreError>;
}

/// In-process grid.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn rows(&self) -> Vec<Row> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl TabularStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn read_all(&self) -> Result<Vec<Row>, StoreError> {
        Ok(self.rows.lock().await.clone())
    }

    async fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.rows.lock().await.len())
    }

    async fn append_row(&self, row: Row) -> Result<(), StoreError> {
        self.rows.lock().await.push(row);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.rows.lock().await.clear();
        Ok(())
    }

    async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        set_grid_cell(&mut rows, row, col, value)
    }
}

/// Spreadsheet semantics: writing past the end of a row pads it with empty cells.
pub(crate) fn set_grid_cell(
    rows: &mut [Row],
    row: usize,
    col: usize,
    value: String,
) -> Result<(), StoreError> {
    if row == 0 || col == 0 {
        return Err(StoreError::Invalid(format!(
            "cell ({row}, {col}) is out of range; indices are 1-based"
        )));
    }
    let len = rows.len();
    let target = rows.get_mut(row - 1).ok_or_else(|| {
        StoreError::Invalid(format!("row {row} is out of range ({len} rows)"))
    })?;
    if target.len() < col {
        target.resize(col, String::new());
    }
    target[col - 1] = value;
    Ok(())
}

/// How many times a store read is repeated after a transient failure, and the
/// pause before each repeat.
#[derive(Debug, Clone, Copy)]
pub struct ReadRetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl ReadRetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// One pause per permitted retry, doubling from `first_delay` up to `ceiling`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let ceiling = self.ceiling;
        std::iter::successors(Some(self.first_delay.min(ceiling)), move |prev| {
            Some(prev.saturating_mul(2).min(ceiling))
        })
        .take(self.retries)
    }
}

/// Wraps a backend with a per-call timeout. Reads are repeated on transient
/// failures; mutations run exactly once, since a repeated append could land twice.
#[derive(Debug)]
pub struct ResilientStore<S> {
    inner: S,
    timeout: Duration,
    retry: ReadRetryPolicy,
}

impl<S: TabularStore> ResilientStore<S> {
    pub fn new(inner: S, timeout: Duration, retry: ReadRetryPolicy) -> Self {
        Self { inner, timeout, retry }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let span = info_span!("store_call", backend = self.inner.backend(), operation);
        match tokio::time::timeout(self.timeout, fut.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }

    async fn read_with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delays = self.retry.delays().enumerate();
        loop {
            let err = match self.timed(operation, call()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match delays.next() {
                Some((retry, delay)) if err.is_transient() => {
                    warn!(operation, retry = retry + 1, ?delay, error = %err, "store read failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<S: TabularStore> TabularStore for ResilientStore<S> {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn read_all(&self) -> Result<Vec<Row>, StoreError> {
        self.read_with_retry("read_all", || self.inner.read_all()).await
    }

    async fn read_header(&self) -> Result<Option<Row>, StoreError> {
        self.read_with_retry("read_header", || self.inner.read_header()).await
    }

    async fn row_count(&self) -> Result<usize, StoreError> {
        self.read_with_retry("row_count", || self.inner.row_count()).await
    }

    async fn append_row(&self, row: Row) -> Result<(), StoreError> {
        self.timed("append_row", self.inner.append_row(row)).await
    }

    async fn append_rows(&self, rows: &[Row]) -> Result<(), PartialAppend> {
        debug!(rows = rows.len(), "appending rows");
        match tokio::time::timeout(self.timeout, self.inner.append_rows(rows)).await {
            Ok(result) => result,
            // The inner call was cancelled mid-flight, so how much landed is unknown.
            Err(_) => Err(PartialAppend {
                committed: 0,
                source: StoreError::Timeout {
                    operation: "append_rows",
                    timeout: self.timeout,
                },
            }),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.timed("clear", self.inner.clear()).await
    }

    async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<(), StoreError> {
        self.timed("update_cell", self.inner.update_cell(row, col, value)).await
    }
}
