use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use spp_core::Row;
use tracing::debug;

use crate::{PartialAppend, StoreError, TabularStore};

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub sheet: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Spreadsheet tab accessed through the Google Sheets v4 `values` endpoints.
#[derive(Debug)]
pub struct SheetsStore {
    client: reqwest::Client,
    config: SheetsConfig,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// 1-based column index to A1 letters: 1 -> A, 27 -> AA.
pub fn column_letters(mut col: usize) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

fn cell_text(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

impl SheetsStore {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Url::parse(&config.base_url)
            .with_context(|| format!("parsing sheets base url {}", config.base_url))?;
        Ok(Self { client, config })
    }

    fn sheet_range(&self) -> String {
        format!("'{}'", self.config.sheet.replace('\'', "''"))
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, StoreError> {
        let target = format!("{range}{suffix}");
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| StoreError::Invalid(format!("bad sheets base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid("sheets base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend([
                "spreadsheets",
                self.config.spreadsheet_id.as_str(),
                "values",
                target.as_str(),
            ]);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<JsonValue>,
    ) -> Result<reqwest::Response, StoreError> {
        debug!(%method, %url, "sheets request");
        let mut request = self
            .client
            .request(method, url.clone())
            .bearer_auth(&self.config.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }

    async fn append_values(&self, rows: &[Row]) -> Result<(), StoreError> {
        let mut url = self.values_url(&self.sheet_range(), ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.send(Method::POST, url, Some(json!({ "values": rows })))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TabularStore for SheetsStore {
    fn backend(&self) -> &'static str {
        "sheets"
    }

    async fn read_all(&self) -> Result<Vec<Row>, StoreError> {
        let url = self.values_url(&self.sheet_range(), "")?;
        let range: ValueRange = self.send(Method::GET, url, None).await?.json().await?;
        Ok(range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn read_header(&self) -> Result<Option<Row>, StoreError> {
        let url = self.values_url(&format!("{}!1:1", self.sheet_range()), "")?;
        let range: ValueRange = self.send(Method::GET, url, None).await?.json().await?;
        Ok(range
            .values
            .into_iter()
            .next()
            .map(|row| row.into_iter().map(cell_text).collect()))
    }

    async fn append_row(&self, row: Row) -> Result<(), StoreError> {
        self.append_values(std::slice::from_ref(&row)).await
    }

    /// One request for the whole batch, so it either lands entirely or not at all.
    async fn append_rows(&self, rows: &[Row]) -> Result<(), PartialAppend> {
        if rows.is_empty() {
            return Ok(());
        }
        self.append_values(rows)
            .await
            .map_err(|source| PartialAppend {
                committed: 0,
                source,
            })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let url = self.values_url(&self.sheet_range(), ":clear")?;
        self.send(Method::POST, url, Some(json!({}))).await?;
        Ok(())
    }

    async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<(), StoreError> {
        if row == 0 || col == 0 {
            return Err(StoreError::Invalid(format!(
                "cell ({row}, {col}) is out of range; indices are 1-based"
            )));
        }
        let a1 = format!("{}!{}{}", self.sheet_range(), column_letters(col), row);
        let mut url = self.values_url(&a1, "")?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        self.send(
            Method::PUT,
            url,
            Some(json!({ "range": a1, "values": [[value]] })),
        )
        .await?;
        Ok(())
    }
}
