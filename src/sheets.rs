// src/sheets.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const GOOGLE_DOCS_BASE_URL: &str = "https://docs.google.com";
pub const GOOGLE_SHEETS_API_BASE_URL: &str = "https://sheets.googleapis.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("URL parsing failed: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Spreadsheet service returned {status} for worksheet '{worksheet}': {message}")]
    Api {
        worksheet: String,
        status: StatusCode,
        message: String,
    },
    #[error("Worksheet '{0}' not found")]
    MissingWorksheet(String),
    #[error("CSV parsing failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// One worksheet as ordered rows of string cells. Row 1 is the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetTable {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl SheetTable {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    /// Cell at a 1-based column, or "" when the row is short.
    pub fn cell(row: &[String], column: usize) -> &str {
        column
            .checked_sub(1)
            .and_then(|idx| row.get(idx))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn data_rows(&self) -> impl Iterator<Item = &Vec<String>> {
        self.rows.iter().skip(1)
    }

    /// Values of a 1-based column below the header, up to the last non-empty
    /// cell. Blank cells in between are kept as "".
    pub fn column_values(&self, column: usize) -> Vec<String> {
        let mut values: Vec<String> = self
            .data_rows()
            .map(|row| Self::cell(row, column).trim().to_string())
            .collect();
        while values.last().is_some_and(|v| v.is_empty()) {
            values.pop();
        }
        values
    }
}

#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn fetch_table(&self, worksheet: &str) -> Result<SheetTable, SheetError>;
}

#[derive(Debug, Clone)]
pub enum SheetAccess {
    /// Link-shared sheet, read through the public CSV export.
    CsvExport,
    /// Sheets v4 `values` endpoint with an API key.
    ApiKey(String),
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

pub struct GoogleSheetsClient {
    http: Client,
    spreadsheet_id: String,
    access: SheetAccess,
    docs_base_url: String,
    api_base_url: String,
}

impl GoogleSheetsClient {
    pub fn new(spreadsheet_id: impl Into<String>, access: SheetAccess) -> Result<Self, SheetError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            spreadsheet_id: spreadsheet_id.into(),
            access,
            docs_base_url: GOOGLE_DOCS_BASE_URL.to_string(),
            api_base_url: GOOGLE_SHEETS_API_BASE_URL.to_string(),
        })
    }

    /// Points both endpoints at another host.
    #[cfg(test)]
    pub fn with_base_urls(mut self, docs_base_url: &str, api_base_url: &str) -> Self {
        self.docs_base_url = docs_base_url.trim_end_matches('/').to_string();
        self.api_base_url = api_base_url.trim_end_matches('/').to_string();
        self
    }

    fn csv_export_url(&self, worksheet: &str) -> Result<Url, SheetError> {
        let base = format!(
            "{}/spreadsheets/d/{}/gviz/tq",
            self.docs_base_url, self.spreadsheet_id
        );
        Ok(Url::parse_with_params(
            &base,
            &[("tqx", "out:csv"), ("sheet", worksheet)],
        )?)
    }

    fn values_url(&self, worksheet: &str, api_key: &str) -> Result<Url, SheetError> {
        let mut url = Url::parse(&self.api_base_url)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", worksheet]);
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    async fn get_text(&self, url: Url, worksheet: &str) -> Result<String, SheetError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SheetError::MissingWorksheet(worksheet.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SheetError::Api {
                worksheet: worksheet.to_string(),
                status,
                message,
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl SheetSource for GoogleSheetsClient {
    async fn fetch_table(&self, worksheet: &str) -> Result<SheetTable, SheetError> {
        info!("Fetching worksheet '{}'", worksheet);
        let rows = match &self.access {
            SheetAccess::CsvExport => {
                let body = self.get_text(self.csv_export_url(worksheet)?, worksheet).await?;
                parse_csv_rows(&body)?
            }
            SheetAccess::ApiKey(key) => {
                let body = self
                    .get_text(self.values_url(worksheet, key)?, worksheet)
                    .await?;
                parse_value_range(&body)?
            }
        };
        debug!("Worksheet '{}' returned {} rows", worksheet, rows.len());
        Ok(SheetTable::new(worksheet, rows))
    }
}

pub fn parse_csv_rows(body: &str) -> Result<Vec<Vec<String>>, SheetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(String::from).collect());
    }
    Ok(rows)
}

pub fn parse_value_range(body: &str) -> Result<Vec<Vec<String>>, SheetError> {
    let range: ValueRange = serde_json::from_str(body)?;
    Ok(range
        .values
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| match cell {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect())
}
