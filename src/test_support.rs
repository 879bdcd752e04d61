// src/test_support.rs
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::notifier::{MailTransport, NotificationError, RenderedEmail};
use crate::sheets::{SheetError, SheetSource, SheetTable};

/// Records every message handed to it; addresses in `failing` are rejected.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<RenderedEmail>>>,
    failing: Arc<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(addresses: &[&str]) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(addresses.iter().map(|a| a.to_string()).collect()),
        }
    }

    pub fn sent(&self) -> Vec<RenderedEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent().into_iter().map(|e| e.to).collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &RenderedEmail) -> Result<(), NotificationError> {
        if self.failing.contains(&email.to) {
            return Err(NotificationError::SendError(format!(
                "relay rejected {}",
                email.to
            )));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Serves worksheets from memory and counts fetches per worksheet.
#[derive(Clone, Default)]
pub struct InMemorySheetSource {
    tables: Arc<Mutex<HashMap<String, SheetTable>>>,
    fetches: Arc<Mutex<HashMap<String, usize>>>,
    unreachable: bool,
}

impl InMemorySheetSource {
    pub fn new(tables: Vec<SheetTable>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(
                tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            )),
            fetches: Arc::new(Mutex::new(HashMap::new())),
            unreachable: false,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn fetch_count(&self, worksheet: &str) -> usize {
        self.fetches.lock().unwrap().get(worksheet).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SheetSource for InMemorySheetSource {
    async fn fetch_table(&self, worksheet: &str) -> Result<SheetTable, SheetError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(worksheet.to_string())
            .or_insert(0) += 1;
        if self.unreachable {
            return Err(SheetError::Api {
                worksheet: worksheet.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "spreadsheet unreachable".to_string(),
            });
        }
        self.tables
            .lock()
            .unwrap()
            .get(worksheet)
            .cloned()
            .ok_or_else(|| SheetError::MissingWorksheet(worksheet.to_string()))
    }
}

pub fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}
