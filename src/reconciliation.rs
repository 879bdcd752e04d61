// src/reconciliation.rs
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::sheets::{SheetError, SheetSource, SheetTable};

// --- Worksheet layout (1-based columns, row 1 is a header) ---

pub const ATTENDANCE_DATE_COLUMN: usize = 2;
pub const ATTENDANCE_PRESENT_COLUMN: usize = 3;
pub const ATTENDANCE_EMAIL_COLUMN: usize = 7;
pub const ATTENDANCE_NAME_COLUMN: usize = 8;
pub const SUMMARY_EMAIL_COLUMN: usize = 4;
pub const SUMMARY_DATE_COLUMN: usize = 6;

pub const UNKNOWN_STUDENT: &str = "Unknown";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Spreadsheet error: {0}")]
    Sheet(#[from] SheetError),
    #[error("Worksheet '{0}' has no session dates")]
    NoSessions(String),
}

#[derive(Debug, Clone)]
pub struct SheetLayout {
    pub attendance_sheet: String,
    pub summary_sheet: String,
}

/// Case-insensitive set of student emails, iterated in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet(BTreeSet<String>);

impl RecipientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, email: &str) -> bool {
        let key = normalize_email(email);
        if key.is_empty() {
            return false;
        }
        self.0.insert(key)
    }

    #[cfg(test)]
    pub fn contains(&self, email: &str) -> bool {
        self.0.contains(&normalize_email(email))
    }

    pub fn difference(&self, other: &RecipientSet) -> RecipientSet {
        RecipientSet(self.0.difference(&other.0).cloned().collect())
    }

    #[cfg(test)]
    pub fn union(&self, other: &RecipientSet) -> RecipientSet {
        RecipientSet(self.0.union(&other.0).cloned().collect())
    }

    #[cfg(test)]
    pub fn is_subset(&self, other: &RecipientSet) -> bool {
        self.0.is_subset(&other.0)
    }

    #[cfg(test)]
    pub fn is_disjoint(&self, other: &RecipientSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

impl<'a> FromIterator<&'a str> for RecipientSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut set = RecipientSet::new();
        for email in iter {
            set.insert(email);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Student {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLabels {
    pub latest: String,
    pub prior: Option<String>,
}

/// Result of a reconciliation pass. `unresolved` lists roster names that
/// have no email next to them and were therefore left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub recipients: RecipientSet,
    pub unresolved: Vec<String>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

struct RosterEntry {
    display_name: String,
    email: String,
}

// Roster rows keyed by normalized name; the first row for a name wins.
fn roster(attendance: &SheetTable) -> BTreeMap<String, RosterEntry> {
    let mut entries = BTreeMap::new();
    for row in attendance.data_rows() {
        let display_name = SheetTable::cell(row, ATTENDANCE_NAME_COLUMN).trim();
        let key = name_key(display_name);
        if key.is_empty() {
            continue;
        }
        entries.entry(key).or_insert_with(|| RosterEntry {
            display_name: display_name.to_string(),
            email: normalize_email(SheetTable::cell(row, ATTENDANCE_EMAIL_COLUMN)),
        });
    }
    entries
}

/// Names marked present for the session. The last row carrying the label wins.
pub fn present_names(attendance: &SheetTable, session: &str) -> Vec<String> {
    let session = session.trim();
    attendance
        .data_rows()
        .filter(|row| SheetTable::cell(row, ATTENDANCE_DATE_COLUMN).trim() == session)
        .last()
        .map(|row| {
            SheetTable::cell(row, ATTENDANCE_PRESENT_COLUMN)
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub fn session_labels_from(attendance: &SheetTable) -> Result<SessionLabels, ReconcileError> {
    let mut dates: Vec<String> = attendance
        .column_values(ATTENDANCE_DATE_COLUMN)
        .into_iter()
        .filter(|d| !d.is_empty())
        .collect();
    let latest = dates
        .pop()
        .ok_or_else(|| ReconcileError::NoSessions(attendance.name.clone()))?;
    Ok(SessionLabels {
        latest,
        prior: dates.pop(),
    })
}

/// Enrolled minus present minus the empty placeholder, mapped to emails.
pub fn absentees_from(attendance: &SheetTable, session: &str) -> Reconciled {
    let present: HashSet<String> = present_names(attendance, session)
        .iter()
        .map(|name| name_key(name))
        .collect();

    let mut reconciled = Reconciled::default();
    for (key, entry) in roster(attendance) {
        if present.contains(&key) {
            continue;
        }
        if entry.email.is_empty() {
            reconciled.unresolved.push(entry.display_name);
        } else {
            reconciled.recipients.insert(&entry.email);
        }
    }
    reconciled
}

/// Emails that filed a summary for exactly this date label.
pub fn submitters_from(summaries: &SheetTable, session: &str) -> RecipientSet {
    let session = session.trim();
    summaries
        .data_rows()
        .filter(|row| SheetTable::cell(row, SUMMARY_DATE_COLUMN).trim() == session)
        .map(|row| SheetTable::cell(row, SUMMARY_EMAIL_COLUMN))
        .collect()
}

pub fn overdue_from(absentees: &Reconciled, summaries: &SheetTable, session: &str) -> Reconciled {
    Reconciled {
        recipients: absentees
            .recipients
            .difference(&submitters_from(summaries, session)),
        unresolved: absentees.unresolved.clone(),
    }
}

pub fn students_from(attendance: &SheetTable, recipients: &RecipientSet) -> Vec<Student> {
    recipients
        .iter()
        .map(|email| {
            let name = attendance
                .data_rows()
                .find(|row| normalize_email(SheetTable::cell(row, ATTENDANCE_EMAIL_COLUMN)) == email)
                .map(|row| SheetTable::cell(row, ATTENDANCE_NAME_COLUMN).trim())
                .filter(|name| !name.is_empty())
                .unwrap_or(UNKNOWN_STUDENT);
            Student {
                name: name.to_string(),
                email: email.to_string(),
            }
        })
        .collect()
}

/// Reads the worksheets fresh on every call; nothing is cached between calls.
pub struct ReconciliationEngine {
    source: Arc<dyn SheetSource>,
    layout: SheetLayout,
}

impl ReconciliationEngine {
    pub fn new(source: Arc<dyn SheetSource>, layout: SheetLayout) -> Self {
        Self { source, layout }
    }

    async fn attendance(&self) -> Result<SheetTable, ReconcileError> {
        Ok(self.source.fetch_table(&self.layout.attendance_sheet).await?)
    }

    pub async fn session_labels(&self) -> Result<SessionLabels, ReconcileError> {
        session_labels_from(&self.attendance().await?)
    }

    pub async fn absentees(&self, session: &str) -> Result<Reconciled, ReconcileError> {
        let reconciled = absentees_from(&self.attendance().await?, session);
        debug!(
            "Session {}: {} absentees, {} unresolved",
            session,
            reconciled.recipients.len(),
            reconciled.unresolved.len()
        );
        Ok(reconciled)
    }

    pub async fn overdue_summaries(&self, session: &str) -> Result<Reconciled, ReconcileError> {
        let absentees = self.absentees(session).await?;
        let summaries = self.source.fetch_table(&self.layout.summary_sheet).await?;
        Ok(overdue_from(&absentees, &summaries, session))
    }

    pub async fn students(&self, recipients: &RecipientSet) -> Result<Vec<Student>, ReconcileError> {
        Ok(students_from(&self.attendance().await?, recipients))
    }
}
