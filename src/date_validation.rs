// src/date_validation.rs
use chrono::{Duration, NaiveDate};
use std::fmt;
use tracing::debug;

// Order matters: the first format that parses wins, so "03/04/2024" is read
// as the 3rd of April.
pub const ACCEPTED_DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y", "%Y/%m/%d"];

/// How many days back a session may lie and still trigger notices.
pub const SESSION_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDateCheck {
    Valid(NaiveDate),
    Empty,
    Unparseable(String),
    OutsideWindow {
        date: NaiveDate,
        earliest: NaiveDate,
        today: NaiveDate,
    },
}

impl SessionDateCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SessionDateCheck::Valid(_))
    }
}

impl fmt::Display for SessionDateCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionDateCheck::Valid(date) => write!(f, "session date {} is within the last {} days", date, SESSION_WINDOW_DAYS),
            SessionDateCheck::Empty => write!(f, "session date is empty"),
            SessionDateCheck::Unparseable(label) => write!(
                f,
                "session date '{}' does not match any accepted format",
                label
            ),
            SessionDateCheck::OutsideWindow { date, earliest, today } => write!(
                f,
                "session date {} is outside the window {} to {}",
                date, earliest, today
            ),
        }
    }
}

pub fn parse_session_date(label: &str) -> Option<NaiveDate> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }
    ACCEPTED_DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(trimmed, format)
            .ok()
            .inspect(|_| debug!("Parsed session date '{}' with format {}", trimmed, format))
    })
}

/// Gate for a run: the label must parse and fall in `[today - 7 days, today]`.
pub fn check_session_date(label: &str, today: NaiveDate) -> SessionDateCheck {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return SessionDateCheck::Empty;
    }

    let Some(date) = parse_session_date(trimmed) else {
        return SessionDateCheck::Unparseable(trimmed.to_string());
    };

    let earliest = today - Duration::days(SESSION_WINDOW_DAYS);
    if date < earliest || date > today {
        return SessionDateCheck::OutsideWindow { date, earliest, today };
    }
    SessionDateCheck::Valid(date)
}
