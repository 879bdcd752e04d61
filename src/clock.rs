// src/clock.rs
use chrono::{Local, NaiveDate, NaiveDateTime};

/// Source of "now" for a run. Date-window checks and run log timestamps both
/// read from here so tests can pin the calendar.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    current_time: NaiveDateTime,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(datetime_str: &str) -> Self {
        let current_time = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S")
            .expect("Failed to parse datetime string in FixedClock::new");
        Self { current_time }
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.current_time
    }
}
