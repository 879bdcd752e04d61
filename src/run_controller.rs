// src/run_controller.rs
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::date_validation::{check_session_date, SessionDateCheck};
use crate::notifier::{AdminDelivery, AdminReportContent, NoticeOutcome, Notifier};
use crate::reconciliation::{ReconcileError, Reconciled, ReconciliationEngine, SessionLabels, Student};
use crate::run_log::RunLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Loading,
    Validating,
    Reconciling,
    Notifying,
    ReportingAdmin,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whatever a run managed to compute. Filled in step by step so the admin
/// report can use partial results after a failure.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub state: RunState,
    pub sessions: Option<SessionLabels>,
    pub date_check: Option<SessionDateCheck>,
    pub absent_students: Vec<Student>,
    pub absence_notices: Vec<NoticeOutcome>,
    pub overdue_students: Vec<Student>,
    pub overdue_notices: Vec<NoticeOutcome>,
    pub skipped_reason: Option<String>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub progress: RunProgress,
    pub admin: AdminDelivery,
    pub log: Vec<String>,
}

impl RunReport {
    pub fn notices_delivered(&self) -> usize {
        self.progress
            .absence_notices
            .iter()
            .chain(self.progress.overdue_notices.iter())
            .filter(|o| o.status.is_delivered())
            .count()
    }
}

pub struct RunController {
    engine: ReconciliationEngine,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    admins: Vec<String>,
    send_overdue_notices: bool,
}

impl RunController {
    pub fn new(
        engine: ReconciliationEngine,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        admins: Vec<String>,
        send_overdue_notices: bool,
    ) -> Self {
        Self {
            engine,
            notifier,
            clock,
            admins,
            send_overdue_notices,
        }
    }

    /// One full run. Always ends in `Done` with an admin report attempt;
    /// failures only ever show up in the log and the returned report.
    /// Only errors returned as `Result` reach the report; a panic aborts the
    /// process in release builds (`panic = 'abort'`) and no report is sent.
    pub async fn run(&self) -> RunReport {
        let mut log = RunLog::new(self.clock.clone());
        let mut progress = RunProgress::default();
        log.info(format!(
            "Attendance run started at {} ({} mode)",
            self.clock.now().format("%Y-%m-%d %H:%M:%S"),
            if self.notifier.is_debug() { "debug" } else { "live" }
        ));

        if let Err(e) = self.execute(&mut progress, &mut log).await {
            log.error(format!("Run failed during {}: {}", progress.state, e));
            progress.failure = Some(e.to_string());
        }

        // Single reporting point for every way out of `execute`.
        transition(&mut progress, RunState::ReportingAdmin, &mut log);
        let admin = self.report_to_admins(&progress, &mut log).await;
        transition(&mut progress, RunState::Done, &mut log);

        RunReport {
            progress,
            admin,
            log: log.into_lines(),
        }
    }

    async fn execute(&self, progress: &mut RunProgress, log: &mut RunLog) -> Result<(), ReconcileError> {
        transition(progress, RunState::Loading, log);
        let sessions = self.engine.session_labels().await?;
        log.info(format!(
            "Latest session: {}, prior session: {}",
            sessions.latest,
            sessions.prior.as_deref().unwrap_or("none")
        ));
        progress.sessions = Some(sessions.clone());

        transition(progress, RunState::Validating, log);
        let check = check_session_date(&sessions.latest, self.clock.today());
        progress.date_check = Some(check.clone());
        if !check.is_valid() {
            let reason = check.to_string();
            log.warn(format!("Skipping notices: {}", reason));
            progress.skipped_reason = Some(reason);
            return Ok(());
        }
        log.info(check.to_string());

        transition(progress, RunState::Reconciling, log);
        let absentees = self.engine.absentees(&sessions.latest).await?;
        log_unresolved(&absentees, &sessions.latest, log);
        progress.absent_students = self.engine.students(&absentees.recipients).await?;
        log.info(format!(
            "{} absentees for the {} class",
            progress.absent_students.len(),
            sessions.latest
        ));

        if let Some(prior) = &sessions.prior {
            let overdue = self.engine.overdue_summaries(prior).await?;
            progress.overdue_students = self.engine.students(&overdue.recipients).await?;
            log.info(format!(
                "{} overdue summaries for the {} class",
                progress.overdue_students.len(),
                prior
            ));
        } else {
            log.info("No prior session; overdue summary check skipped");
        }

        transition(progress, RunState::Notifying, log);
        progress.absence_notices = self
            .notifier
            .send_absence_notices(&progress.absent_students, &sessions.latest, log)
            .await;

        match (&sessions.prior, self.send_overdue_notices) {
            (Some(prior), true) => {
                progress.overdue_notices = self
                    .notifier
                    .send_overdue_notices(&progress.overdue_students, prior, log)
                    .await;
            }
            _ if !progress.overdue_students.is_empty() => {
                log.info(format!(
                    "Overdue summary reminders are disabled; {} students listed in the report only",
                    progress.overdue_students.len()
                ));
            }
            _ => {}
        }
        Ok(())
    }

    async fn report_to_admins(&self, progress: &RunProgress, log: &mut RunLog) -> AdminDelivery {
        let skipped_reason = progress
            .skipped_reason
            .clone()
            .or_else(|| progress.failure.as_ref().map(|f| format!("run failed: {}", f)));
        let content = AdminReportContent {
            debug: self.notifier.is_debug(),
            latest_session: progress.sessions.as_ref().map(|s| s.latest.clone()),
            prior_session: progress.sessions.as_ref().and_then(|s| s.prior.clone()),
            skipped_reason,
            absence_notices: progress.absence_notices.clone(),
            overdue_students: progress.overdue_students.clone(),
            overdue_notices: progress.overdue_notices.clone(),
            run_log: log.to_text(),
        };
        self.notifier.send_admin_report(&self.admins, &content, log).await
    }
}

fn transition(progress: &mut RunProgress, next: RunState, log: &mut RunLog) {
    debug!("Run state {} -> {}", progress.state, next);
    log.info(format!("State: {}", next));
    progress.state = next;
}

// Roster names without an email cannot be notified; they are dropped but named.
fn log_unresolved(reconciled: &Reconciled, session: &str, log: &mut RunLog) {
    if !reconciled.unresolved.is_empty() {
        log.warn(format!(
            "Session {}: no email for {}; not notified",
            session,
            reconciled.unresolved.join(", ")
        ));
    }
}
