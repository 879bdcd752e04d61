// src/notifier.rs
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{header, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::error;

use crate::config::{AppConfig, SmtpSettings};
use crate::reconciliation::Student;
use crate::run_log::RunLog;

//=============================================================================
// Error types
//=============================================================================

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Failed to send notification: {0}")]
    SendError(String),
    #[error("Invalid notification target: {0}")]
    InvalidTarget(String),
    #[error("Failed to build email: {0}")]
    BuildError(String),
}

//=============================================================================
// Templates
//=============================================================================

#[derive(Debug, Clone)]
pub struct NoticeTemplates {
    pub from_name: String,
    pub from_email: String,
    pub form_link: String,
    pub dropbox_link: String,
    pub signature: String,
}

impl NoticeTemplates {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            from_name: config.from_name.clone(),
            from_email: config.from_email.clone(),
            form_link: config.form_link.clone(),
            dropbox_link: config.dropbox_link.clone(),
            signature: config.signature.clone(),
        }
    }
}

/// A fully rendered message. Debug mode and live delivery both start from
/// this value, so what is logged is what would have been sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub from_name: String,
    pub from_email: String,
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

impl RenderedEmail {
    pub fn to_log_text(&self) -> String {
        format!(
            "From: {} <{}>\nTo: {}\nSubject: {}\n\n{}\n\n[text/html]\n{}",
            self.from_name, self.from_email, self.to, self.subject, self.text_body, self.html_body
        )
    }

    fn addressed_to(&self, to: &str) -> RenderedEmail {
        RenderedEmail {
            to: to.to_string(),
            ..self.clone()
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn link_html(url: &str) -> String {
    let url = escape_html(url);
    format!("<a href=\"{}\">{}</a>", url, url)
}

pub fn render_absence_notice(templates: &NoticeTemplates, student: &Student, session_date: &str) -> RenderedEmail {
    let subject = format!("We missed you at the {} class", session_date);
    let text_body = format!(
        "Hi {name},\n\nWe missed you at the {date} class.\n\n\
         The class materials are here:\n{materials}\n\n\
         Please send a short summary of the class before the upcoming class so that you could attend it normally:\n{form}\n\n\n\
         Love,\n{signature}",
        name = student.name,
        date = session_date,
        materials = templates.dropbox_link,
        form = templates.form_link,
        signature = templates.signature,
    );
    let html_body = format!(
        "<p>Hi {name},</p><p>We missed you at the {date} class.</p>\
         <p>The class materials are here: {materials}</p>\
         <p>Please send a short summary of the class before the upcoming class so that you could attend it normally: {form}</p>\
         <p>Love,<br>{signature}</p>",
        name = escape_html(&student.name),
        date = escape_html(session_date),
        materials = link_html(&templates.dropbox_link),
        form = link_html(&templates.form_link),
        signature = escape_html(&templates.signature),
    );
    RenderedEmail {
        from_name: templates.from_name.clone(),
        from_email: templates.from_email.clone(),
        to: student.email.clone(),
        subject,
        text_body,
        html_body,
    }
}

pub fn render_overdue_notice(templates: &NoticeTemplates, student: &Student, session_date: &str) -> RenderedEmail {
    let subject = format!("A reminder for sending a summary for the {} class", session_date);
    let text_body = format!(
        "Hey {name} :-)\nWe would like to kindly remind you to send a class summary before the upcoming class so \
         that you could attend it normally.\n\n{form}\n\n\nLove,\n{signature}",
        name = student.name,
        form = templates.form_link,
        signature = templates.signature,
    );
    let html_body = format!(
        "<p>Hey {name} :-)</p><p>We would like to kindly remind you to send a class summary before the upcoming \
         class so that you could attend it normally.</p><p>{form}</p><p>Love,<br>{signature}</p>",
        name = escape_html(&student.name),
        form = link_html(&templates.form_link),
        signature = escape_html(&templates.signature),
    );
    RenderedEmail {
        from_name: templates.from_name.clone(),
        from_email: templates.from_email.clone(),
        to: student.email.clone(),
        subject,
        text_body,
        html_body,
    }
}

//=============================================================================
// Delivery outcomes
//=============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    /// Debug mode: rendered and written to the run log instead of sent.
    Logged,
    Failed(String),
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, DeliveryStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeOutcome {
    pub student: Student,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdminDelivery {
    pub attempted: usize,
    pub delivered: usize,
}

//=============================================================================
// Admin report
//=============================================================================

#[derive(Debug, Clone, Default)]
pub struct AdminReportContent {
    pub debug: bool,
    pub latest_session: Option<String>,
    pub prior_session: Option<String>,
    pub skipped_reason: Option<String>,
    pub absence_notices: Vec<NoticeOutcome>,
    pub overdue_students: Vec<Student>,
    pub overdue_notices: Vec<NoticeOutcome>,
    pub run_log: String,
}

fn count_status(outcomes: &[NoticeOutcome]) -> (usize, usize) {
    let delivered = outcomes.iter().filter(|o| o.status.is_delivered()).count();
    (delivered, outcomes.len() - delivered)
}

fn write_outcomes(output: &mut String, outcomes: &[NoticeOutcome]) {
    if outcomes.is_empty() {
        let _ = writeln!(output, "(none)");
        return;
    }
    for outcome in outcomes {
        let status = match &outcome.status {
            DeliveryStatus::Sent => "sent".to_string(),
            DeliveryStatus::Logged => "logged (debug mode)".to_string(),
            DeliveryStatus::Failed(reason) => format!("FAILED: {}", reason),
        };
        let _ = writeln!(output, "- {}: {}", outcome.student, status);
    }
}

pub fn render_admin_report(templates: &NoticeTemplates, content: &AdminReportContent) -> RenderedEmail {
    let subject = match &content.latest_session {
        Some(date) => format!("Attendance run report for the {} class", date),
        None => "Attendance run report".to_string(),
    };

    let mut output = String::new();
    let _ = writeln!(output, "Attendance notifier run report");
    let _ = writeln!(output, "Mode: {}", if content.debug { "debug (nothing sent)" } else { "live" });
    let _ = writeln!(
        output,
        "Latest session: {}",
        content.latest_session.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(
        output,
        "Prior session: {}",
        content.prior_session.as_deref().unwrap_or("none")
    );
    if let Some(reason) = &content.skipped_reason {
        let _ = writeln!(output, "Notices skipped: {}", reason);
    }

    let (absence_ok, absence_failed) = count_status(&content.absence_notices);
    let (overdue_ok, overdue_failed) = count_status(&content.overdue_notices);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Totals");
    let _ = writeln!(
        output,
        "- Absence notices: {} absentees, {} delivered, {} failed",
        content.absence_notices.len(),
        absence_ok,
        absence_failed
    );
    let _ = writeln!(
        output,
        "- Overdue summaries: {} pending, {} reminders delivered, {} failed",
        content.overdue_students.len(),
        overdue_ok,
        overdue_failed
    );

    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "## Absentees for {}",
        content.latest_session.as_deref().unwrap_or("unknown")
    );
    write_outcomes(&mut output, &content.absence_notices);

    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "## Overdue summaries for {}",
        content.prior_session.as_deref().unwrap_or("none")
    );
    if content.overdue_students.is_empty() {
        let _ = writeln!(output, "(none)");
    }
    for student in &content.overdue_students {
        let status = content
            .overdue_notices
            .iter()
            .find(|o| o.student.email == student.email)
            .map(|o| match &o.status {
                DeliveryStatus::Sent => "reminder sent".to_string(),
                DeliveryStatus::Logged => "reminder logged (debug mode)".to_string(),
                DeliveryStatus::Failed(reason) => format!("reminder FAILED: {}", reason),
            })
            .unwrap_or_else(|| "no reminder sent".to_string());
        let _ = writeln!(output, "- {}: {}", student, status);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Run log");
    let _ = write!(output, "{}", content.run_log);

    let html_body = format!(
        "<h2>{}</h2><pre>{}</pre>",
        escape_html(&subject),
        escape_html(&output)
    );

    RenderedEmail {
        from_name: templates.from_name.clone(),
        from_email: templates.from_email.clone(),
        to: String::new(),
        subject,
        text_body: output,
        html_body,
    }
}

//=============================================================================
// Transport
//=============================================================================

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &RenderedEmail) -> Result<(), NotificationError>;
}

pub fn build_message(email: &RenderedEmail) -> Result<Message, NotificationError> {
    let from_address: Address = email.from_email.parse().map_err(|e| {
        NotificationError::InvalidTarget(format!("Invalid from address {}: {}", email.from_email, e))
    })?;
    let to: Mailbox = email.to.parse().map_err(|e| {
        NotificationError::InvalidTarget(format!("Invalid email address {}: {}", email.to, e))
    })?;

    Message::builder()
        .from(Mailbox::new(Some(email.from_name.clone()), from_address))
        .to(to)
        .subject(email.subject.clone())
        .multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(header::ContentType::TEXT_PLAIN)
                        .body(email.text_body.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(header::ContentType::TEXT_HTML)
                        .body(email.html_body.clone()),
                ),
        )
        .map_err(|e| NotificationError::BuildError(e.to_string()))
}

/// SMTP delivery with STARTTLS. Each call opens its own session and the
/// transport is dropped, closing the connection, before `send` returns.
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotificationError> {
        let creds = Credentials::new(self.settings.username.clone(), self.settings.password.clone());

        let tls_parameters = TlsParameters::new(self.settings.server.clone())
            .map_err(|e| NotificationError::SendError(format!("TLS error: {}", e)))?;

        Ok(AsyncSmtpTransport::<Tokio1Executor>::relay(&self.settings.server)
            .map_err(|e| NotificationError::SendError(format!("SMTP relay error: {}", e)))?
            .port(self.settings.port)
            .credentials(creds)
            .tls(Tls::Required(tls_parameters))
            .build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, email: &RenderedEmail) -> Result<(), NotificationError> {
        let message = build_message(email)?;
        let transport = self.transport()?;
        transport
            .send(message)
            .await
            .map_err(|e| NotificationError::SendError(format!("Failed to send email: {}", e)))?;
        Ok(())
    }
}

//=============================================================================
// Notifier
//=============================================================================

pub enum DeliveryMode {
    Live(Arc<dyn MailTransport>),
    Debug,
}

pub struct Notifier {
    templates: NoticeTemplates,
    mode: DeliveryMode,
}

impl Notifier {
    pub fn new(templates: NoticeTemplates, mode: DeliveryMode) -> Self {
        Self { templates, mode }
    }

    pub fn is_debug(&self) -> bool {
        matches!(self.mode, DeliveryMode::Debug)
    }

    /// Hands one rendered message to the sink. Never fails the caller; the
    /// outcome is returned and logged.
    pub async fn deliver(&self, email: &RenderedEmail, log: &mut RunLog) -> DeliveryStatus {
        match &self.mode {
            DeliveryMode::Debug => {
                log.info(format!("[debug] Not sending email:\n{}", email.to_log_text()));
                DeliveryStatus::Logged
            }
            DeliveryMode::Live(transport) => match transport.send(email).await {
                Ok(()) => {
                    log.info(format!("Email '{}' sent to {}", email.subject, email.to));
                    DeliveryStatus::Sent
                }
                Err(e) => {
                    log.error(format!("Error sending email to {}: {}", email.to, e));
                    DeliveryStatus::Failed(e.to_string())
                }
            },
        }
    }

    pub async fn send_absence_notices(
        &self,
        students: &[Student],
        session_date: &str,
        log: &mut RunLog,
    ) -> Vec<NoticeOutcome> {
        let mut outcomes = Vec::with_capacity(students.len());
        for student in students {
            let email = render_absence_notice(&self.templates, student, session_date);
            let status = self.deliver(&email, log).await;
            outcomes.push(NoticeOutcome {
                student: student.clone(),
                status,
            });
        }
        outcomes
    }

    pub async fn send_overdue_notices(
        &self,
        students: &[Student],
        session_date: &str,
        log: &mut RunLog,
    ) -> Vec<NoticeOutcome> {
        let mut outcomes = Vec::with_capacity(students.len());
        for student in students {
            let email = render_overdue_notice(&self.templates, student, session_date);
            let status = self.deliver(&email, log).await;
            outcomes.push(NoticeOutcome {
                student: student.clone(),
                status,
            });
        }
        outcomes
    }

    /// Sends the report to every admin. If nobody received it the report is
    /// dumped to the console log instead.
    pub async fn send_admin_report(
        &self,
        admins: &[String],
        content: &AdminReportContent,
        log: &mut RunLog,
    ) -> AdminDelivery {
        let report = render_admin_report(&self.templates, content);
        let mut tally = AdminDelivery {
            attempted: admins.len(),
            delivered: 0,
        };

        for admin in admins {
            if self.deliver(&report.addressed_to(admin), log).await.is_delivered() {
                tally.delivered += 1;
            }
        }

        if self.is_debug() {
            log.info(format!(
                "Admin report logged for {} out of {} administrators (debug mode)",
                tally.delivered, tally.attempted
            ));
        } else {
            log.info(format!(
                "Admin report sent to {} out of {} administrators",
                tally.delivered, tally.attempted
            ));
        }

        if tally.delivered == 0 {
            error!(
                "Admin report could not be delivered; printing it here instead:\n{}",
                report.to_log_text()
            );
        }
        tally
    }
}
