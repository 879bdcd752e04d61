// src/run_controller_tests.rs

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::clock::FixedClock;
    use crate::notifier::{DeliveryMode, DeliveryStatus, NoticeTemplates, Notifier};
    use crate::reconciliation::{ReconciliationEngine, SheetLayout, Student};
    use crate::run_controller::{RunController, RunState};
    use crate::sheets::{SheetSource, SheetTable};
    use crate::test_support::{row, InMemorySheetSource, RecordingTransport};

    const ADMINS: [&str; 3] = ["admin1@example.com", "admin2@example.com", "admin3@example.com"];

    fn layout() -> SheetLayout {
        SheetLayout {
            attendance_sheet: "Attendance".to_string(),
            summary_sheet: "Summaries".to_string(),
        }
    }

    fn templates() -> NoticeTemplates {
        NoticeTemplates {
            from_name: "FP Kadampa TLV".to_string(),
            from_email: "class@example.com".to_string(),
            form_link: "https://forms.example.com/summary".to_string(),
            dropbox_link: "https://dropbox.example.com/materials".to_string(),
            signature: "Mikey".to_string(),
        }
    }

    // Two sessions over a roster of A, B and C: A attended both, B only the
    // latest. B filed a summary for the prior session.
    fn class_sheets(latest: &str, prior: &str) -> InMemorySheetSource {
        let attendance = SheetTable::new(
            "Attendance",
            vec![
                row(&["Timestamp", "Date", "Present", "", "", "", "Email", "Name"]),
                row(&["", prior, "Anna", "", "", "", "anna@example.com", "Anna"]),
                row(&["", latest, "anna, BEN", "", "", "", "Ben@Example.com", "Ben"]),
                row(&["", "", "", "", "", "", "cleo@example.com", "Cleo"]),
            ],
        );
        let summaries = SheetTable::new(
            "Summaries",
            vec![
                row(&["Timestamp", "Name", "Summary", "Email", "Notes", "Class date"]),
                row(&["", "Ben", "...", "ben@example.com", "", prior]),
            ],
        );
        InMemorySheetSource::new(vec![attendance, summaries])
    }

    fn controller(
        source: InMemorySheetSource,
        mode: DeliveryMode,
        now: &str,
        send_overdue_notices: bool,
    ) -> RunController {
        let source: Arc<dyn SheetSource> = Arc::new(source);
        RunController::new(
            ReconciliationEngine::new(source, layout()),
            Notifier::new(templates(), mode),
            Arc::new(FixedClock::new(now)),
            ADMINS.iter().map(|a| a.to_string()).collect(),
            send_overdue_notices,
        )
    }

    fn cleo() -> Student {
        Student {
            name: "Cleo".to_string(),
            email: "cleo@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_notifies_latest_absentees_and_reports() {
        let transport = RecordingTransport::failing_for(&["admin2@example.com"]);
        let run = controller(
            class_sheets("2024-01-15", "2024-01-08"),
            DeliveryMode::Live(Arc::new(transport.clone())),
            "2024-01-18 08:00:00",
            false,
        );

        let report = run.run().await;

        assert_eq!(report.progress.state, RunState::Done);
        assert_eq!(report.progress.absent_students, vec![cleo()]);
        assert_eq!(report.progress.overdue_students, vec![cleo()]);
        assert!(report.progress.overdue_notices.is_empty());
        assert_eq!(report.progress.absence_notices[0].status, DeliveryStatus::Sent);
        assert_eq!(report.notices_delivered(), 1);

        assert_eq!(
            transport.sent_to(),
            vec!["cleo@example.com", "admin1@example.com", "admin3@example.com"]
        );
        assert_eq!(report.admin.attempted, 3);
        assert_eq!(report.admin.delivered, 2);
        assert!(report
            .log
            .iter()
            .any(|l| l.contains("Admin report sent to 2 out of 3 administrators")));

        let admin_email = &transport.sent()[1];
        assert!(admin_email.text_body.contains("- Cleo <cleo@example.com>: sent"));
        assert!(admin_email.text_body.contains("- Cleo <cleo@example.com>: no reminder sent"));
        assert!(admin_email.text_body.contains("State: Notifying"));
    }

    #[tokio::test]
    async fn test_overdue_reminders_go_out_when_enabled() {
        let transport = RecordingTransport::new();
        let run = controller(
            class_sheets("2024-01-15", "2024-01-08"),
            DeliveryMode::Live(Arc::new(transport.clone())),
            "2024-01-18 08:00:00",
            true,
        );

        let report = run.run().await;

        assert_eq!(report.progress.overdue_notices.len(), 1);
        let sent = transport.sent();
        assert_eq!(sent[1].to, "cleo@example.com");
        assert_eq!(
            sent[1].subject,
            "A reminder for sending a summary for the 2024-01-08 class"
        );
        assert_eq!(report.admin.delivered, 3);
    }

    #[tokio::test]
    async fn test_stale_session_sends_only_the_admin_report() {
        let transport = RecordingTransport::new();
        let run = controller(
            class_sheets("2024-01-15", "2024-01-08"),
            DeliveryMode::Live(Arc::new(transport.clone())),
            "2024-01-25 08:00:00",
            false,
        );

        let report = run.run().await;

        assert_eq!(report.progress.state, RunState::Done);
        assert_eq!(report.notices_delivered(), 0);
        assert!(report.progress.absence_notices.is_empty());
        assert!(report.progress.overdue_students.is_empty());
        let reason = report.progress.skipped_reason.clone().unwrap();
        assert!(reason.contains("outside the window"));
        assert!(report.log.iter().any(|l| l.contains("Skipping notices")));
        assert_eq!(transport.sent_to(), ADMINS.to_vec());
        assert!(transport.sent()[0].text_body.contains("Notices skipped"));
    }

    #[tokio::test]
    async fn test_unreachable_spreadsheet_still_reports_to_admins() {
        let transport = RecordingTransport::new();
        let run = controller(
            InMemorySheetSource::unreachable(),
            DeliveryMode::Live(Arc::new(transport.clone())),
            "2024-01-18 08:00:00",
            false,
        );

        let report = run.run().await;

        assert_eq!(report.progress.state, RunState::Done);
        assert!(report.progress.sessions.is_none());
        assert!(report.progress.failure.is_some());
        assert!(report.log.iter().any(|l| l.contains("Run failed during Loading")));
        assert_eq!(report.admin.delivered, 3);
        assert!(transport.sent()[0].subject == "Attendance run report");
        assert!(transport.sent()[0].text_body.contains("run failed"));
    }

    #[tokio::test]
    async fn test_missing_summary_sheet_keeps_partial_results() {
        let attendance_only = {
            let full = class_sheets("2024-01-15", "2024-01-08");
            let table = full.fetch_table("Attendance").await.unwrap();
            InMemorySheetSource::new(vec![table])
        };
        let transport = RecordingTransport::new();
        let run = controller(
            attendance_only,
            DeliveryMode::Live(Arc::new(transport.clone())),
            "2024-01-18 08:00:00",
            false,
        );

        let report = run.run().await;

        assert_eq!(report.progress.absent_students, vec![cleo()]);
        assert!(report.progress.absence_notices.is_empty());
        assert!(report
            .log
            .iter()
            .any(|l| l.contains("Run failed during Reconciling")));
        assert_eq!(transport.sent_to(), ADMINS.to_vec());
    }

    #[tokio::test]
    async fn test_debug_mode_sends_nothing() {
        let run = controller(
            class_sheets("2024-01-15", "2024-01-08"),
            DeliveryMode::Debug,
            "2024-01-18 08:00:00",
            false,
        );

        let report = run.run().await;

        assert_eq!(report.progress.absence_notices[0].status, DeliveryStatus::Logged);
        assert_eq!(report.admin.delivered, 3);
        assert!(report
            .log
            .iter()
            .any(|l| l.contains("[debug] Not sending email") && l.contains("To: cleo@example.com")));
        assert!(report
            .log
            .iter()
            .any(|l| l.contains("Admin report logged for 3 out of 3 administrators (debug mode)")));
    }

    #[tokio::test]
    async fn test_single_session_with_every_admin_failing_still_finishes() {
        let attendance = SheetTable::new(
            "Attendance",
            vec![
                row(&["Timestamp", "Date", "Present", "", "", "", "Email", "Name"]),
                row(&["", "2024-01-15", "Anna, Ben", "", "", "", "anna@example.com", "Anna"]),
                row(&["", "", "", "", "", "", "ben@example.com", "Ben"]),
                row(&["", "", "", "", "", "", "cleo@example.com", "Cleo"]),
                row(&["", "", "", "", "", "", "", "Dov"]),
            ],
        );
        let summaries = SheetTable::new("Summaries", vec![row(&["Timestamp", "Name", "Summary", "Email"])]);
        let transport = RecordingTransport::failing_for(&ADMINS);
        let run = controller(
            InMemorySheetSource::new(vec![attendance, summaries]),
            DeliveryMode::Live(Arc::new(transport.clone())),
            "2024-01-18 08:00:00",
            true,
        );

        let report = run.run().await;

        assert_eq!(report.progress.state, RunState::Done);
        assert!(report.progress.failure.is_none());
        assert_eq!(report.progress.sessions.as_ref().unwrap().prior, None);
        assert_eq!(report.progress.absent_students, vec![cleo()]);
        assert!(report.progress.overdue_students.is_empty());
        assert!(report.progress.overdue_notices.is_empty());
        assert!(report.log.iter().any(|l| l.contains("No prior session")));
        assert!(report
            .log
            .iter()
            .any(|l| l.contains("[WARN] Session 2024-01-15: no email for Dov; not notified")));

        assert_eq!(report.admin.attempted, 3);
        assert_eq!(report.admin.delivered, 0);
        assert!(report
            .log
            .iter()
            .any(|l| l.contains("Admin report sent to 0 out of 3 administrators")));
        assert_eq!(transport.sent_to(), vec!["cleo@example.com"]);
    }

    #[tokio::test]
    async fn test_every_reconciliation_call_rereads_the_sheet() {
        let source = class_sheets("2024-01-15", "2024-01-08");
        let engine = ReconciliationEngine::new(Arc::new(source.clone()), layout());

        let first = engine.absentees("2024-01-15").await.unwrap();
        let second = engine.absentees("2024-01-15").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetch_count("Attendance"), 2);
        assert_eq!(source.fetch_count("Summaries"), 0);
    }
}
