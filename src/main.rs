// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod clock;
mod config;
mod date_validation;
mod notifier;
mod reconciliation;
mod run_controller;
mod run_log;
mod sheets;

#[cfg(test)]
mod run_controller_tests;
#[cfg(test)]
mod test_support;

use clock::SystemClock;
use config::AppConfig;
use notifier::{DeliveryMode, NoticeTemplates, Notifier, SmtpMailer};
use reconciliation::{ReconciliationEngine, SheetLayout};
use run_controller::RunController;
use sheets::{GoogleSheetsClient, SheetAccess, SheetSource};

#[derive(Parser)]
#[command(name = "attendance-notifier")]
#[command(about = "Emails students who missed the latest class and reports the run to the admins", long_about = None)]
struct Cli {
    /// Render every email into the log instead of sending it
    #[arg(short, long)]
    debug: bool,
}

// Exits 0 once configuration is loaded, whatever happens during the run;
// the admin report and the console log are the only failure signals.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenv::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting tracing subscriber failed")?;

    let config = AppConfig::from_env(cli.debug).context("Failed to load configuration")?;
    info!("Configuration loaded (debug mode: {}).", config.debug);

    let access = match &config.google_api_key {
        Some(key) => SheetAccess::ApiKey(key.clone()),
        None => SheetAccess::CsvExport,
    };
    let source: Arc<dyn SheetSource> = Arc::new(
        GoogleSheetsClient::new(config.spreadsheet_id.clone(), access)
            .context("Failed to build spreadsheet client")?,
    );
    let engine = ReconciliationEngine::new(
        source,
        SheetLayout {
            attendance_sheet: config.attendance_sheet.clone(),
            summary_sheet: config.summary_sheet.clone(),
        },
    );

    let mode = match (&config.smtp, config.debug) {
        (Some(smtp), false) => DeliveryMode::Live(Arc::new(SmtpMailer::new(smtp.clone()))),
        _ => DeliveryMode::Debug,
    };
    let notifier = Notifier::new(NoticeTemplates::from_config(&config), mode);

    let controller = RunController::new(
        engine,
        notifier,
        Arc::new(SystemClock),
        config.admin_emails.clone(),
        config.send_overdue_notices,
    );
    let report = controller.run().await;
    info!(
        "Run finished: {} notices delivered, admin report delivered to {} of {}.",
        report.notices_delivered(),
        report.admin.delivered,
        report.admin.attempted
    );

    Ok(())
}
