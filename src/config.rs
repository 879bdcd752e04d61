// src/config.rs
use lettre::Address;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_FROM_NAME: &str = "FP Kadampa TLV";
pub const DEFAULT_SIGNATURE: &str = "Mikey";
pub const DEFAULT_ATTENDANCE_SHEET: &str = "Attendance";
pub const DEFAULT_SUMMARY_SHEET: &str = "Summaries";

// The sheet id sits between "/d/" and "/edit" in a share link.
static SPREADSHEET_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/d/([A-Za-z0-9_-]+)/edit").expect("valid spreadsheet id pattern"));

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration from the environment: {0}")]
    Env(#[from] envy::Error),
    #[error("SPREADSHEET_URL does not contain a sheet id between /d/ and /edit: {0}")]
    MalformedSpreadsheetUrl(String),
    #[error("ADMIN_EMAIL must list at least one address")]
    NoAdminRecipients,
    #[error("Invalid email address in {key}: {value}")]
    InvalidAddress { key: &'static str, value: String },
    #[error("EMAIL_PASSWORD is required unless running in debug mode")]
    MissingCredentials,
}

/// Raw environment shape, one field per recognized key.
#[derive(Debug, Deserialize, Clone)]
struct EnvConfig {
    spreadsheet_url: String,
    form_link: String,
    dropbox_link: String,
    from_email: String,
    admin_email: String,
    email_password: Option<String>,
    smtp_username: Option<String>,
    #[serde(default = "default_smtp_server")]
    smtp_server: String,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
    #[serde(default = "default_from_name")]
    from_name: String,
    #[serde(default = "default_signature")]
    signature: String,
    #[serde(default = "default_attendance_sheet")]
    attendance_sheet: String,
    #[serde(default = "default_summary_sheet")]
    summary_sheet: String,
    google_api_key: Option<String>,
    #[serde(default)]
    send_overdue_notices: bool,
}

fn default_smtp_server() -> String {
    DEFAULT_SMTP_SERVER.to_string()
}

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

fn default_from_name() -> String {
    DEFAULT_FROM_NAME.to_string()
}

fn default_signature() -> String {
    DEFAULT_SIGNATURE.to_string()
}

fn default_attendance_sheet() -> String {
    DEFAULT_ATTENDANCE_SHEET.to_string()
}

fn default_summary_sheet() -> String {
    DEFAULT_SUMMARY_SHEET.to_string()
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spreadsheet_id: String,
    pub attendance_sheet: String,
    pub summary_sheet: String,
    pub google_api_key: Option<String>,
    pub form_link: String,
    pub dropbox_link: String,
    pub from_email: String,
    pub from_name: String,
    pub signature: String,
    pub admin_emails: Vec<String>,
    /// `None` only in debug mode, where nothing is delivered.
    pub smtp: Option<SmtpSettings>,
    pub send_overdue_notices: bool,
    pub debug: bool,
}

impl AppConfig {
    /// Reads the process environment; `main` has already loaded any `.env` file.
    pub fn from_env(debug: bool) -> Result<Self, ConfigError> {
        let raw = envy::from_env::<EnvConfig>()?;
        Self::from_raw(raw, debug)
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)], debug: bool) -> Result<Self, ConfigError> {
        let iter = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string()));
        let raw = envy::from_iter::<_, EnvConfig>(iter)?;
        Self::from_raw(raw, debug)
    }

    fn from_raw(raw: EnvConfig, debug: bool) -> Result<Self, ConfigError> {
        let spreadsheet_id = extract_spreadsheet_id(&raw.spreadsheet_url)?;

        let from_email = raw.from_email.trim().to_string();
        ensure_address("FROM_EMAIL", &from_email)?;

        let admin_emails = parse_admin_emails(&raw.admin_email)?;

        let smtp = match raw.email_password.filter(|p| !p.is_empty()) {
            Some(password) => Some(SmtpSettings {
                server: raw.smtp_server,
                port: raw.smtp_port,
                username: raw
                    .smtp_username
                    .filter(|u| !u.trim().is_empty())
                    .unwrap_or_else(|| from_email.clone()),
                password,
            }),
            None if debug => None,
            None => return Err(ConfigError::MissingCredentials),
        };

        Ok(Self {
            spreadsheet_id,
            attendance_sheet: raw.attendance_sheet,
            summary_sheet: raw.summary_sheet,
            google_api_key: raw.google_api_key.filter(|k| !k.trim().is_empty()),
            form_link: raw.form_link,
            dropbox_link: raw.dropbox_link,
            from_email,
            from_name: raw.from_name,
            signature: raw.signature,
            admin_emails,
            smtp,
            send_overdue_notices: raw.send_overdue_notices,
            debug,
        })
    }
}

pub fn extract_spreadsheet_id(url: &str) -> Result<String, ConfigError> {
    SPREADSHEET_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ConfigError::MalformedSpreadsheetUrl(url.to_string()))
}

pub fn parse_admin_emails(value: &str) -> Result<Vec<String>, ConfigError> {
    let admins: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if admins.is_empty() {
        return Err(ConfigError::NoAdminRecipients);
    }
    for admin in &admins {
        ensure_address("ADMIN_EMAIL", admin)?;
    }
    Ok(admins)
}

fn ensure_address(key: &'static str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<Address>()
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidAddress {
            key,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHEET_URL: &str = "https://docs.google.com/spreadsheets/d/1AbC-xyz_987/edit#gid=0";

    fn base_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("SPREADSHEET_URL", SHEET_URL),
            ("FORM_LINK", "https://forms.example.com/summary"),
            ("DROPBOX_LINK", "https://dropbox.example.com/materials"),
            ("FROM_EMAIL", "class@example.com"),
            ("ADMIN_EMAIL", "admin1@example.com, admin2@example.com"),
            ("EMAIL_PASSWORD", "app-password"),
        ]
    }

    #[test]
    fn test_full_config_with_defaults() {
        let config = AppConfig::from_pairs(&base_pairs(), false).unwrap();
        assert_eq!(config.spreadsheet_id, "1AbC-xyz_987");
        assert_eq!(config.admin_emails, vec!["admin1@example.com", "admin2@example.com"]);
        assert_eq!(config.attendance_sheet, DEFAULT_ATTENDANCE_SHEET);
        assert_eq!(config.summary_sheet, DEFAULT_SUMMARY_SHEET);
        assert!(!config.send_overdue_notices);
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.server, DEFAULT_SMTP_SERVER);
        assert_eq!(smtp.port, DEFAULT_SMTP_PORT);
        assert_eq!(smtp.username, "class@example.com");
    }

    #[test]
    fn test_missing_required_key_is_fatal() {
        let pairs: Vec<_> = base_pairs()
            .into_iter()
            .filter(|(k, _)| *k != "SPREADSHEET_URL")
            .collect();
        assert!(matches!(
            AppConfig::from_pairs(&pairs, false),
            Err(ConfigError::Env(_))
        ));
    }

    #[test]
    fn test_password_only_required_outside_debug() {
        let pairs: Vec<_> = base_pairs()
            .into_iter()
            .filter(|(k, _)| *k != "EMAIL_PASSWORD")
            .collect();
        assert!(matches!(
            AppConfig::from_pairs(&pairs, false),
            Err(ConfigError::MissingCredentials)
        ));
        let config = AppConfig::from_pairs(&pairs, true).unwrap();
        assert!(config.smtp.is_none());
        assert!(config.debug);
    }

    #[test]
    fn test_spreadsheet_id_extraction() {
        assert_eq!(extract_spreadsheet_id(SHEET_URL).unwrap(), "1AbC-xyz_987");
        assert!(matches!(
            extract_spreadsheet_id("https://docs.google.com/spreadsheets/1AbC"),
            Err(ConfigError::MalformedSpreadsheetUrl(_))
        ));
    }

    #[test]
    fn test_admin_list_parsing() {
        assert_eq!(
            parse_admin_emails(" a@example.com,,b@example.com ").unwrap(),
            vec!["a@example.com", "b@example.com"]
        );
        assert!(matches!(parse_admin_emails(" , "), Err(ConfigError::NoAdminRecipients)));
        assert!(matches!(
            parse_admin_emails("not-an-address"),
            Err(ConfigError::InvalidAddress { key: "ADMIN_EMAIL", .. })
        ));
    }
}
