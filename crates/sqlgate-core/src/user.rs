//! Authorized users and service expiration, loaded once at startup and
//! immutable for the lifetime of the process.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

/// Wire format of the optional JSON config file.
#[derive(Debug, Deserialize)]
struct UserFile {
    expiration: NaiveDate,
    users: Vec<String>,
}

/// The authorized-user set and the instance expiration date.
///
/// `expiration == None` is the legacy "deprecated" mode carried over from
/// old deployments: the instance counts as expired exactly when the user
/// set is empty.
#[derive(Debug, Clone, Default)]
pub struct UserAccess {
    users: Vec<String>,
    expiration: Option<NaiveDate>,
}

impl UserAccess {
    pub fn new(users: Vec<String>, expiration: Option<NaiveDate>) -> Self {
        Self { users, expiration }
    }

    /// Loads user state from the environment. Precedence mirrors the
    /// historical behaviour: a plain-text users file short-circuits
    /// everything else (including the expiration date); otherwise the JSON
    /// config file is read, and the `EXPIRATION_DATE` / `AUTHORIZED_USERS`
    /// variables override whatever the file provided.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if let Some(path) = get("USERS_FILE_PATH") {
            let users = read_users_file(Path::new(&path))?;
            return Ok(Self::new(users, None));
        }

        let mut access = Self::default();

        if let Some(path) = get("CONFIG_FILE_PATH") {
            let content = fs::read_to_string(Path::new(&path))
                .with_context(|| format!("unable to read users file: {path}"))?;
            let file: UserFile =
                serde_json::from_str(&content).context("unable to parse users file")?;
            access.users = trimmed(file.users);
            access.expiration = Some(file.expiration);
        }

        if let Some(raw) = get("EXPIRATION_DATE") {
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .context("unable to parse expiration date")?;
            access.expiration = Some(date);
        }

        if let Some(raw) = get("AUTHORIZED_USERS") {
            access.users = trimmed(raw.split(',').map(str::to_owned).collect());
        }

        Ok(access)
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    /// Exact, case-sensitive membership check.
    pub fn contains(&self, user: &str) -> bool {
        self.users.iter().any(|candidate| candidate == user)
    }

    pub fn expiration(&self) -> Option<NaiveDate> {
        self.expiration
    }

    /// True when no expiration date was configured (legacy mode).
    pub fn is_deprecated(&self) -> bool {
        self.expiration.is_none()
    }

    /// Whether this instance should stop serving queries. In legacy mode
    /// the instance expires when its user set is empty.
    pub fn is_expired(&self) -> bool {
        match self.expiration {
            None => self.users.is_empty(),
            Some(date) => date <= Utc::now().date_naive(),
        }
    }
}

fn read_users_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read users file: {}", path.display()))?;
    Ok(trimmed(content.lines().map(str::to_owned).collect()))
}

fn trimmed(entries: Vec<String>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| entry.trim().to_owned())
        .filter(|entry| !entry.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::Duration;
    use tempfile::NamedTempFile;

    use super::*;

    fn lookup(vars: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
        }
    }

    #[test]
    fn users_file_short_circuits_and_enables_legacy_mode() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "alice").unwrap();
        writeln!(file, "  bob  ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "carol").unwrap();

        let access = UserAccess::from_lookup(lookup(vec![
            (
                "USERS_FILE_PATH",
                file.path().to_string_lossy().into_owned(),
            ),
            ("EXPIRATION_DATE", "2020-01-01".to_owned()),
        ]))
        .unwrap();

        assert_eq!(access.users(), ["alice", "bob", "carol"]);
        assert!(access.is_deprecated());
        assert!(!access.is_expired());
    }

    #[test]
    fn config_file_provides_users_and_expiration() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"expiration": "2099-12-31", "users": ["alice", " bob "]}}"#
        )
        .unwrap();

        let access = UserAccess::from_lookup(lookup(vec![(
            "CONFIG_FILE_PATH",
            file.path().to_string_lossy().into_owned(),
        )]))
        .unwrap();

        assert_eq!(access.users(), ["alice", "bob"]);
        assert_eq!(
            access.expiration(),
            Some(NaiveDate::from_ymd_opt(2099, 12, 31).unwrap())
        );
        assert!(!access.is_expired());
    }

    #[test]
    fn env_variables_override_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"expiration": "2099-12-31", "users": ["alice"]}}"#
        )
        .unwrap();

        let access = UserAccess::from_lookup(lookup(vec![
            (
                "CONFIG_FILE_PATH",
                file.path().to_string_lossy().into_owned(),
            ),
            ("EXPIRATION_DATE", "2000-01-01".to_owned()),
            ("AUTHORIZED_USERS", "dave, erin ,,frank".to_owned()),
        ]))
        .unwrap();

        assert_eq!(access.users(), ["dave", "erin", "frank"]);
        assert!(access.is_expired());
    }

    #[test]
    fn invalid_expiration_date_is_an_error() {
        let err = UserAccess::from_lookup(lookup(vec![(
            "EXPIRATION_DATE",
            "31-12-2099".to_owned(),
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("expiration date"));
    }

    #[test]
    fn expiration_compares_against_today() {
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        let yesterday = Utc::now().date_naive() - Duration::days(1);

        assert!(!UserAccess::new(vec!["alice".into()], Some(tomorrow)).is_expired());
        assert!(UserAccess::new(vec!["alice".into()], Some(yesterday)).is_expired());
    }

    #[test]
    fn legacy_mode_expires_with_an_empty_user_set() {
        assert!(UserAccess::new(vec![], None).is_expired());
        assert!(!UserAccess::new(vec!["alice".into()], None).is_expired());
    }

    #[test]
    fn membership_is_exact_and_case_sensitive() {
        let access = UserAccess::new(vec!["Alice".into()], None);
        assert!(access.contains("Alice"));
        assert!(!access.contains("alice"));
        assert!(!access.contains("Ali"));
    }
}
