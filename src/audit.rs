use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Granted(String),
    Denied,
    /// Liveness gate refused the face; no match was attempted
    LivenessRejected,
    Enrolled(String),
    Removed(String),
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Granted(name) => write!(f, "Access granted to {}", single_line(name)),
            AuditOutcome::Denied => f.write_str("Unauthorized access attempt"),
            AuditOutcome::LivenessRejected => {
                f.write_str("Unauthorized access attempt (liveness check failed)")
            }
            AuditOutcome::Enrolled(name) => write!(f, "New face added: {}", single_line(name)),
            AuditOutcome::Removed(name) => write!(f, "Face removed: {}", single_line(name)),
        }
    }
}

/// Names come from users; keep one entry per line no matter what they type
fn single_line(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
}

impl AuditEntry {
    pub fn now(outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
        }
    }

    /// `<ISO-8601 timestamp> - <message>`
    pub fn to_line(&self) -> String {
        format!(
            "{} - {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.outcome
        )
    }
}

pub trait AuditSink {
    fn record(&self, entry: &AuditEntry) -> AuthResult<()>;
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, entry: &AuditEntry) -> AuthResult<()> {
        (**self).record(entry)
    }
}

/// Append-only text log, one entry per line
#[derive(Debug, Clone)]
pub struct FileAuditLog {
    path: PathBuf,
}

impl FileAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the log back, keeping only the last `tail` lines if given.
    /// A log that was never written reads as empty.
    pub fn read_lines(&self, tail: Option<usize>) -> AuthResult<Vec<String>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AuthError::io(&self.path, err)),
        };
        let mut lines = BufReader::new(file)
            .lines()
            .collect::<io::Result<Vec<_>>>()
            .map_err(|source| AuthError::io(&self.path, source))?;
        if let Some(n) = tail {
            let skip = lines.len().saturating_sub(n);
            lines.drain(..skip);
        }
        Ok(lines)
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: &AuditEntry) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| AuthError::io(parent, source))?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        // Entries carry enrolled names; keep the log as private as the store
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .map_err(|source| AuthError::io(&self.path, source))?;
        // Single write so concurrent appenders cannot interleave within a line
        let line = format!("{}\n", entry.to_line());
        file.write_all(line.as_bytes())
            .map_err(|source| AuthError::io(&self.path, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(outcome: AuditOutcome) -> AuditEntry {
        AuditEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
            outcome,
        }
    }

    #[test]
    fn line_format_matches_vocabulary() {
        assert_eq!(
            at(AuditOutcome::Granted("alice".into())).to_line(),
            "2024-03-01T12:30:05.000Z - Access granted to alice"
        );
        assert_eq!(
            at(AuditOutcome::Denied).to_line(),
            "2024-03-01T12:30:05.000Z - Unauthorized access attempt"
        );
        assert_eq!(
            at(AuditOutcome::Enrolled("bob".into())).to_line(),
            "2024-03-01T12:30:05.000Z - New face added: bob"
        );
        assert!(at(AuditOutcome::LivenessRejected)
            .to_line()
            .ends_with("Unauthorized access attempt (liveness check failed)"));
    }

    #[test]
    fn control_characters_cannot_forge_entries() {
        let line = at(AuditOutcome::Enrolled(
            "mallory\n2024-01-01T00:00:00.000Z - Access granted to root".into(),
        ))
        .to_line();
        assert!(!line.contains('\n'));
        assert!(line.contains("mallory?2024"));
    }

    #[test]
    fn appends_without_touching_existing_lines() {
        let tmp = TempDir::new().unwrap();
        let log = FileAuditLog::new(tmp.path().join("logs").join("auth.log"));
        assert!(log.read_lines(None).unwrap().is_empty());

        log.record(&at(AuditOutcome::Enrolled("alice".into())))
            .unwrap();
        log.record(&at(AuditOutcome::Granted("alice".into())))
            .unwrap();
        log.record(&at(AuditOutcome::Denied)).unwrap();

        let lines = log.read_lines(None).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("New face added: alice"));
        assert!(lines[2].ends_with("Unauthorized access attempt"));

        let reopened = FileAuditLog::new(log.path());
        reopened.record(&at(AuditOutcome::Removed("alice".into())))
            .unwrap();
        let lines = reopened.read_lines(Some(2)).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Unauthorized access attempt"));
        assert!(lines[1].ends_with("Face removed: alice"));
    }

    #[cfg(unix)]
    #[test]
    fn new_log_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let log = FileAuditLog::new(tmp.path().join("auth.log"));
        log.record(&at(AuditOutcome::Enrolled("alice".into())))
            .unwrap();

        let mode = fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
