//! Append-only audit trail.
//!
//! One line per event:
//! `<rfc3339> <phase> key=value... reason="..."`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;
use crate::fsutil;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    phase: String,
    fields: Vec<(String, String)>,
    reason: Option<String>,
}

impl AuditEvent {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            fields: Vec::new(),
            reason: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    fn render(&self, timestamp: &str) -> String {
        let mut line = format!("{timestamp} {}", self.phase);
        for (key, value) in &self.fields {
            if value.is_empty() || value.contains(char::is_whitespace) || value.contains('"') {
                let _ = write!(line, " {key}={value:?}");
            } else {
                let _ = write!(line, " {key}={value}");
            }
        }
        if let Some(reason) = &self.reason {
            let _ = write!(line, " reason={reason:?}");
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let line = event.render(&Utc::now().to_rfc3339());
        fsutil::append_line(&self.path, &line)
    }

    /// Append and mirror to tracing; a failing audit file never stops the
    /// caller.
    pub fn record(&self, event: AuditEvent) {
        tracing::info!(target: "hostguard::audit", "{}", event.render("-"));
        if let Err(err) = self.append(&event) {
            tracing::warn!("audit log {} not written: {err}", self.path.display());
        }
    }

    /// Last `limit` lines, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<String>> {
        let Some(raw) = fsutil::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines.into_iter().skip(skip).collect())
    }
}
