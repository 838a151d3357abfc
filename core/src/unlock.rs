//! Unlock Workflow: the supervised way to change the canonical content.
//!
//! ```text
//! Requested -> ReasonLogged -> Cooldown -> Editing -> DiffChecked
//!           -> NoChange | Updated -> Relocked
//! ```
//!
//! Protections stay applied through the cooldown. From `Editing` onward a
//! [`RelockGuard`] owns re-locking, so an editor crash or a panic still ends
//! in `Relocked`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::context::GuardContext;
use crate::error::{GuardError, Result};
use crate::fsutil::{self, sha256_hex};
use crate::reconcile::Reconciler;
use crate::suspend::SuspendKind;

const RELOCK_ATTEMPTS: u32 = 3;
const RELOCK_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnlockPhase {
    Requested,
    ReasonLogged,
    Cooldown,
    Editing,
    DiffChecked,
    NoChange,
    Updated,
    Relocked,
}

impl fmt::Display for UnlockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnlockPhase::Requested => "REQUESTED",
            UnlockPhase::ReasonLogged => "REASON_LOGGED",
            UnlockPhase::Cooldown => "COOLDOWN",
            UnlockPhase::Editing => "EDITING",
            UnlockPhase::DiffChecked => "DIFF_CHECKED",
            UnlockPhase::NoChange => "NO_CHANGE",
            UnlockPhase::Updated => "UPDATED",
            UnlockPhase::Relocked => "RELOCKED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnlockOutcome {
    NoChange,
    Updated,
}

impl From<UnlockOutcome> for UnlockPhase {
    fn from(outcome: UnlockOutcome) -> Self {
        match outcome {
            UnlockOutcome::NoChange => UnlockPhase::NoChange,
            UnlockOutcome::Updated => UnlockPhase::Updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSession {
    pub session_id: Uuid,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub hash_before: String,
    pub hash_after: String,
    pub outcome: UnlockOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub trait Editor: Send + Sync {
    /// Edit `path` in place, returning once the editor exits.
    fn edit(&self, path: &Path) -> Result<()>;
}

impl<F> Editor for F
where
    F: Fn(&Path) -> Result<()> + Send + Sync,
{
    fn edit(&self, path: &Path) -> Result<()> {
        self(path)
    }
}

/// Runs an external editor command line.
#[derive(Debug, Clone)]
pub struct CommandEditor {
    command: String,
}

impl CommandEditor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Configured editor, then `$VISUAL`, `$EDITOR`, then `vi`.
    pub fn resolve(configured: Option<&str>) -> Self {
        let command = configured
            .map(str::to_string)
            .or_else(|| std::env::var("VISUAL").ok())
            .or_else(|| std::env::var("EDITOR").ok())
            .filter(|command| !command.trim().is_empty())
            .unwrap_or_else(|| "vi".to_string());
        Self { command }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Editor for CommandEditor {
    fn edit(&self, path: &Path) -> Result<()> {
        let argv = shlex::split(&self.command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| GuardError::Editor(format!("cannot parse editor {:?}", self.command)))?;
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .arg(path)
            .status()
            .map_err(|e| GuardError::Editor(format!("{}: {e}", argv[0])))?;
        if !status.success() {
            return Err(GuardError::Editor(format!("{} exited with {status}", argv[0])));
        }
        Ok(())
    }
}

/// JSON-lines record of every finished session.
#[derive(Debug, Clone)]
pub struct SessionJournal {
    path: PathBuf,
}

impl SessionJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, session: &UnlockSession) -> Result<()> {
        fsutil::append_line(&self.path, &serde_json::to_string(session)?)
    }

    /// Up to `limit` most recent sessions, oldest first. Unparseable lines
    /// are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<UnlockSession>> {
        let Some(raw) = fsutil::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let sessions: Vec<UnlockSession> = String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = sessions.len().saturating_sub(limit);
        Ok(sessions.into_iter().skip(skip).collect())
    }
}

/// Puts protections back when dropped unless [`RelockGuard::finish`] ran.
struct RelockGuard<'a> {
    ctx: &'a GuardContext,
    finished: bool,
}

impl<'a> RelockGuard<'a> {
    fn new(ctx: &'a GuardContext) -> Self {
        Self {
            ctx,
            finished: false,
        }
    }

    fn finish(mut self) -> Result<()> {
        self.finished = true;
        relock(self.ctx)
    }
}

impl Drop for RelockGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::error!("unlock session aborted; re-locking");
        if let Err(err) = relock(self.ctx) {
            tracing::error!("{err}");
        }
    }
}

fn relock(ctx: &GuardContext) -> Result<()> {
    let mut last_error = String::new();
    let mut locked = false;
    for attempt in 1..=RELOCK_ATTEMPTS {
        match Reconciler::on_behalf_of(ctx, SuspendKind::Unlock).reconcile() {
            Ok(_) => {
                locked = true;
                break;
            }
            Err(err) => {
                tracing::error!("re-lock attempt {attempt}/{RELOCK_ATTEMPTS} failed: {err}");
                last_error = err.to_string();
                if attempt < RELOCK_ATTEMPTS {
                    std::thread::sleep(RELOCK_BACKOFF * attempt);
                }
            }
        }
    }
    // The marker goes either way so the watcher and watchdog take over.
    if let Err(err) = ctx.suspensions().resume(SuspendKind::Unlock) {
        tracing::error!("clearing unlock marker: {err}");
    }
    ctx.lock_state_files();
    if locked {
        return Ok(());
    }
    ctx.audit().record(
        AuditEvent::new("relock_failed")
            .field("path", ctx.resource_path().display())
            .field("error", &last_error),
    );
    Err(GuardError::RelockFailed {
        path: ctx.resource_path().to_path_buf(),
        attempts: RELOCK_ATTEMPTS,
        last_error,
    })
}

/// Unified diff between the canonical and edited content.
pub fn unified_diff(before: &[u8], after: &[u8]) -> String {
    let before = String::from_utf8_lossy(before);
    let after = String::from_utf8_lossy(after);
    similar::TextDiff::from_lines(before.as_ref(), after.as_ref())
        .unified_diff()
        .context_radius(3)
        .header("canonical", "edited")
        .to_string()
}

pub struct UnlockWorkflow<'a> {
    ctx: &'a GuardContext,
    editor: &'a dyn Editor,
    sleeper: &'a dyn Sleeper,
    on_phase: Option<Box<dyn Fn(UnlockPhase) + 'a>>,
}

impl<'a> UnlockWorkflow<'a> {
    pub fn new(ctx: &'a GuardContext, editor: &'a dyn Editor, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            ctx,
            editor,
            sleeper,
            on_phase: None,
        }
    }

    /// Observe each phase as it is entered.
    pub fn on_phase(mut self, observer: impl Fn(UnlockPhase) + 'a) -> Self {
        self.on_phase = Some(Box::new(observer));
        self
    }

    fn enter(&self, phase: UnlockPhase) {
        tracing::info!("unlock: {phase}");
        if let Some(observer) = &self.on_phase {
            observer(phase);
        }
    }

    pub fn run(&self, reason: &str) -> Result<UnlockSession> {
        self.enter(UnlockPhase::Requested);
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(GuardError::EmptyReason);
        }

        let _lock = self.ctx.maintenance_lock()?;
        let suspensions = self.ctx.suspensions();
        if let Some(marker) = suspensions.active(SuspendKind::Transaction) {
            return Err(GuardError::MaintenanceBusy(format!(
                "package transaction by pid {} since {}",
                marker.pid,
                marker.started_at.to_rfc3339()
            )));
        }
        let canonical = self.ctx.canonical().require()?.snapshot;
        let path = self.ctx.resource_path();

        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.ctx.audit().record(
            AuditEvent::new("unlock_requested")
                .field("session", session_id)
                .field("path", path.display())
                .reason(reason),
        );
        self.enter(UnlockPhase::ReasonLogged);

        let cooldown = self.ctx.config().unlock_cooldown();
        self.enter(UnlockPhase::Cooldown);
        if !cooldown.is_zero() {
            tracing::info!("waiting {}s before unlocking", cooldown.as_secs());
            self.sleeper.sleep(cooldown);
        }

        suspensions.suspend(SuspendKind::Unlock, reason)?;
        let guard = RelockGuard::new(self.ctx);
        self.enter(UnlockPhase::Editing);
        let edited = self.edit(path, &canonical.content_bytes);

        self.enter(UnlockPhase::DiffChecked);
        let (outcome, hash_after, error) = match edited {
            Ok(after) if after == canonical.content_bytes => {
                (UnlockOutcome::NoChange, canonical.content_hash.clone(), None)
            }
            Ok(after) => {
                let diff = unified_diff(&canonical.content_bytes, &after);
                tracing::info!("canonical content updated:\n{diff}");
                self.ctx.unlock_state_files();
                match self.ctx.canonical().store(&after, path) {
                    Ok(snapshot) => (UnlockOutcome::Updated, snapshot.content_hash, None),
                    Err(err) => {
                        tracing::error!("storing the edited content failed: {err}");
                        (UnlockOutcome::NoChange, sha256_hex(&after), Some(err))
                    }
                }
            }
            Err(err) => {
                tracing::error!("editing failed: {err}; restoring canonical content");
                if let Err(restore) = fsutil::write_in_place(path, &canonical.content_bytes) {
                    tracing::error!("restoring {}: {restore}", path.display());
                }
                (UnlockOutcome::NoChange, canonical.content_hash.clone(), Some(err))
            }
        };
        self.enter(outcome.into());

        let relocked = guard.finish();
        if relocked.is_ok() {
            self.enter(UnlockPhase::Relocked);
        }

        let session = UnlockSession {
            session_id,
            reason: reason.to_string(),
            started_at,
            hash_before: canonical.content_hash.clone(),
            hash_after,
            outcome,
            error: error.as_ref().map(ToString::to_string),
        };
        if let Err(err) = SessionJournal::new(self.ctx.layout().sessions_path()).append(&session) {
            tracing::warn!("session journal not written: {err}");
        }
        self.ctx.audit().record(
            AuditEvent::new("unlock_session")
                .field("session", session_id)
                .field("outcome", UnlockPhase::from(outcome))
                .field("hash_before", &session.hash_before)
                .field("hash_after", &session.hash_after)
                .reason(reason),
        );

        relocked?;
        if let Some(err) = error {
            return Err(err);
        }
        Ok(session)
    }

    /// Release, present the canonical content to the editor, read back.
    fn edit(&self, path: &Path, canonical: &[u8]) -> Result<Vec<u8>> {
        self.ctx.release()?;
        if fsutil::read_optional(path)?.as_deref() != Some(canonical) {
            fsutil::write_in_place(path, canonical)?;
        }
        self.editor.edit(path)?;
        Ok(fsutil::read_optional(path)?.unwrap_or_default())
    }
}
