//! Transaction Guard: open the resource around a package transaction.
//!
//! Pacman runs the pre and post hooks as separate processes, so the pair
//! coordinates through the `transaction` suspension marker rather than
//! in-memory state. In-process callers use [`TransactionScope`], which runs
//! the post step on every exit path.

use std::process::{Command, ExitStatus};

use crate::audit::AuditEvent;
use crate::context::GuardContext;
use crate::error::{GuardError, Result};
use crate::reconcile::{ReconcileResult, Reconciler};
use crate::suspend::SuspendKind;

pub struct TransactionGuard {
    ctx: GuardContext,
}

impl TransactionGuard {
    pub fn new(ctx: GuardContext) -> Self {
        Self { ctx }
    }

    /// Pause the watcher and drop every protection.
    pub fn pre_transaction(&self) -> Result<()> {
        let _lock = self.ctx.maintenance_lock()?;
        let suspensions = self.ctx.suspensions();
        if let Some(session) = suspensions.active(SuspendKind::Unlock) {
            return Err(GuardError::MaintenanceBusy(format!(
                "unlock session by pid {} since {}",
                session.pid,
                session.started_at.to_rfc3339()
            )));
        }

        suspensions.suspend(SuspendKind::Transaction, "package transaction")?;
        let removed = self.ctx.release()?;
        self.ctx.audit().record(
            AuditEvent::new("pre_transaction")
                .field("path", self.ctx.resource_path().display())
                .field("layers_removed", removed),
        );
        Ok(())
    }

    /// Reconcile, then clear the marker even when reconciliation failed.
    pub fn post_transaction(&self) -> Result<ReconcileResult> {
        let result = Reconciler::on_behalf_of(&self.ctx, SuspendKind::Transaction).reconcile();
        let resumed = self.ctx.suspensions().resume(SuspendKind::Transaction);

        let mut event = AuditEvent::new("post_transaction")
            .field("path", self.ctx.resource_path().display());
        event = match &result {
            Ok(result) => event
                .field("result", result.reason)
                .field("changed", result.changed),
            Err(err) => event.field("error", err),
        };
        self.ctx.audit().record(event);

        let result = result?;
        resumed?;
        Ok(result)
    }

    /// Run the pre step and hand back a scope that owns the post step.
    /// When the pre step fails the post step runs immediately.
    pub fn begin(&self) -> Result<TransactionScope<'_>> {
        if let Err(err) = self.pre_transaction() {
            if let Err(post_err) = self.post_transaction() {
                tracing::error!("restoring after failed pre-transaction: {post_err}");
            }
            return Err(err);
        }
        Ok(TransactionScope {
            guard: self,
            finished: false,
        })
    }

    /// Run `program` with protections lifted.
    pub fn run_wrapped(&self, program: &str, args: &[String]) -> Result<ExitStatus> {
        let scope = self.begin()?;
        tracing::info!("running {program} inside a transaction window");
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| GuardError::Command {
                command: program.to_string(),
                detail: e.to_string(),
            });
        let post = scope.finish();
        let status = status?;
        post?;
        Ok(status)
    }
}

/// Guarantees `post_transaction` for a successful `pre_transaction`.
#[must_use = "dropping the scope immediately ends the transaction window"]
pub struct TransactionScope<'a> {
    guard: &'a TransactionGuard,
    finished: bool,
}

impl TransactionScope<'_> {
    pub fn finish(mut self) -> Result<ReconcileResult> {
        self.finished = true;
        self.guard.post_transaction()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!("transaction scope dropped without finish; re-applying protections");
        if let Err(err) = self.guard.post_transaction() {
            tracing::error!("post-transaction after early exit failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::ProtectionBackend;
    use crate::reconcile::ReconcileReason;
    use crate::testing::Sandbox;
    use pretty_assertions::assert_eq;

    const CANONICAL: &[u8] = b"0.0.0.0 example.com\n";

    fn protected_sandbox() -> Sandbox {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox.context.enforce().unwrap();
        sandbox
    }

    #[test]
    fn pre_then_post_restores_a_single_locked_layer() {
        let sandbox = protected_sandbox();
        let guard = TransactionGuard::new(sandbox.context.clone());

        guard.pre_transaction().unwrap();
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 0);
        assert!(!sandbox.protection.is_locked(sandbox.resource()));
        assert!(
            sandbox
                .context
                .suspensions()
                .active(SuspendKind::Transaction)
                .is_some()
        );

        let result = guard.post_transaction().unwrap();
        assert_eq!(result.reason, ReconcileReason::InSync);
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
        assert!(sandbox.protection.is_locked(sandbox.resource()));
        // Watcher resumes once the marker is gone.
        assert!(sandbox.context.suspensions().blocking(None).is_none());
    }

    #[test]
    fn writes_during_the_window_are_reverted_afterwards() {
        let sandbox = protected_sandbox();
        let guard = TransactionGuard::new(sandbox.context.clone());

        guard.pre_transaction().unwrap();
        sandbox.tamper(b"# written by a package\n");
        let result = guard.post_transaction().unwrap();
        assert_eq!(result.reason, ReconcileReason::DriftRestored);
        assert_eq!(sandbox.live(), CANONICAL);
    }

    #[test]
    fn dropped_scope_still_relocks() {
        let sandbox = protected_sandbox();
        let guard = TransactionGuard::new(sandbox.context.clone());
        {
            let _scope = guard.begin().unwrap();
            assert_eq!(sandbox.mounts.count(sandbox.resource()), 0);
        }
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
        assert!(sandbox.protection.is_locked(sandbox.resource()));
    }

    #[test]
    fn scope_relocks_when_the_body_panics() {
        let sandbox = protected_sandbox();
        let guard = TransactionGuard::new(sandbox.context.clone());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = guard.begin().unwrap();
            panic!("transaction blew up");
        }));
        assert!(outcome.is_err());
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
    }

    #[test]
    fn failed_command_still_relocks() {
        let sandbox = protected_sandbox();
        let guard = TransactionGuard::new(sandbox.context.clone());

        let status = guard.run_wrapped("false", &[]).unwrap();
        assert!(!status.success());
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);

        let err = guard
            .run_wrapped("/nonexistent/hostguard-test-binary", &[])
            .unwrap_err();
        assert!(matches!(err, GuardError::Command { .. }));
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
    }

    #[test]
    fn refused_while_an_unlock_session_runs() {
        let sandbox = protected_sandbox();
        sandbox
            .context
            .suspensions()
            .suspend(SuspendKind::Unlock, "editing")
            .unwrap();
        let guard = TransactionGuard::new(sandbox.context.clone());

        assert!(matches!(
            guard.pre_transaction().unwrap_err(),
            GuardError::MaintenanceBusy(_)
        ));
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
    }

    #[test]
    fn refused_while_the_maintenance_lock_is_held() {
        let sandbox = protected_sandbox();
        let _held = sandbox.context.maintenance_lock().unwrap();
        let guard = TransactionGuard::new(sandbox.context.clone());
        assert!(matches!(
            guard.begin().err(),
            Some(GuardError::MaintenanceBusy(_))
        ));
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
    }
}
