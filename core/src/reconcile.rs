//! The Reconciler: restore the live resource from the canonical snapshot
//! and re-assert protections.
//!
//! `reconcile` takes no lock. The watcher, the timer, the watchdog and the
//! transaction hooks may all call it at once; each step is idempotent so
//! every interleaving converges on the same state.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::audit::AuditEvent;
use crate::context::GuardContext;
use crate::error::Result;
use crate::fsutil;
use crate::suspend::SuspendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileReason {
    /// A policy file or the integrity record was tampered with; the
    /// resource itself matched.
    PolicyTamper,
    DriftRestored,
    InSync,
    /// No canonical snapshot yet.
    NotInitialized,
    ControlDisabled,
    /// A maintenance window owns the resource.
    Suspended,
}

impl ReconcileReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileReason::PolicyTamper => "policy_tamper",
            ReconcileReason::DriftRestored => "drift_restored",
            ReconcileReason::InSync => "in_sync",
            ReconcileReason::NotInitialized => "not_initialized",
            ReconcileReason::ControlDisabled => "control_disabled",
            ReconcileReason::Suspended => "suspended",
        }
    }
}

impl fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub changed: bool,
    pub reason: ReconcileReason,
    pub policy_restored: Vec<PathBuf>,
    /// Protections had to be put back even though content may have matched.
    pub protections_reapplied: bool,
}

impl ReconcileResult {
    fn skipped(reason: ReconcileReason) -> Self {
        Self {
            changed: false,
            reason,
            policy_restored: Vec::new(),
            protections_reapplied: false,
        }
    }
}

pub struct Reconciler<'a> {
    ctx: &'a GuardContext,
    owner: Option<SuspendKind>,
}

impl<'a> Reconciler<'a> {
    pub fn new(ctx: &'a GuardContext) -> Self {
        Self { ctx, owner: None }
    }

    /// Reconcile on behalf of the maintenance window `owner`, so its own
    /// marker does not suspend the pass.
    pub fn on_behalf_of(ctx: &'a GuardContext, owner: SuspendKind) -> Self {
        Self {
            ctx,
            owner: Some(owner),
        }
    }

    pub fn reconcile(&self) -> Result<ReconcileResult> {
        let ctx = self.ctx;

        if !ctx.control().read().is_enabled() {
            tracing::debug!("control state DISABLED; skipping reconciliation");
            return Ok(ReconcileResult::skipped(ReconcileReason::ControlDisabled));
        }
        if let Some(marker) = ctx.suspensions().blocking(self.owner) {
            tracing::debug!("{} in progress (pid {}); skipping", marker.kind, marker.pid);
            return Ok(ReconcileResult::skipped(ReconcileReason::Suspended));
        }

        let report = ctx.integrity().verify_and_restore(ctx.protection());
        for path in &report.restored {
            ctx.audit().record(
                AuditEvent::new("policy_tamper")
                    .field("path", path.display())
                    .field("action", "restored"),
            );
        }
        for err in &report.unrecoverable {
            ctx.audit().record(AuditEvent::new("policy_tamper").field("error", err));
        }
        let mut reason = if report.tampered() {
            ReconcileReason::PolicyTamper
        } else {
            ReconcileReason::InSync
        };
        let mut changed = !report.restored.is_empty();

        let Some(loaded) = ctx.canonical().load()? else {
            tracing::info!(
                "no canonical snapshot under {}; nothing to enforce",
                ctx.layout().canonical_dir().display()
            );
            return Ok(ReconcileResult {
                changed,
                reason: if report.tampered() {
                    reason
                } else {
                    ReconcileReason::NotInitialized
                },
                policy_restored: report.restored,
                protections_reapplied: false,
            });
        };
        if !loaded.digest_matches {
            tracing::warn!("canonical digest file disagrees with canonical content");
            ctx.audit().record(
                AuditEvent::new("canonical_digest_mismatch")
                    .field("path", ctx.canonical().digest_path().display()),
            );
        }
        let canonical = loaded.snapshot;

        let path = ctx.resource_path();
        let live = fsutil::read_optional(path)?;
        if live.as_deref() != Some(canonical.content_bytes.as_slice()) {
            // Writes go through the open inode; a mounted read-only layer
            // would refuse them, so protections come off first.
            ctx.release()?;
            fsutil::write_in_place(path, &canonical.content_bytes)?;
            tracing::warn!("restored {} from canonical snapshot", path.display());
            ctx.audit().record(
                AuditEvent::new("drift_restored")
                    .field("path", path.display())
                    .field("found", live.as_deref().map_or(0, <[u8]>::len))
                    .field("sha256", &canonical.content_hash),
            );
            changed = true;
            reason = ReconcileReason::DriftRestored;
        }

        let enforcement = ctx.enforce()?;
        if enforcement.reapplied && reason == ReconcileReason::InSync {
            ctx.audit().record(
                AuditEvent::new("protections_reapplied")
                    .field("path", path.display())
                    .field("layers_removed", enforcement.layers_removed),
            );
        }

        Ok(ReconcileResult {
            changed,
            reason,
            policy_restored: report.restored,
            protections_reapplied: enforcement.reapplied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlState;
    use crate::protection::ProtectionBackend;
    use crate::testing::Sandbox;
    use pretty_assertions::assert_eq;

    const CANONICAL: &[u8] = b"0.0.0.0 example.com\n";

    #[test]
    fn empty_overwrite_is_restored() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox.tamper(b"");

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert!(result.changed);
        assert_eq!(result.reason, ReconcileReason::DriftRestored);
        assert_eq!(result.reason.to_string(), "drift_restored");
        assert_eq!(sandbox.live(), CANONICAL);
    }

    #[test]
    fn any_modification_is_restored() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        let reconciler = Reconciler::new(&sandbox.context);

        for tampered in [
            b"".as_slice(),
            b"0.0.0.0 example.com".as_slice(),
            b"127.0.0.1 localhost\n".as_slice(),
            b"0.0.0.0 example.com\n\n".as_slice(),
            &[0xff, 0x00, 0x10],
        ] {
            sandbox.tamper(tampered);
            let result = reconciler.reconcile().unwrap();
            assert!(result.changed);
            assert_eq!(sandbox.live(), CANONICAL);
        }
    }

    #[test]
    fn deleted_resource_is_recreated() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        std::fs::remove_file(sandbox.resource()).unwrap();

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(result.reason, ReconcileReason::DriftRestored);
        assert_eq!(sandbox.live(), CANONICAL);
    }

    #[test]
    fn repeated_calls_converge() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox.tamper(b"junk\n");
        let reconciler = Reconciler::new(&sandbox.context);

        let first = reconciler.reconcile().unwrap();
        let after_first = (
            sandbox.live(),
            sandbox.protection.is_locked(sandbox.resource()),
            sandbox.mounts.count(sandbox.resource()),
        );
        assert!(first.changed);

        for _ in 0..5 {
            let next = reconciler.reconcile().unwrap();
            assert!(!next.changed);
            assert_eq!(next.reason, ReconcileReason::InSync);
            assert!(!next.protections_reapplied);
            assert_eq!(
                (
                    sandbox.live(),
                    sandbox.protection.is_locked(sandbox.resource()),
                    sandbox.mounts.count(sandbox.resource()),
                ),
                after_first
            );
        }
    }

    #[test]
    fn in_sync_still_reasserts_protections() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert!(!result.changed);
        assert_eq!(result.reason, ReconcileReason::InSync);
        assert!(result.protections_reapplied);
        assert!(sandbox.protection.is_locked(sandbox.resource()));
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
    }

    #[test]
    fn missing_snapshot_is_not_fabricated() {
        let sandbox = Sandbox::new();
        sandbox.tamper(b"whatever\n");

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(result.reason, ReconcileReason::NotInitialized);
        assert!(!result.changed);
        assert!(!sandbox.context.canonical().exists());
        assert_eq!(sandbox.live(), b"whatever\n");
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 0);
    }

    #[test]
    fn disabled_control_state_skips_everything() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox.context.control().write(ControlState::Disabled).unwrap();
        sandbox.tamper(b"");

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(result.reason, ReconcileReason::ControlDisabled);
        assert_eq!(sandbox.live(), b"");
    }

    #[test]
    fn suspension_pauses_all_but_its_owner() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox
            .context
            .suspensions()
            .suspend(SuspendKind::Transaction, "test")
            .unwrap();
        sandbox.tamper(b"");

        let skipped = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(skipped.reason, ReconcileReason::Suspended);
        assert_eq!(sandbox.live(), b"");

        let owned = Reconciler::on_behalf_of(&sandbox.context, SuspendKind::Transaction)
            .reconcile()
            .unwrap();
        assert_eq!(owned.reason, ReconcileReason::DriftRestored);
        assert_eq!(sandbox.live(), CANONICAL);
    }

    #[test]
    fn policy_tamper_is_reported() {
        let sandbox = Sandbox::new();
        let policy = sandbox.dir.path().join("keywords.txt");
        std::fs::write(&policy, "casino\n").unwrap();
        sandbox
            .context
            .integrity()
            .record(std::slice::from_ref(&policy))
            .unwrap();
        sandbox.install(CANONICAL);
        std::fs::write(&policy, "").unwrap();

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(result.reason, ReconcileReason::PolicyTamper);
        assert!(result.changed);
        assert_eq!(result.policy_restored, vec![policy.clone()]);
        assert_eq!(std::fs::read_to_string(&policy).unwrap(), "casino\n");

        let audit = sandbox.context.audit().tail(10).unwrap();
        assert!(audit.iter().any(|line| line.contains("policy_tamper")));
    }

    #[test]
    fn corrupt_integrity_record_still_enforces() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox.context.enforce().unwrap();
        sandbox.context.release().unwrap();
        std::fs::write(sandbox.context.layout().integrity_path(), b"garbage").unwrap();
        sandbox.tamper(b"");

        let result = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(result.reason, ReconcileReason::DriftRestored);
        assert_eq!(sandbox.live(), CANONICAL);
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
        assert!(sandbox.protection.is_locked(sandbox.resource()));

        let audit = sandbox.context.audit().tail(10).unwrap();
        assert!(audit.iter().any(|line| line.contains("policy_tamper")));

        let again = Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(again.reason, ReconcileReason::PolicyTamper);
        assert!(!again.changed);
    }

    #[test]
    fn restore_is_audited() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        sandbox.tamper(b"");
        Reconciler::new(&sandbox.context).reconcile().unwrap();

        let audit = sandbox.context.audit().tail(10).unwrap();
        assert!(audit.iter().any(|line| line.contains(" drift_restored ")));
    }

    #[test]
    fn tampered_digest_file_does_not_change_enforced_bytes() {
        let sandbox = Sandbox::new();
        sandbox.install(CANONICAL);
        std::fs::write(sandbox.context.canonical().digest_path(), "0000\n").unwrap();
        sandbox.tamper(b"");

        Reconciler::new(&sandbox.context).reconcile().unwrap();
        assert_eq!(sandbox.live(), CANONICAL);
        let audit = sandbox.context.audit().tail(10).unwrap();
        assert!(audit.iter().any(|line| line.contains("canonical_digest_mismatch")));
    }
}
