//! `hostguard-watchdog`: the independently supervised polling loop.
//!
//! Runs under its own systemd unit, outside the units it watches, so
//! disabling "the guard" through systemd does not stop it. Only the control
//! state (flipped through `hostguard control disable`) pauses it.
//!
//! Each tick:
//! 1. read the control state; stop here if DISABLED
//! 2. re-assert the management surface if it reports disabled or removed
//! 3. reconcile, unless a maintenance window owns the resource
//!
//! Failures are logged and the loop moves on to the next tick.

use std::sync::Arc;
use std::time::Duration;

use hostguard_core::audit::AuditEvent;
use hostguard_core::surface::{ManagementSurface, SurfaceState};
use hostguard_core::{ControlState, GuardContext, ReconcileResult, Reconciler};
use tokio::sync::watch;

/// What one tick observed and did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub control: Option<ControlState>,
    pub surface: Option<SurfaceState>,
    pub reasserted: bool,
    pub reconcile: Option<ReconcileResult>,
    pub errors: Vec<String>,
}

pub struct Watchdog {
    ctx: GuardContext,
    surface: Arc<dyn ManagementSurface>,
}

impl Watchdog {
    pub fn new(ctx: GuardContext, surface: Arc<dyn ManagementSurface>) -> Self {
        Self { ctx, surface }
    }

    pub fn poll_interval(&self) -> Duration {
        self.ctx.config().poll_interval()
    }

    /// One pass. Never fails; problems land in [`TickReport::errors`].
    pub fn tick(&self) -> TickReport {
        let control = self.ctx.control().read();
        let mut report = TickReport {
            control: Some(control),
            ..TickReport::default()
        };
        if !control.is_enabled() {
            tracing::debug!("control state DISABLED; idle");
            return report;
        }

        match self.surface.state() {
            Ok(state) => {
                report.surface = Some(state);
                if state != SurfaceState::Enabled {
                    tracing::warn!("management surface {state}; re-asserting");
                    match self.surface.reassert() {
                        Ok(()) => {
                            report.reasserted = true;
                            self.ctx.audit().record(
                                AuditEvent::new("surface_reasserted")
                                    .field("found", state)
                                    .field("units", self.surface.describe()),
                            );
                        }
                        Err(err) => {
                            tracing::error!("re-asserting surface failed: {err}");
                            report.errors.push(err.to_string());
                        }
                    }
                }
            }
            Err(err) => {
                tracing::error!("querying surface failed: {err}");
                report.errors.push(err.to_string());
            }
        }

        match Reconciler::new(&self.ctx).reconcile() {
            Ok(result) => {
                if result.changed {
                    tracing::warn!("watchdog pass: {}", result.reason);
                }
                report.reconcile = Some(result);
            }
            Err(err) => {
                tracing::error!("watchdog reconcile failed: {err}");
                report.errors.push(err.to_string());
            }
        }
        report
    }

    /// Tick every poll interval until `shutdown` turns true. A tick in
    /// progress always completes first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "watchdog polling every {}s",
            self.poll_interval().as_secs()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    if let Err(err) = tokio::task::spawn_blocking(move || this.tick()).await {
                        tracing::error!("watchdog tick panicked: {err}");
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("watchdog stopped");
    }
}
