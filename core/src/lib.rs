//! Root of the `hostguard-core` library.
//!
//! Keeps one administrator-approved configuration file (canonically
//! `/etc/hosts`) converged to its canonical snapshot, layering an
//! immutability attribute and a read-only bind mount over it, and provides
//! the maintenance paths (package transactions, supervised unlock sessions)
//! that are allowed to change it.

// Library code reports through tracing; user-facing output lives in the
// binaries.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod audit;
pub mod canonical;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
mod fsutil;
pub mod install;
pub mod integrity;
pub mod logging;
pub mod mount;
pub mod protection;
pub mod reconcile;
pub mod surface;
pub mod suspend;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transaction;
pub mod unlock;
pub mod watcher;

pub use context::GuardContext;
pub use control::ControlState;
pub use error::{GuardError, Result};
pub use reconcile::{ReconcileReason, ReconcileResult, Reconciler};

/// Upper bound on unmount attempts when collapsing stacked layers.
pub const DEFAULT_COLLAPSE_ATTEMPTS: u32 = 20;

/// Returns true when the current process runs with an effective uid of 0.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
