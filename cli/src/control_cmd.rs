//! `hostguard control`: the out-of-band switch every enforcement path
//! consults before acting.
//!
//! Disabling is deliberately slow: a non-empty reason, a cooldown, then the
//! configured confirmation phrase typed on stdin. Enabling is immediate.
//! Every flip is audited.

use std::io::{BufRead, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hostguard_core::audit::AuditEvent;
use hostguard_core::{ControlState, GuardContext, GuardError};

use crate::{Cli, print_json};

#[derive(Debug, Parser)]
pub struct ControlCli {
    #[command(subcommand)]
    pub command: ControlSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ControlSubcommand {
    /// Print the current control state.
    Show(ShowArgs),
    /// Resume enforcement.
    Enable(EnableArgs),
    /// Pause all enforcement after a cooldown and confirmation.
    Disable(DisableArgs),
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct EnableArgs {
    /// Optional note for the audit log.
    #[arg(long = "reason", short = 'r')]
    pub reason: Option<String>,
}

#[derive(Debug, Parser)]
pub struct DisableArgs {
    /// Why enforcement is being paused.
    #[arg(long = "reason", short = 'r')]
    pub reason: String,
}

pub fn run_control(cli: &Cli, control: &ControlCli) -> anyhow::Result<ExitCode> {
    let ctx = cli.context()?;
    match &control.command {
        ControlSubcommand::Show(args) => show(&ctx, args),
        ControlSubcommand::Enable(args) => enable(&ctx, args),
        ControlSubcommand::Disable(args) => {
            let stdin = std::io::stdin();
            disable(&ctx, args, &mut stdin.lock())
        }
    }
}

fn show(ctx: &GuardContext, args: &ShowArgs) -> anyhow::Result<ExitCode> {
    let state = ctx.control().read();
    if args.json {
        print_json(&serde_json::json!({
            "state": state,
            "path": ctx.control().path(),
        }))?;
    } else {
        println!("{state}");
    }
    Ok(ExitCode::SUCCESS)
}

fn enable(ctx: &GuardContext, args: &EnableArgs) -> anyhow::Result<ExitCode> {
    let previous = ctx.control().read();
    ctx.control().write(ControlState::Enabled)?;
    let mut event = AuditEvent::new("control_changed")
        .field("from", previous)
        .field("to", ControlState::Enabled);
    if let Some(reason) = args.reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        event = event.reason(reason);
    }
    ctx.audit().record(event);
    println!("{}", ControlState::Enabled);
    Ok(ExitCode::SUCCESS)
}

/// `input` supplies the confirmation line.
pub fn disable(
    ctx: &GuardContext,
    args: &DisableArgs,
    input: &mut dyn BufRead,
) -> anyhow::Result<ExitCode> {
    let reason = args.reason.trim();
    if reason.is_empty() {
        return Err(GuardError::EmptyReason.into());
    }
    let previous = ctx.control().read();
    if !previous.is_enabled() {
        println!("{previous}");
        return Ok(ExitCode::SUCCESS);
    }

    ctx.audit().record(AuditEvent::new("control_disable_requested").reason(reason));
    let cooldown = ctx.config().control_cooldown();
    if !cooldown.is_zero() {
        eprintln!(
            "enforcement stays on for another {}s; take the time to reconsider",
            cooldown.as_secs()
        );
        std::thread::sleep(cooldown);
    }

    let phrase = &ctx.config().control.confirmation;
    eprint!("type \"{phrase}\" to disable protection: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    if line.trim() != phrase.trim() {
        ctx.audit().record(AuditEvent::new("control_disable_refused").reason(reason));
        anyhow::bail!("confirmation phrase did not match; control state unchanged");
    }

    ctx.control().write(ControlState::Disabled)?;
    ctx.audit().record(
        AuditEvent::new("control_changed")
            .field("from", previous)
            .field("to", ControlState::Disabled)
            .reason(reason),
    );
    println!("{}", ControlState::Disabled);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use hostguard_core::testing::Sandbox;
    use pretty_assertions::assert_eq;

    fn disable_with(sandbox: &Sandbox, reason: &str, input: &str) -> anyhow::Result<ExitCode> {
        let args = DisableArgs {
            reason: reason.to_string(),
        };
        disable(&sandbox.context, &args, &mut input.as_bytes())
    }

    #[test]
    fn disable_requires_the_phrase() {
        let sandbox = Sandbox::new();
        let err = disable_with(&sandbox, "new router", "yes\n").unwrap_err();
        assert!(err.to_string().contains("did not match"));
        assert_eq!(sandbox.context.control().read(), ControlState::Enabled);
    }

    #[test]
    fn disable_with_phrase_flips_and_audits() {
        let sandbox = Sandbox::new();
        let phrase = format!("{}\n", sandbox.context.config().control.confirmation);
        disable_with(&sandbox, "moving house", &phrase).unwrap();

        assert_eq!(sandbox.context.control().read(), ControlState::Disabled);
        let audit = sandbox.context.audit().tail(10).unwrap();
        assert!(audit.iter().any(|line| line.contains("control_changed")
            && line.contains("to=DISABLED")
            && line.contains("moving house")));
    }

    #[test]
    fn blank_reason_is_rejected_before_prompting() {
        let sandbox = Sandbox::new();
        let err = disable_with(&sandbox, "  ", "").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GuardError>(),
            Some(GuardError::EmptyReason)
        ));
        assert!(sandbox.context.audit().tail(10).unwrap().is_empty());
    }

    #[test]
    fn enable_is_immediate() {
        let sandbox = Sandbox::new();
        sandbox.context.control().write(ControlState::Disabled).unwrap();
        enable(&sandbox.context, &EnableArgs { reason: None }).unwrap();
        assert_eq!(sandbox.context.control().read(), ControlState::Enabled);
    }
}
