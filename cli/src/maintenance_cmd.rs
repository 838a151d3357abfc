//! Legitimate maintenance windows: package-manager hooks, wrapped commands,
//! and the unlock workflow.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hostguard_core::GuardError;
use hostguard_core::transaction::TransactionGuard;
use hostguard_core::unlock::{
    CommandEditor, ThreadSleeper, UnlockOutcome, UnlockPhase, UnlockWorkflow,
};

use crate::{Cli, ensure_root};

#[derive(Debug, Parser)]
pub struct HookCli {
    #[command(subcommand)]
    pub command: HookSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum HookSubcommand {
    /// Lift protections before a package transaction.
    PreTransaction,
    /// Reconcile and restore protections after a package transaction.
    PostTransaction,
}

#[derive(Debug, Parser)]
pub struct TransactionArgs {
    /// Command to run, after `--`.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct UnlockArgs {
    /// Why the canonical content needs to change. Recorded in the audit log.
    #[arg(long = "reason", short = 'r')]
    pub reason: String,

    /// Editor command, overriding configuration and $VISUAL/$EDITOR.
    #[arg(long = "editor")]
    pub editor: Option<String>,
}

pub fn run_hook(cli: &Cli, hook: &HookCli) -> anyhow::Result<ExitCode> {
    ensure_root("hook")?;
    let guard = TransactionGuard::new(cli.context()?);
    match hook.command {
        HookSubcommand::PreTransaction => {
            guard.pre_transaction()?;
            println!("hostguard: protections lifted for the transaction");
        }
        HookSubcommand::PostTransaction => {
            let result = guard.post_transaction()?;
            println!("hostguard: protections restored ({})", result.reason);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Exit with the wrapped command's status.
pub fn run_transaction(cli: &Cli, args: &TransactionArgs) -> anyhow::Result<ExitCode> {
    ensure_root("transaction")?;
    let Some((program, rest)) = args.command.split_first() else {
        anyhow::bail!("no command given");
    };
    let guard = TransactionGuard::new(cli.context()?);
    let status = guard.run_wrapped(program, rest)?;
    if status.success() {
        return Ok(ExitCode::SUCCESS);
    }
    tracing::warn!("{program} exited with {status}");
    let code = status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1);
    Ok(ExitCode::from(code))
}

pub fn run_unlock(cli: &Cli, args: &UnlockArgs) -> anyhow::Result<ExitCode> {
    if args.reason.trim().is_empty() {
        return Err(GuardError::EmptyReason.into());
    }
    ensure_root("unlock")?;

    let ctx = cli.context()?;
    let editor = CommandEditor::resolve(
        args.editor
            .as_deref()
            .or(ctx.config().unlock.editor.as_deref()),
    );
    let cooldown = ctx.config().unlock.cooldown_secs;
    let editor_command = editor.command().to_string();
    let workflow = UnlockWorkflow::new(&ctx, &editor, &ThreadSleeper).on_phase(move |phase| {
        match phase {
            UnlockPhase::Cooldown if cooldown > 0 => {
                eprintln!("[{phase}] waiting {cooldown}s before the file opens");
            }
            UnlockPhase::Editing => eprintln!("[{phase}] opening {editor_command}"),
            _ => eprintln!("[{phase}]"),
        }
    });
    let session = workflow.run(&args.reason)?;

    println!("session:  {}", session.session_id);
    println!("outcome:  {}", UnlockPhase::from(session.outcome));
    println!("before:   {}", session.hash_before);
    println!("after:    {}", session.hash_after);
    if session.outcome == UnlockOutcome::Updated {
        println!("canonical content updated; protections re-applied");
    }
    Ok(ExitCode::SUCCESS)
}
