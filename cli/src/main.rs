use std::process::ExitCode;

use clap::Parser;
use hostguard_cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    hostguard_core::logging::init(cli.verbose);

    match cli.run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("hostguard: {err:#}");
            ExitCode::FAILURE
        }
    }
}
