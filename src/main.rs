use std::process::ExitCode;

use clap::Parser;
use dirspool::cli::Cli;

mod tracing_setup;

use tracing_setup::{Verbosity, init_subscriber};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dirspool: {e}");
            ExitCode::FAILURE
        }
    }
}
