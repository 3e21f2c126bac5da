//! ferryd server.
//!
//! This file is the entry point for the load balancer implemented in the
//! library. It parses the command line, loads the config file and hands
//! control to `ferryd::server`, wired to shut down gracefully on SIGTERM or
//! SIGINT.

use clap::{CommandFactory, Parser};
use ferryd::{config, logging, server, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug)]
#[command(name = "ferryd", version, author, about = "A Layer-4 TCP load balancer")]
struct Cli {
    /// Path to the config file (see --help-config for the format).
    config: Option<PathBuf>,
    /// Print the config file reference and exit.
    #[arg(long)]
    help_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    if cli.help_config {
        print!("{}", config::CONFIG_HELP);
        return ExitCode::SUCCESS;
    }

    let Some(path) = cli.config else {
        eprintln!("no config file provided\n");
        eprintln!("{}", Cli::command().render_long_help());
        return ExitCode::FAILURE;
    };

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}\n");
            eprint!("{}", config::CONFIG_HELP);
            return ExitCode::FAILURE;
        }
    };

    server::run(config, shutdown_signal()).await;
    ExitCode::SUCCESS
}

/// Resolves on the first SIGTERM or SIGINT. Neither stream is polled again
/// afterwards, so re-delivering a signal during the drain changes nothing.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
