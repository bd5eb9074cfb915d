use clap::Parser;
use std::{fs::OpenOptions, path::Path, process::ExitCode, sync::Mutex};
use templater::{
    built_info,
    cli::cmd::{Commands, GlobalArgs},
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLine {
    #[clap(flatten)]
    global: GlobalArgs,

    #[clap(subcommand)]
    command: Commands,
}

/// Log to stdout and optionally append to a file as well.
fn init_logging(log_file: Option<&Path>) -> std::io::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

pub fn main() -> ExitCode {
    let command_line = CommandLine::parse();

    if let Err(err) = init_logging(command_line.global.log_file()) {
        eprintln!("Failed to open log file: {err}");
        return ExitCode::FAILURE;
    }

    debug!(
        version = built_info::PKG_VERSION,
        target = built_info::TARGET,
        "Starting templater"
    );

    // Dispatch command
    let global = &command_line.global;
    match &command_line.command {
        Commands::List { .. } => templater::cli::cmd::list::run(command_line.command, global),
        Commands::Validate { .. } => {
            templater::cli::cmd::validate::run(command_line.command, global)
        }
        Commands::Build { .. } => templater::cli::cmd::build::run(command_line.command, global),
    }
}
