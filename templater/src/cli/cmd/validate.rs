use std::process::ExitCode;
use tracing::error;

use super::GlobalArgs;
use crate::{hypervisor::SystemHypervisor, orchestrator::validate_environment};

pub fn run(cmd: super::Commands, global: &GlobalArgs) -> ExitCode {
    match cmd {
        super::Commands::Validate {} => {
            let catalog = global.load_catalog();
            let config = global.runtime_config();

            match validate_environment(&SystemHypervisor, &config, &catalog) {
                Ok(()) => {
                    println!("Environment validation passed");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(error = ?err, "Environment validation failed");
                    println!("Environment validation failed");
                    ExitCode::FAILURE
                }
            }
        }
        _ => unreachable!("validate::run requires Commands::Validate"),
    }
}
