use std::process::ExitCode;
use tracing::{error, info};

use super::GlobalArgs;
use crate::{fetch::HttpFetcher, hypervisor::SystemHypervisor, orchestrator::Orchestrator};

pub fn run(cmd: super::Commands, global: &GlobalArgs) -> ExitCode {
    match cmd {
        super::Commands::Build {
            image,
            all,
            workdir,
            destroy_on_failure,
        } => {
            let mut config = global.runtime_config();
            if destroy_on_failure {
                config.destroy_on_failure = true;
            }

            let fetcher = match HttpFetcher::new() {
                Ok(fetcher) => fetcher,
                Err(err) => {
                    error!(error = ?err, "Failed to create HTTP client");
                    return ExitCode::FAILURE;
                }
            };

            let orchestrator =
                Orchestrator::new(global.load_catalog(), config, SystemHypervisor, fetcher)
                    .with_workdir(workdir);

            // Nothing is provisioned on a host that fails validation
            if let Err(err) = orchestrator.validate_environment() {
                error!(error = ?err, "Environment validation failed. Please check the errors above.");
                return ExitCode::FAILURE;
            }

            if all {
                let summary = orchestrator.process_all();
                if summary.is_success() {
                    info!(count = summary.total(), "All templates created");
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            } else if let Some(image) = image {
                match orchestrator.process_one(&image) {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(_) => ExitCode::FAILURE,
                }
            } else {
                error!("No image specified");
                ExitCode::FAILURE
            }
        }
        _ => unreachable!("build::run requires Commands::Build"),
    }
}
