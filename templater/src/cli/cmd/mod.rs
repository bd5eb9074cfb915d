use std::path::{Path, PathBuf};

use crate::{catalog::Catalog, config::RuntimeConfig};

pub mod build;
pub mod list;
pub mod validate;

/// Options shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Config override file (JSON, TOML, YAML or RON)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// The image catalog
    #[clap(long, global = true, default_value = "templates.json")]
    pub catalog: PathBuf,

    /// Also write the log to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,
}

impl GlobalArgs {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::load(self.config.as_deref())
    }

    pub fn load_catalog(&self) -> Catalog {
        Catalog::load(&self.catalog)
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Commands {
    /// List available images
    List {},

    /// Validate the environment without creating templates
    Validate {},

    /// Download images and create templates
    Build {
        /// The catalog name of the image to build
        #[clap(index = 1, required_unless_present = "all")]
        image: Option<String>,

        /// Create templates for all available images
        #[clap(long, num_args = 0, conflicts_with = "image")]
        all: bool,

        /// Directory for downloaded images
        #[clap(long, default_value = ".")]
        workdir: PathBuf,

        /// Destroy a partially configured VM when a step fails
        #[clap(long, num_args = 0)]
        destroy_on_failure: bool,
    },
}
