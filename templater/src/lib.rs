pub mod catalog;
pub mod cli;
pub mod config;
pub mod document;
pub mod fetch;
pub mod hypervisor;
pub mod orchestrator;
pub mod provisioner;

/// Build info
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
