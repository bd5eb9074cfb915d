use anyhow::{Context, Result, anyhow, bail};
use std::{error::Error, fmt::Display, path::PathBuf};
use tracing::{Span, debug, error, info, info_span, warn};
use validator::Validate;

use crate::{
    catalog::{Catalog, CatalogEntry},
    config::RuntimeConfig,
    fetch::Fetch,
    hypervisor::{HostCommand, Hypervisor},
    provisioner::Provisioner,
};

/// The requested image is not in the catalog.
#[derive(Debug)]
pub struct UnknownImage {
    pub name: String,
    pub available: Vec<String>,
}

impl Display for UnknownImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Unknown image: {} (available images: {})",
            self.name,
            self.available.join(", ")
        )
    }
}

impl Error for UnknownImage {}

/// Outcome of processing every catalog entry.
#[derive(Debug, Default)]
pub struct Summary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Check that the host can build templates at all. A missing SSH key and
/// duplicate VM ids are only warnings.
pub fn validate_environment<H: Hypervisor>(
    hypervisor: &H,
    config: &RuntimeConfig,
    catalog: &Catalog,
) -> Result<()> {
    let output = hypervisor
        .run(&HostCommand::qm(["version"]))
        .context("Proxmox VE qm command not found. Are you running this on a Proxmox host?")?;
    debug!(version = output.stdout.trim(), "Found qm");

    if !config.ssh_keyfile.is_file() {
        warn!(path = %config.ssh_keyfile.display(), "SSH keyfile not found");
    }

    for (vm_id, names) in catalog.duplicate_vm_ids() {
        warn!(vm_id, images = ?names, "VM id is used by more than one image");
    }

    let storage = &config.storage;
    let output = hypervisor
        .run(&HostCommand::pvesm(["status", "--storage", storage.as_str()]))
        .context("Failed to query storage status")?;
    if !output.success {
        bail!(
            "Storage {} not found or not accessible: {}",
            storage,
            output.diagnostic()
        );
    }

    info!("Environment validation passed");
    Ok(())
}

/// Drives downloads and template builds for a catalog. All output of one
/// orchestrator is grouped under a single run span.
pub struct Orchestrator<H: Hypervisor, F: Fetch> {
    catalog: Catalog,
    config: RuntimeConfig,
    hypervisor: H,
    fetcher: F,

    /// Where images are downloaded to
    workdir: PathBuf,

    span: Span,
}

impl<H: Hypervisor, F: Fetch> Orchestrator<H, F> {
    pub fn new(catalog: Catalog, config: RuntimeConfig, hypervisor: H, fetcher: F) -> Self {
        let span = info_span!("run", id = %uuid::Uuid::new_v4());

        Self {
            catalog,
            config,
            hypervisor,
            fetcher,
            workdir: PathBuf::from("."),
            span,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    /// Check that the host can build templates at all, within this run's span.
    pub fn validate_environment(&self) -> Result<()> {
        let _run = self.span.enter();
        validate_environment(&self.hypervisor, &self.config, &self.catalog)
    }

    /// Download and build the template for one catalog entry.
    pub fn process_one(&self, name: &str) -> Result<()> {
        let _run = self.span.enter();

        if let Some(reason) = self.catalog.rejection(name) {
            error!(image = name, reason, "Invalid catalog entry");
            bail!("Invalid catalog entry {name}: {reason}");
        }

        let Some(entry) = self.catalog.get(name) else {
            let available = self.catalog.names();
            error!(image = name, "Unknown image");
            info!("Available images: {}", available.join(", "));
            return Err(UnknownImage {
                name: name.to_string(),
                available,
            }
            .into());
        };

        let result = self.process_entry(name, entry);
        if let Err(err) = &result {
            error!(image = name, error = ?err, "Failed to process image");
        }
        result
    }

    /// Process every entry in turn. A failure never stops the remaining
    /// entries.
    pub fn process_all(&self) -> Summary {
        let _run = self.span.enter();
        let mut summary = Summary::default();

        info!(count = self.catalog.len(), "Processing images");
        for (name, reason) in self.catalog.rejected() {
            error!(image = name.as_str(), reason = reason.as_str(), "Skipping invalid catalog entry");
            summary
                .failed
                .push((name.clone(), anyhow!("Invalid catalog entry {name}: {reason}")));
        }

        for (name, entry) in self.catalog.iter() {
            info!(image = name.as_str(), "Processing image");
            match self.process_entry(name, entry) {
                Ok(()) => {
                    info!(image = name.as_str(), "Successfully processed image");
                    summary.succeeded.push(name.clone());
                }
                Err(err) => {
                    error!(image = name.as_str(), error = ?err, "Failed to process image");
                    summary.failed.push((name.clone(), err));
                }
            }
        }

        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "Processed {} images",
            summary.total()
        );
        summary
    }

    fn process_entry(&self, name: &str, entry: &CatalogEntry) -> Result<()> {
        let span = info_span!("image", name, vm_id = entry.vm_id);
        let _guard = span.enter();

        entry
            .validate()
            .with_context(|| format!("Invalid catalog entry {name}"))?;

        let provisioner = Provisioner::new(&self.hypervisor, &self.config);
        if provisioner
            .vm_exists(entry.vm_id)
            .context("Failed to query VM status")?
        {
            bail!("VM id {} is already in use on this host", entry.vm_id);
        }

        let image_path = self.workdir.join(&entry.filename);
        self.fetcher
            .fetch(&entry.url, &image_path, entry.checksum.as_ref())
            .with_context(|| format!("Failed to download {}", entry.filename))?;

        provisioner
            .build(entry.vm_id, &entry.vm_name, &image_path)
            .with_context(|| format!("Failed to create template {}", entry.vm_name))
    }
}
