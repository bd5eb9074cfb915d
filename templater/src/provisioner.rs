use anyhow::{Result, bail};
use std::{error::Error, fmt::Display, path::Path};
use tracing::{error, info, warn};

use crate::{
    config::RuntimeConfig,
    hypervisor::{HostCommand, Hypervisor},
};

/// Whether a failed step ends the build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPolicy {
    Fatal,

    /// The failure is logged and the sequence continues
    Tolerated,
}

/// One hypervisor command in the template build sequence.
#[derive(Clone, Debug)]
pub struct Step {
    pub name: &'static str,
    pub command: HostCommand,
    pub policy: StepPolicy,
}

impl Step {
    fn fatal(name: &'static str, command: HostCommand) -> Self {
        Self {
            name,
            command,
            policy: StepPolicy::Fatal,
        }
    }
}

/// A step that could not be completed.
#[derive(Debug)]
pub struct StepError {
    pub step: &'static str,
    pub command: String,
    pub diagnostic: String,
}

impl Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step '{}' failed ({}): {}",
            self.step, self.command, self.diagnostic
        )
    }
}

impl Error for StepError {}

/// Turns a downloaded cloud image into a template.
pub struct Provisioner<'a, H: Hypervisor> {
    hypervisor: &'a H,
    config: &'a RuntimeConfig,
}

impl<'a, H: Hypervisor> Provisioner<'a, H> {
    pub fn new(hypervisor: &'a H, config: &'a RuntimeConfig) -> Self {
        Self { hypervisor, config }
    }

    /// The ordered command sequence for one template.
    pub fn plan(&self, vm_id: u32, vm_name: &str, image_path: &Path) -> Result<Vec<Step>> {
        let image_path = std::path::absolute(image_path)?;
        let storage = &self.config.storage;

        let mut steps = vec![
            Step::fatal(
                "create",
                HostCommand::qm([
                    "create".to_string(),
                    vm_id.to_string(),
                    "--name".to_string(),
                    vm_name.to_string(),
                    "--ostype".to_string(),
                    "l26".to_string(),
                ]),
            ),
            Step::fatal(
                "network",
                HostCommand::qm_set(
                    vm_id,
                    &[("net0", format!("virtio,bridge={}", self.config.bridge))],
                ),
            ),
            Step::fatal(
                "console",
                HostCommand::qm_set(
                    vm_id,
                    &[("serial0", "socket".to_string()), ("vga", "serial0".to_string())],
                ),
            ),
            Step::fatal(
                "hardware",
                HostCommand::qm_set(
                    vm_id,
                    &[
                        ("memory", self.config.memory.to_string()),
                        ("cores", self.config.cores.to_string()),
                        ("cpu", "host".to_string()),
                    ],
                ),
            ),
            Step::fatal(
                "import-disk",
                HostCommand::qm_set(
                    vm_id,
                    &[(
                        "scsi0",
                        format!(
                            "{storage}:0,import-from={},discard=on",
                            image_path.display()
                        ),
                    )],
                ),
            ),
            Step::fatal(
                "boot",
                HostCommand::qm_set(
                    vm_id,
                    &[
                        ("boot", "order=scsi0".to_string()),
                        ("scsihw", "virtio-scsi-single".to_string()),
                    ],
                ),
            ),
            Step::fatal(
                "agent",
                HostCommand::qm_set(
                    vm_id,
                    &[("agent", "enabled=1,fstrim_cloned_disks=1".to_string())],
                ),
            ),
            Step::fatal(
                "cloud-init-drive",
                HostCommand::qm_set(vm_id, &[("ide2", format!("{storage}:cloudinit"))]),
            ),
            Step::fatal(
                "ip-config",
                HostCommand::qm_set(vm_id, &[("ipconfig0", "ip6=auto,ip=dhcp".to_string())]),
            ),
        ];

        if self.config.ssh_keyfile.is_file() {
            steps.push(Step::fatal(
                "ssh-keys",
                HostCommand::qm_set(
                    vm_id,
                    &[(
                        "sshkeys",
                        self.config.ssh_keyfile.to_string_lossy().to_string(),
                    )],
                ),
            ));
        } else {
            warn!(
                path = %self.config.ssh_keyfile.display(),
                "SSH keyfile not found, template will have no authorized key"
            );
        }

        steps.push(Step::fatal(
            "username",
            HostCommand::qm_set(vm_id, &[("ciuser", self.config.username.clone())]),
        ));

        // Images that already exceed the target size make qm refuse to shrink
        steps.push(Step {
            name: "resize-disk",
            command: HostCommand::qm([
                "disk".to_string(),
                "resize".to_string(),
                vm_id.to_string(),
                "scsi0".to_string(),
                self.config.disk_size.clone(),
            ]),
            policy: StepPolicy::Tolerated,
        });

        steps.push(Step::fatal(
            "template",
            HostCommand::qm(["template".to_string(), vm_id.to_string()]),
        ));

        Ok(steps)
    }

    /// Run the full sequence and remove the image afterwards. The first
    /// fatal failure stops the build; nothing already applied is undone
    /// unless `destroy_on_failure` is set.
    pub fn build(&self, vm_id: u32, vm_name: &str, image_path: &Path) -> Result<()> {
        if !image_path.is_file() {
            bail!("Image file {} not found", image_path.display());
        }

        info!(vm_id, vm_name, "Creating template");
        let steps = self.plan(vm_id, vm_name, image_path)?;

        for (index, step) in steps.iter().enumerate() {
            match self.execute(step) {
                Ok(()) => {}
                Err(err) if step.policy == StepPolicy::Tolerated => {
                    info!(step = step.name, error = %err, "Step failed, continuing");
                }
                Err(err) => {
                    error!(step = step.name, error = %err, "Step failed");

                    // The VM exists once the first step went through
                    if index > 0 && self.config.destroy_on_failure {
                        self.destroy(vm_id);
                    }
                    return Err(err.into());
                }
            }
        }

        info!(path = %image_path.display(), "Removing downloaded image");
        if let Err(err) = std::fs::remove_file(image_path) {
            warn!(path = %image_path.display(), error = %err, "Failed to remove downloaded image");
        }

        info!(vm_id, vm_name, "Successfully created template");
        Ok(())
    }

    /// Whether the host already has a VM or template with this id.
    pub fn vm_exists(&self, vm_id: u32) -> Result<bool> {
        let output = self
            .hypervisor
            .run(&HostCommand::qm(["status".to_string(), vm_id.to_string()]))?;
        Ok(output.success)
    }

    fn execute(&self, step: &Step) -> Result<(), StepError> {
        info!(step = step.name, "Running step");

        match self.hypervisor.run(&step.command) {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(StepError {
                step: step.name,
                command: step.command.to_string(),
                diagnostic: output.diagnostic(),
            }),
            Err(err) => Err(StepError {
                step: step.name,
                command: step.command.to_string(),
                diagnostic: format!("{err:#}"),
            }),
        }
    }

    /// Best-effort removal of a partially configured VM.
    fn destroy(&self, vm_id: u32) {
        warn!(vm_id, "Destroying partially configured VM");

        let command = HostCommand::qm(["destroy".to_string(), vm_id.to_string(), "--purge".to_string()]);
        match self.hypervisor.run(&command) {
            Ok(output) if output.success => info!(vm_id, "Destroyed partially configured VM"),
            Ok(output) => error!(vm_id, error = %output.diagnostic(), "Failed to destroy VM, manual cleanup required"),
            Err(err) => error!(vm_id, error = ?err, "Failed to destroy VM, manual cleanup required"),
        }
    }
}
