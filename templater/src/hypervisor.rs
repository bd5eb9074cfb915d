//! Access to the host's VM management tools (`qm` and `pvesm`).

use anyhow::{Context, Result};
use std::{fmt::Display, process::Command};
use tracing::debug;

/// A single administrative command to run on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn qm<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("qm", args)
    }

    pub fn pvesm<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("pvesm", args)
    }

    /// `qm set <id> --<option> <value>...`
    pub fn qm_set(vm_id: u32, options: &[(&str, String)]) -> Self {
        let mut args = vec![String::from("set"), vm_id.to_string()];
        for (option, value) in options {
            args.push(format!("--{option}"));
            args.push(value.clone());
        }
        Self::new("qm", args)
    }
}

impl Display for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a completed command reported.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Explains a failure with the exit status and the most useful output,
    /// stderr if there is any.
    pub fn diagnostic(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };

        let stderr = self.stderr.trim();
        let text = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };

        if text.is_empty() {
            status
        } else {
            format!("{status}: {text}")
        }
    }
}

/// The hypervisor is a black box that runs commands. An `Err` means the
/// command could not be started at all; a command that ran and failed is an
/// `Ok` with `success == false`.
pub trait Hypervisor {
    fn run(&self, command: &HostCommand) -> Result<CommandOutput>;
}

/// Runs commands as child processes on the local host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHypervisor;

impl Hypervisor for SystemHypervisor {
    fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        debug!(command = %command, "Executing command");

        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .with_context(|| format!("Failed to execute {}", command.program))?;

        let output = CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.stdout.trim().is_empty() {
            debug!(stdout = output.stdout.trim(), "Command output");
        }
        Ok(output)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use anyhow::bail;
    use std::cell::RefCell;

    /// Records every command and fails the ones matching a prefix.
    #[derive(Default)]
    pub struct FakeHypervisor {
        calls: RefCell<Vec<String>>,
        failing: Vec<String>,
        existing_vms: Vec<u32>,
        unavailable: bool,

        /// Files removed as a side effect of commands matching a prefix
        removals: Vec<(String, std::path::PathBuf)>,
    }

    impl FakeHypervisor {
        pub fn failing_on(mut self, prefix: &str) -> Self {
            self.failing.push(prefix.to_string());
            self
        }

        pub fn with_existing_vm(mut self, vm_id: u32) -> Self {
            self.existing_vms.push(vm_id);
            self
        }

        /// Delete a file when a command matching the prefix runs.
        pub fn removing_on(mut self, prefix: &str, path: impl Into<std::path::PathBuf>) -> Self {
            self.removals.push((prefix.to_string(), path.into()));
            self
        }

        /// Behave as if the tools are not installed.
        pub fn unavailable(mut self) -> Self {
            self.unavailable = true;
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        pub fn called(&self, prefix: &str) -> bool {
            self.calls.borrow().iter().any(|call| call.starts_with(prefix))
        }
    }

    impl Hypervisor for FakeHypervisor {
        fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
            let line = command.to_string();
            self.calls.borrow_mut().push(line.clone());

            if self.unavailable {
                bail!("Failed to execute {}", command.program);
            }

            let success = if line.starts_with("qm status ") {
                command
                    .args
                    .get(1)
                    .and_then(|id| id.parse::<u32>().ok())
                    .is_some_and(|id| self.existing_vms.contains(&id))
            } else {
                !self.failing.iter().any(|prefix| line.starts_with(prefix))
            };

            for (prefix, path) in &self.removals {
                if line.starts_with(prefix.as_str()) {
                    std::fs::remove_file(path)?;
                }
            }

            Ok(CommandOutput {
                success,
                code: Some(if success { 0 } else { 255 }),
                stdout: String::new(),
                stderr: if success {
                    String::new()
                } else {
                    format!("simulated failure: {line}")
                },
            })
        }
    }
}
