use anyhow::Result;
use std::io::IsTerminal;
use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};
use tracing::info;

pub enum ProgressBar {
    /// A hashing operation
    Hash,

    /// A download operation
    Download,
}

impl ProgressBar {
    fn create_progressbar(&self, len: Option<u64>) -> Result<indicatif::ProgressBar> {
        let spinner = match self {
            ProgressBar::Hash => "{spinner:.blue}",
            ProgressBar::Download => "{spinner:.green}",
        };

        let progress = match len {
            Some(len) => {
                let progress = indicatif::ProgressBar::new(len);
                progress.set_style(
                    indicatif::ProgressStyle::default_bar()
                        .template(&format!("{spinner} [{{elapsed_precise}}] [{{wide_bar:.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"))?
                        .progress_chars("=>-"),
                );
                progress
            }
            None => {
                let progress = indicatif::ProgressBar::new_spinner();
                progress.set_style(
                    indicatif::ProgressStyle::default_spinner().template(&format!(
                        "{spinner} [{{elapsed_precise}}] {{bytes}} ({{bytes_per_sec}})"
                    ))?,
                );
                progress
            }
        };
        progress.enable_steady_tick(Duration::from_millis(50));
        Ok(progress)
    }

    /// Fully copy the given reader to the given writer and display a
    /// progressbar if running in interactive mode. Otherwise downloads are
    /// reported in the log every 10%.
    pub fn copy(&self, reader: &mut dyn Read, writer: &mut dyn Write, len: Option<u64>) -> Result<u64> {
        let progress = if show_progress() {
            Some(self.create_progressbar(len)?)
        } else {
            None
        };

        let mut buffer = vec![0u8; 1024 * 1024];
        let mut copied: u64 = 0;
        let mut reported: u64 = 0;

        loop {
            let size = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(size) => size,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    if let Some(progress) = &progress {
                        progress.abandon();
                    }
                    return Err(error.into());
                }
            };
            writer.write_all(&buffer[0..size])?;
            copied += size as u64;

            match (&progress, self, len) {
                (Some(progress), _, _) => progress.set_position(copied),
                (None, ProgressBar::Download, Some(len)) if len > 0 => {
                    let decile = (copied * 10 / len).min(10);
                    if decile > reported {
                        reported = decile;
                        info!(percent = decile * 10, "Download progress");
                    }
                }
                _ => {}
            }
        }

        writer.flush()?;
        if let Some(progress) = progress {
            progress.finish_and_clear();
        }
        Ok(copied)
    }
}

fn show_progress() -> bool {
    std::io::stdout().is_terminal() && std::env::var("CI").is_err()
}
