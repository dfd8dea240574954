//! User-facing report lines.
//!
//! These are the progress messages a person running `dephy-pi create` reads;
//! diagnostics go through `tracing` instead.

use console::Style;

use crate::progress::{DownloadBar, FlashSpinner};

/// Prints styled status lines to stdout (errors to stderr).
#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    quiet: bool,
}

impl Reporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Start of a stage, e.g. "Finding SD card..."
    pub fn step(&self, message: &str) {
        if !self.quiet {
            println!("{}", Style::new().cyan().bold().apply_to(message));
        }
    }

    /// A labelled detail under the current step
    pub fn detail(&self, label: &str, value: &str) {
        if !self.quiet {
            println!("\t- {} {}", Style::new().yellow().apply_to(label), value);
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.quiet {
            println!("\t- {}", Style::new().yellow().apply_to(message));
        }
    }

    /// Always shown, quiet or not
    pub fn error(&self, message: &str) {
        eprintln!("\t- {}: {}", Style::new().red().bold().apply_to("Error"), message);
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{}", Style::new().green().bold().apply_to(message));
        }
    }

    pub fn download_bar(&self) -> DownloadBar {
        DownloadBar::new(self.quiet)
    }

    pub fn flash_spinner(&self, device: &str) -> FlashSpinner {
        FlashSpinner::new(device, self.quiet)
    }
}
