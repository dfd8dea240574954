//! Progress display for the download and the flash.

use indicatif::{ProgressBar, ProgressStyle};

use crate::fetch::FetchProgress;

/// Byte-accurate bar for the image download
pub struct DownloadBar {
    bar: ProgressBar,
}

impl DownloadBar {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }

    pub fn observe(&self, event: FetchProgress) {
        match event {
            FetchProgress::Started { total } => self.bar.set_length(total),
            FetchProgress::Advanced(bytes) => self.bar.inc(bytes),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

/// Indeterminate spinner while `dd` runs; `dd` exposes no byte progress
pub struct FlashSpinner {
    bar: ProgressBar,
}

impl FlashSpinner {
    pub fn new(device: &str, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner} Flashing {msg} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
        );
        bar.set_message(device.to_string());
        Self { bar }
    }

    pub fn tick(&self) {
        self.bar.tick();
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_bar_tracks_bytes() {
        let bar = DownloadBar::new(true);
        bar.observe(FetchProgress::Started { total: 100 });
        bar.observe(FetchProgress::Advanced(40));
        bar.observe(FetchProgress::Advanced(60));
        assert_eq!(bar.position(), 100);
        bar.finish();
    }
}
