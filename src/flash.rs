//! Device Writer: raw copy of an image onto the selected drive.
//!
//! The write runs inside a [`NonInterruptible`] section. Callers must release
//! every partition of the drive first (see [`crate::mount::ensure_unmounted`]).

use tracing::{info, warn};

use crate::command::{CommandRunner, DdArgs, RereadPartitionTableArgs};
use crate::disk::RemovableDrive;
use crate::error::{ProvisionError, Result};
use crate::fetch::ImageFile;
use crate::process_guard::NonInterruptible;

pub struct DeviceWriter<'a> {
    runner: &'a dyn CommandRunner,
    block_size: String,
}

impl<'a> DeviceWriter<'a> {
    pub fn new(runner: &'a dyn CommandRunner, block_size: impl Into<String>) -> Self {
        Self {
            runner,
            block_size: block_size.into(),
        }
    }

    /// Copy `image` onto `drive`, overwriting its partition table and data.
    ///
    /// `tick` is called while `dd` is running; progress is liveness only.
    pub fn write(
        &self,
        image: &ImageFile,
        drive: &RemovableDrive,
        tick: &mut dyn FnMut(),
    ) -> Result<()> {
        if drive.size_bytes > 0 && image.size() > drive.size_bytes {
            return Err(ProvisionError::FlashFailed {
                device: drive.device.clone(),
                reason: format!(
                    "image is {} bytes but the device holds only {}",
                    image.size(),
                    drive.size_bytes
                ),
            });
        }

        let args = DdArgs {
            input: image.path().to_path_buf(),
            output: drive.device.clone(),
            block_size: self.block_size.clone(),
        };

        info!(device = %drive.device.display(), bytes = image.size(), "flashing image");
        let output = {
            let _section = NonInterruptible::enter("flash");
            self.runner.run_with_ticker(&args, tick)?
        };

        if !output.success {
            return Err(ProvisionError::FlashFailed {
                device: drive.device.clone(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Ask the kernel to re-read the drive's partition table.
    ///
    /// Returns false (after logging) if `blockdev` failed; the caller then
    /// falls back to the partitions it already knows.
    pub fn reread_partition_table(&self, drive: &RemovableDrive) -> bool {
        let args = RereadPartitionTableArgs {
            device: drive.device.clone(),
        };
        match self
            .runner
            .run(&args, None)
            .and_then(|output| output.ensure_success("blockdev"))
        {
            Ok(_) => true,
            Err(e) => {
                warn!(device = %drive.device.display(), error = %e, "partition table re-read failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandArgs, CommandOutput};
    use crate::fetch::{ImageFetcher, ObjectStore};
    use crate::process_guard;
    use std::cell::RefCell;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Records argv and whether the flash guard was held at the time
    struct DdRunner {
        calls: RefCell<Vec<(Vec<String>, bool)>>,
        output: CommandOutput,
    }

    impl CommandRunner for DdRunner {
        fn run(&self, args: &dyn CommandArgs, _timeout: Option<Duration>) -> Result<CommandOutput> {
            self.calls
                .borrow_mut()
                .push((args.to_cli_args(), process_guard::in_critical_section()));
            Ok(self.output.clone())
        }
    }

    struct OneObject(&'static [u8]);

    impl ObjectStore for OneObject {
        fn content_length(&self, _: &str, _: &str) -> Result<u64> {
            Ok(self.0.len() as u64)
        }

        fn download(
            &self,
            _: &str,
            _: &str,
            sink: &mut dyn Write,
            _: &mut dyn FnMut(u64),
        ) -> Result<u64> {
            sink.write_all(self.0)?;
            Ok(self.0.len() as u64)
        }
    }

    fn image(bytes: &'static [u8]) -> ImageFile {
        let store = OneObject(bytes);
        ImageFetcher::new(&store, None)
            .fetch("bucket", "mypi.iso", &mut |_| {})
            .expect("fetch")
    }

    fn drive(size_bytes: u64) -> RemovableDrive {
        RemovableDrive {
            name: "sdb".to_string(),
            device: PathBuf::from("/dev/sdb"),
            model: None,
            size_bytes,
        }
    }

    #[test]
    fn test_write_runs_dd_inside_critical_section() {
        let runner = DdRunner {
            calls: RefCell::new(Vec::new()),
            output: CommandOutput::ok(""),
        };
        let image = image(b"image bytes");
        let mut ticks = 0;

        DeviceWriter::new(&runner, "32M")
            .write(&image, &drive(1 << 30), &mut || ticks += 1)
            .expect("flash");

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 1);
        let (argv, guarded) = &calls[0];
        assert_eq!(argv[0], format!("if={}", image.path().display()));
        assert_eq!(argv[1], "of=/dev/sdb");
        assert_eq!(argv[2], "bs=32M");
        assert!(*guarded, "dd must run inside the non-interruptible section");
        assert_eq!(ticks, 1);
    }

    #[test]
    fn test_dd_failure_is_flash_failed() {
        let runner = DdRunner {
            calls: RefCell::new(Vec::new()),
            output: CommandOutput::failed(1, "dd: error writing '/dev/sdb': No space left on device\n"),
        };
        let err = DeviceWriter::new(&runner, "32M")
            .write(&image(b"x"), &drive(1 << 30), &mut || {})
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to flash `/dev/sdb`: dd: error writing '/dev/sdb': No space left on device"
        );
    }

    #[test]
    fn test_image_larger_than_device_is_rejected_before_writing() {
        let runner = DdRunner {
            calls: RefCell::new(Vec::new()),
            output: CommandOutput::ok(""),
        };
        let err = DeviceWriter::new(&runner, "32M")
            .write(&image(b"0123456789"), &drive(4), &mut || {})
            .unwrap_err();
        assert!(matches!(err, ProvisionError::FlashFailed { .. }));
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_reread_failure_is_not_fatal() {
        let runner = DdRunner {
            calls: RefCell::new(Vec::new()),
            output: CommandOutput::failed(1, "BLKRRPART: Device or resource busy"),
        };
        assert!(!DeviceWriter::new(&runner, "32M").reread_partition_table(&drive(0)));
        assert_eq!(runner.calls.borrow()[0].0, vec!["--rereadpt", "/dev/sdb"]);
    }
}
