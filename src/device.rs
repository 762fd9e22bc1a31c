use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::error::Error;

use super::Result;

/// What to do when the destination does not exist yet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Create {
    /// Create a regular file.
    IfMissing,
    /// Fail.
    Never,
}

/// Opens the device or image ranges are read from.
///
/// Block devices are opened with `O_DIRECT`: reads of a dm-era snapshot that
/// go through the page cache can return stale data.
pub fn open_source(path: &Path) -> Result<File> {
    let meta = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    let mut options = OpenOptions::new();
    options.read(true);
    if meta.file_type().is_block_device() {
        #[cfg(target_os = "linux")]
        options.custom_flags(libc::O_DIRECT);
        debug!(path = %path.display(), "source is a block device, bypassing the page cache");
    }
    options
        .open(path)
        .with_context(|| format!("Failed to open {} for reading", path.display()))
}

/// Opens the file or device ranges are written to.
///
/// An existing block device is opened with `O_EXCL`, which the kernel refuses
/// with `EBUSY` while the device is mounted or held open exclusively; that
/// case is reported as [`Error::DeviceBusy`]. Existing files are never
/// truncated.
pub fn open_destination(path: &Path, create: Create) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    let mut block_device = false;
    match fs::metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_block_device() {
                block_device = true;
                options.custom_flags(libc::O_EXCL);
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound && create == Create::IfMissing => {
            debug!(path = %path.display(), "destination does not exist, creating it");
            options.create(true).mode(0o644);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    }
    options.open(path).map_err(|e| {
        if block_device && e.raw_os_error() == Some(libc::EBUSY) {
            Error::DeviceBusy {
                path: path.to_owned(),
                source: e,
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("Failed to open {} for writing", path.display()))
        }
    })
}
