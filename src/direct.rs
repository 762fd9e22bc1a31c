use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::blocks::{unit_bytes, Extent};
use crate::copy::BlockCopier;
use crate::device::{open_destination, Create};
use crate::progress::Progress;
use crate::Summary;

use super::Result;

/// Copies the listed extents from `source` straight into the existing file or
/// device at `destination`, each to the same offset it was read from.
///
/// This skips the diff stream entirely, for when both devices are attached
/// to the same host. The destination gets the same in-use check as
/// [`apply_to_path`](crate::apply_to_path) but is never created.
pub fn copy_direct(
    blocks: impl IntoIterator<Item = Result<Extent>>,
    source: &File,
    destination: &Path,
    unit_size: u64,
    copier: &mut BlockCopier,
    progress: &mut Progress,
) -> Result<Summary> {
    let unit = unit_bytes(unit_size)?;
    let mut dst = open_destination(destination, Create::Never)?;
    let mut summary = Summary::default();
    for extent in blocks {
        let extent = extent?.to_bytes(unit)?;
        debug!(start = extent.start, length = extent.length, "copying range");
        dst.seek(SeekFrom::Start(extent.start))
            .with_context(|| format!("Failed to seek in output file to {}", extent.start))?;
        copier
            .copy_range(source, extent.start, extent.length, &mut dst, progress)
            .with_context(|| {
                format!(
                    "Failed to copy {} bytes at offset {}",
                    extent.length, extent.start
                )
            })?;
        summary.record(extent.length);
    }
    dst.sync_all()
        .with_context(|| format!("Failed to sync {}", destination.display()))?;
    info!(
        ranges = summary.frames,
        bytes = summary.bytes,
        "ranges copied"
    );
    Ok(summary)
}
