use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use zerocopy::LayoutVerified;

use anyhow::{anyhow, ensure, Context};
use tracing::{debug, info};

use crate::copy::BlockCopier;
use crate::device::{open_destination, Create};
use crate::error::Error;
use crate::progress::Progress;
use crate::{FrameHeader, Summary, FRAME_HEADER_LEN, SIGNATURE};

use super::Result;

/// Reads the next frame header, or `None` if the stream ends cleanly before it.
fn read_header(stream: &mut impl Read, offset: u64) -> Result<Option<FrameHeader>> {
    let mut buf = [0; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read diff stream"),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    ensure!(
        filled == buf.len(),
        Error::Truncated {
            offset: offset + filled as u64,
            what: "frame header",
            missing: (buf.len() - filled) as u64,
        }
    );
    LayoutVerified::<_, FrameHeader>::new(&buf[..])
        .map(|header| Some(*header))
        .ok_or_else(|| anyhow!("Bytes not aligned"))
}

/// Replays a diff stream onto `dst`, writing every frame's payload at the
/// offset it names, in stream order.
///
/// Nothing past a damaged frame is written. Durability is the caller's
/// business; see [`apply_to_path`].
pub fn apply(
    stream: &mut impl Read,
    dst: &mut (impl Write + Seek),
    copier: &mut BlockCopier,
    progress: &mut Progress,
) -> Result<Summary> {
    let mut summary = Summary::default();
    let mut offset = 0;
    while let Some(header) = read_header(stream, offset)? {
        ensure!(&header.signature == SIGNATURE, Error::BadSignature { offset });
        let (start, length) = (header.start.get(), header.length.get());
        let invalid = |reason: String| Error::InvalidFrame { offset, reason };
        ensure!(start >= 0, invalid(format!("negative start {}", start)));
        ensure!(length >= 0, invalid(format!("negative length {}", length)));
        ensure!(
            start.checked_add(length).is_some(),
            invalid(format!("range of {} bytes at {} overflows", length, start))
        );
        let (start, length) = (start as u64, length as u64);
        offset += FRAME_HEADER_LEN as u64;

        debug!(start, length, "applying frame");
        dst.seek(SeekFrom::Start(start))
            .with_context(|| format!("Failed to seek in output file to {}", start))?;
        copier
            .copy_stream(stream, dst, length, progress)
            .map_err(|e| match e.downcast_ref::<Error>() {
                Some(Error::UnexpectedEnd { remaining }) => Error::Truncated {
                    offset: offset + length - remaining,
                    what: "frame payload",
                    missing: *remaining,
                }
                .into(),
                _ => e,
            })?;
        offset += length;
        summary.record(length);
    }
    info!(
        frames = summary.frames,
        bytes = summary.bytes,
        "diff stream applied"
    );
    Ok(summary)
}

/// Applies a diff stream to the file or block device at `path`.
///
/// The destination is opened once up front: a block device that is in use
/// elsewhere is refused, a missing path becomes a new regular file. All
/// writes are synced to stable storage before returning.
pub fn apply_to_path(
    stream: &mut impl Read,
    path: &Path,
    copier: &mut BlockCopier,
    progress: &mut Progress,
) -> Result<Summary> {
    let mut dst = open_destination(path, Create::IfMissing)?;
    let summary = apply(stream, &mut dst, copier, progress)?;
    dst.sync_all()
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(summary)
}
