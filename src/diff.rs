use std::convert::TryFrom;
use std::fs::File;

use anyhow::{anyhow, Context};
use tracing::{debug, info};
use zerocopy::AsBytes;

use crate::blocks::{unit_bytes, Extent};
use crate::copy::{BlockCopier, Sink};
use crate::progress::Progress;
use crate::{FrameHeader, Summary};

use super::Result;

fn frame_header(extent: Extent) -> Result<FrameHeader> {
    let too_large = || {
        anyhow!(
            "range of {} bytes at offset {} does not fit into a diff stream frame",
            extent.length,
            extent.start
        )
    };
    let end = extent.start.checked_add(extent.length).ok_or_else(too_large)?;
    i64::try_from(end).map_err(|_| too_large())?;
    Ok(FrameHeader::new(extent.start as i64, extent.length as i64))
}

/// Writes a diff stream for `blocks` to `sink`: for every extent a frame
/// header followed by the bytes of `source` it covers.
///
/// `unit_size` is the tracking block size in 512-byte sectors. The sink is
/// neither flushed at the end nor closed; that is up to the caller.
pub fn generate(
    blocks: impl IntoIterator<Item = Result<Extent>>,
    source: &File,
    sink: &mut impl Sink,
    unit_size: u64,
    copier: &mut BlockCopier,
    progress: &mut Progress,
) -> Result<Summary> {
    let unit = unit_bytes(unit_size)?;
    let mut summary = Summary::default();
    for extent in blocks {
        let extent = extent?.to_bytes(unit)?;
        debug!(start = extent.start, length = extent.length, "writing frame");
        sink.write_all(frame_header(extent)?.as_bytes())
            .context("Failed to write to diff stream")?;
        copier
            .copy_range(source, extent.start, extent.length, sink, progress)
            .with_context(|| {
                format!(
                    "Failed to copy {} bytes at offset {}",
                    extent.length, extent.start
                )
            })?;
        summary.record(extent.length);
    }
    info!(
        frames = summary.frames,
        bytes = summary.bytes,
        "diff stream written"
    );
    Ok(summary)
}

/// Adds up what [`generate`] would copy for `blocks`, without reading or
/// writing any data.
pub fn measure(
    blocks: impl IntoIterator<Item = Result<Extent>>,
    unit_size: u64,
) -> Result<Summary> {
    let unit = unit_bytes(unit_size)?;
    let mut summary = Summary::default();
    for extent in blocks {
        let extent = extent?.to_bytes(unit)?;
        frame_header(extent)?;
        summary.frames += 1;
        summary.bytes = summary
            .bytes
            .checked_add(extent.length)
            .context("Total diff size overflows")?;
    }
    debug!(frames = summary.frames, bytes = summary.bytes, "diff size");
    Ok(summary)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blocks::BlockList;
    use crate::error::Error;
    use crate::{FRAME_HEADER_LEN, SIGNATURE};
    use std::io::Write;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8 ^ (i >> 12) as u8).collect()
    }

    fn source(data: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file
    }

    fn list(input: &str) -> BlockList<&[u8]> {
        BlockList::new(input.as_bytes()).unwrap()
    }

    fn encode(input: &str, data: &[u8], unit_size: u64) -> Result<(Vec<u8>, Summary)> {
        let src = source(data);
        let mut stream = Vec::new();
        let summary = generate(
            list(input),
            &src,
            &mut stream,
            unit_size,
            &mut BlockCopier::with_chunk_size(4096),
            &mut Progress::hidden(),
        )?;
        Ok((stream, summary))
    }

    fn frame(start: i64, length: i64) -> Vec<u8> {
        FrameHeader::new(start, length).as_bytes().to_vec()
    }

    const SCENARIO: &str = r#"<blocks><range begin="0" end="2"/><block block="5"/></blocks>"#;

    #[test]
    fn concrete_scenario() {
        let data = pattern(32 * 1024);
        let (stream, summary) = encode(SCENARIO, &data, 8).unwrap();

        let mut expected = frame(0, 8192);
        expected.extend_from_slice(&data[..8192]);
        expected.extend(frame(20480, 4096));
        expected.extend_from_slice(&data[20480..24576]);
        assert_eq!(stream, expected);
        assert_eq!(
            summary,
            Summary {
                frames: 2,
                bytes: 12288
            }
        );
        assert_eq!(stream.len() as u64, summary.stream_len());
    }

    #[test]
    fn signatures_at_frame_offsets() {
        let data = pattern(64 * 1024);
        let input = "<blocks>\n<block block=\"9\"/>\n<range begin=\"1\" end=\"4\"/>\n<range begin=\"6\" end=\"6\"/>\n<block block=\"0\"/>\n</blocks>\n";
        let (stream, summary) = encode(input, &data, 4).unwrap();

        let mut offset = 0;
        let mut frames = 0;
        while offset < stream.len() {
            let header = &stream[offset..offset + FRAME_HEADER_LEN];
            assert_eq!(&header[..8], SIGNATURE);
            let mut length = [0; 8];
            length.copy_from_slice(&header[16..24]);
            offset += FRAME_HEADER_LEN + u64::from_le_bytes(length) as usize;
            frames += 1;
        }
        assert_eq!(offset, stream.len());
        assert_eq!(frames, summary.frames);
        assert_eq!(summary.frames, 4);
    }

    #[test]
    fn measure_matches_generate() {
        let data = pattern(64 * 1024);
        let input = "<blocks>\n<range begin=\"3\" end=\"7\"/>\n<block block=\"1\"/>\n<range begin=\"3\" end=\"4\"/>\n</blocks>\n";
        let (stream, generated) = encode(input, &data, 2).unwrap();
        let measured = measure(list(input), 2).unwrap();
        assert_eq!(measured, generated);
        assert_eq!(measured.bytes, 6 * 1024);
        assert_eq!(
            stream.len() as u64 - measured.frames * FRAME_HEADER_LEN as u64,
            measured.bytes
        );
    }

    #[test]
    fn empty_list() {
        let (stream, summary) = encode("<blocks></blocks>", b"", 8).unwrap();
        assert!(stream.is_empty());
        assert_eq!(summary, Summary::default());
        assert_eq!(measure(list("<blocks>\n</blocks>\n"), 8).unwrap().bytes, 0);
    }

    #[test]
    fn zero_length_range_is_an_empty_frame() {
        let (stream, summary) =
            encode(r#"<blocks><range begin="2" end="2"/></blocks>"#, b"", 8).unwrap();
        assert_eq!(stream, frame(8192, 0));
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.bytes, 0);
    }

    #[test]
    fn source_too_short() {
        let err = encode(SCENARIO, &pattern(21000), 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn malformed_list_copies_nothing() {
        let data = pattern(8192);
        let err = encode("<block>\n<block block=\"0\"/>\n</blocks>\n", &data, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Format { .. })
        ));
        let err = measure(list("<blocks>\n"), 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Format { .. })
        ));
    }

    #[test]
    fn offsets_beyond_signed_range() {
        let huge = format!(r#"<blocks><block block="{}"/></blocks>"#, u64::MAX / 1024);
        assert!(measure(list(&huge), 1).is_err());
        assert!(encode(&huge, b"", 1).is_err());
    }

    #[test]
    fn extents_from_any_iterator() {
        let data = pattern(4096);
        let src = source(&data);
        let mut stream = Vec::new();
        let extents = vec![Ok(Extent {
            start: 1,
            length: 2,
        })];
        generate(
            extents,
            &src,
            &mut stream,
            1,
            &mut BlockCopier::with_chunk_size(4096),
            &mut Progress::hidden(),
        )
        .unwrap();
        assert_eq!(&stream[FRAME_HEADER_LEN..], &data[512..1536]);
    }
}
