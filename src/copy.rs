use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read, StdoutLock, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::Context;
use tracing::debug;

use crate::error::Error;
use crate::progress::Progress;

use super::Result;

/// Bytes moved per read/write or `sendfile` call.
pub const COPY_CHUNK_SIZE: usize = 32 * 1024 * 1024;
/// Buffer alignment, enough for `O_DIRECT` on 4K-sector devices.
const ALIGNMENT: usize = 4096;

/// Where the encoder writes frames.
///
/// Sinks backed by a file descriptor let payloads go through `sendfile(2)`
/// without passing through user space.
pub trait Sink: Write {
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl Sink for File {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl Sink for StdoutLock<'_> {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl Sink for Vec<u8> {}

impl<T> Sink for Cursor<T> where Cursor<T>: Write {}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn raw_fd(&self) -> Option<RawFd> {
        (**self).raw_fd()
    }
}

enum Sent {
    All,
    Unsupported,
}

/// Copies byte ranges in bounded chunks through one buffer that is allocated
/// once and reused for every range.
pub struct BlockCopier {
    buffer: Vec<u8>,
    chunk: usize,
    zero_copy: bool,
}

impl Default for BlockCopier {
    fn default() -> Self {
        BlockCopier::new()
    }
}

impl BlockCopier {
    pub fn new() -> Self {
        BlockCopier::with_chunk_size(COPY_CHUNK_SIZE)
    }

    /// `chunk` is rounded up to a multiple of the buffer alignment.
    pub fn with_chunk_size(chunk: usize) -> Self {
        let chunk = ((chunk.max(1) + ALIGNMENT - 1) / ALIGNMENT) * ALIGNMENT;
        BlockCopier {
            buffer: vec![0; chunk + ALIGNMENT],
            chunk,
            zero_copy: cfg!(target_os = "linux"),
        }
    }

    /// Never hand payloads to `sendfile`, even when the sink has a descriptor.
    pub fn without_zero_copy(mut self) -> Self {
        self.zero_copy = false;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn aligned(&mut self) -> &mut [u8] {
        let offset = self.buffer.as_ptr().align_offset(ALIGNMENT).min(ALIGNMENT);
        let chunk = self.chunk;
        &mut self.buffer[offset..offset + chunk]
    }

    /// Copies `length` bytes of `src` starting at `offset` to the current
    /// position of `sink`.
    ///
    /// The source is read positionally, so its cursor does not matter.
    pub fn copy_range(
        &mut self,
        src: &File,
        offset: u64,
        length: u64,
        sink: &mut impl Sink,
        progress: &mut Progress,
    ) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        if self.zero_copy {
            if let Some(fd) = sink.raw_fd() {
                // Frame headers may still sit in a user-space buffer.
                sink.flush().context("Failed to flush output")?;
                match self.send(src, offset, fd, length, progress)? {
                    Sent::All => return Ok(()),
                    Sent::Unsupported => {
                        debug!("sendfile is not supported for this output, using read/write");
                        self.zero_copy = false;
                    }
                }
            }
        }
        self.read_write(src, offset, length, sink, progress)
    }

    #[cfg(target_os = "linux")]
    fn send(
        &mut self,
        src: &File,
        offset: u64,
        fd: RawFd,
        length: u64,
        progress: &mut Progress,
    ) -> Result<Sent> {
        use std::convert::TryFrom;

        let mut position =
            libc::off_t::try_from(offset).context("Source offset does not fit into off_t")?;
        let mut remaining = length;
        while remaining > 0 {
            let count = remaining.min(self.chunk as u64) as usize;
            // SAFETY: both descriptors stay open for the duration of the call
            // and `position` is a valid, exclusively borrowed off_t.
            let sent = unsafe { libc::sendfile(fd, src.as_raw_fd(), &mut position, count) };
            if sent < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EINVAL) | Some(libc::ENOSYS) if remaining == length => {
                        return Ok(Sent::Unsupported)
                    }
                    _ => return Err(err).context("Failed to copy data"),
                }
            }
            if sent == 0 {
                return Err(Error::UnexpectedEnd { remaining }).context("Failed to copy data");
            }
            remaining -= sent as u64;
            progress.inc(sent as u64);
        }
        Ok(Sent::All)
    }

    #[cfg(not(target_os = "linux"))]
    fn send(
        &mut self,
        _src: &File,
        _offset: u64,
        _fd: RawFd,
        _length: u64,
        _progress: &mut Progress,
    ) -> Result<Sent> {
        Ok(Sent::Unsupported)
    }

    fn read_write(
        &mut self,
        src: &File,
        mut offset: u64,
        length: u64,
        sink: &mut impl Write,
        progress: &mut Progress,
    ) -> Result<()> {
        let buffer = self.aligned();
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let read = match src.read_at(&mut buffer[..want], offset) {
                Ok(0) => {
                    return Err(Error::UnexpectedEnd { remaining }).context("Read error");
                }
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Read error"),
            };
            sink.write_all(&buffer[..read]).context("Write error")?;
            offset += read as u64;
            remaining -= read as u64;
            progress.inc(read as u64);
        }
        Ok(())
    }

    /// Copies the next `length` bytes of `src` to the current position of
    /// `dst`, advancing both.
    pub fn copy_stream(
        &mut self,
        src: &mut impl Read,
        dst: &mut impl Write,
        length: u64,
        progress: &mut Progress,
    ) -> Result<()> {
        let buffer = self.aligned();
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let read = match src.read(&mut buffer[..want]) {
                Ok(0) => {
                    return Err(Error::UnexpectedEnd { remaining }).context("Read error");
                }
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Read error"),
            };
            dst.write_all(&buffer[..read]).context("Write error")?;
            remaining -= read as u64;
            progress.inc(read as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn source(data: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file
    }

    /// Hands out at most `step` bytes per call.
    struct Trickle<T> {
        inner: T,
        step: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(self.step);
            self.inner.read(&mut buf[..len])
        }
    }

    impl<W: Write> Write for Trickle<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let len = buf.len().min(self.step);
            self.inner.write(&buf[..len])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn chunk_size_is_aligned() {
        let mut copier = BlockCopier::with_chunk_size(5000);
        assert_eq!(copier.chunk_size(), 8192);
        assert_eq!(copier.aligned().as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(copier.aligned().len(), 8192);
    }

    #[test]
    fn range_through_buffer() {
        let data = pattern(100_000);
        let src = source(&data);
        let mut copier = BlockCopier::with_chunk_size(4096);
        let mut out = Vec::new();
        copier
            .copy_range(&src, 1000, 50_000, &mut out, &mut Progress::hidden())
            .unwrap();
        assert_eq!(out, &data[1000..51_000]);
    }

    #[test]
    fn range_through_descriptor() {
        let data = pattern(300_000);
        let src = source(&data);
        let mut out = tempfile::tempfile().unwrap();
        out.write_all(b"head").unwrap();
        let mut copier = BlockCopier::with_chunk_size(8192);
        copier
            .copy_range(&src, 4096, 200_000, &mut out, &mut Progress::hidden())
            .unwrap();
        copier
            .copy_range(&src, 0, 10, &mut out, &mut Progress::hidden())
            .unwrap();

        let mut copied = Vec::new();
        out.seek(SeekFrom::Start(0)).unwrap();
        out.read_to_end(&mut copied).unwrap();
        assert_eq!(&copied[..4], b"head");
        assert_eq!(&copied[4..200_004], &data[4096..204_096]);
        assert_eq!(&copied[200_004..], &data[..10]);
    }

    #[test]
    fn range_without_zero_copy() {
        let data = pattern(20_000);
        let src = source(&data);
        let mut out = tempfile::tempfile().unwrap();
        let mut copier = BlockCopier::with_chunk_size(4096).without_zero_copy();
        copier
            .copy_range(&src, 512, 8192, &mut out, &mut Progress::hidden())
            .unwrap();
        let mut copied = Vec::new();
        out.seek(SeekFrom::Start(0)).unwrap();
        out.read_to_end(&mut copied).unwrap();
        assert_eq!(copied, &data[512..512 + 8192]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn append_only_sink_falls_back_to_read_write() {
        let data = pattern(20_000);
        let src = source(&data);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appended");
        std::fs::write(&path, b"head").unwrap();
        // sendfile refuses O_APPEND targets with EINVAL.
        let mut out = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        let mut copier = BlockCopier::with_chunk_size(4096);
        copier
            .copy_range(&src, 100, 9000, &mut out, &mut Progress::hidden())
            .unwrap();
        assert!(!copier.zero_copy);
        copier
            .copy_range(&src, 0, 3, &mut out, &mut Progress::hidden())
            .unwrap();

        let copied = std::fs::read(&path).unwrap();
        assert_eq!(&copied[..4], b"head");
        assert_eq!(&copied[4..9004], &data[100..9100]);
        assert_eq!(&copied[9004..], &data[..3]);
    }

    #[test]
    fn range_past_end_of_source() {
        let src = source(&pattern(1000));
        for zero_copy in &[true, false] {
            let mut copier = BlockCopier::with_chunk_size(4096);
            if !zero_copy {
                copier = copier.without_zero_copy();
            }
            let mut out = tempfile::tempfile().unwrap();
            let err = copier
                .copy_range(&src, 500, 1000, &mut out, &mut Progress::hidden())
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::UnexpectedEnd { remaining: 500 })
            ));
        }
    }

    #[test]
    fn empty_range_touches_nothing() {
        let src = source(b"");
        let mut copier = BlockCopier::with_chunk_size(4096);
        let mut out = Vec::new();
        copier
            .copy_range(&src, 1 << 40, 0, &mut out, &mut Progress::hidden())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn stream_with_short_transfers() {
        let data = pattern(50_000);
        let mut input = Trickle {
            inner: &data[..],
            step: 333,
        };
        let mut output = Trickle {
            inner: Vec::new(),
            step: 17,
        };
        let mut copier = BlockCopier::with_chunk_size(4096);
        copier
            .copy_stream(&mut input, &mut output, 30_000, &mut Progress::hidden())
            .unwrap();
        copier
            .copy_stream(&mut input, &mut output, 20_000, &mut Progress::hidden())
            .unwrap();
        assert_eq!(output.inner, data);
    }

    #[test]
    fn stream_ends_early() {
        let data = pattern(100);
        let mut output = Vec::new();
        let err = BlockCopier::with_chunk_size(4096)
            .copy_stream(&mut &data[..], &mut output, 150, &mut Progress::hidden())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnexpectedEnd { remaining: 50 })
        ));
        assert_eq!(output, data);
    }

    #[test]
    fn progress_counts_copied_bytes() {
        let data = pattern(3 * 1024 * 1024);
        let src = source(&data);
        let mut progress = Progress::hidden();
        let mut out = Vec::new();
        BlockCopier::with_chunk_size(1 << 20)
            .copy_range(&src, 0, data.len() as u64, &mut out, &mut progress)
            .unwrap();
        assert_eq!(progress.position(), data.len() as u64);
    }
}
