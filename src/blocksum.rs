use std::io::{ErrorKind, Read};

use anyhow::{ensure, Context};
use md5::{Digest, Md5};

use super::Result;

/// Default window: one checksum per 4 MiB.
pub const WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// MD5 of consecutive fixed-size windows of a stream, for comparing a
/// restored device against its source after a diff was applied.
///
/// Yields `(window index, digest)`; the last window may be short and an
/// empty stream has no windows.
pub struct BlockSums<R> {
    reader: R,
    buffer: Vec<u8>,
    index: u64,
    done: bool,
}

impl<R: Read> BlockSums<R> {
    pub fn new(reader: R, window: usize) -> Result<Self> {
        ensure!(window > 0, "checksum window must not be empty");
        Ok(BlockSums {
            reader,
            buffer: vec![0; window],
            index: 0,
            done: false,
        })
    }

    fn fill(&mut self) -> Result<usize> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.reader.read(&mut self.buffer[filled..]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(read) => filled += read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read input"),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for BlockSums<R> {
    type Item = Result<(u64, [u8; 16])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let filled = match self.fill() {
            Ok(0) => return None,
            Ok(filled) => filled,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let mut digest = [0; 16];
        digest.copy_from_slice(&Md5::digest(&self.buffer[..filled]));
        let index = self.index;
        self.index += 1;
        Some(Ok((index, digest)))
    }
}

/// `<index> <hex digest>`, as printed by the `blocksum` command.
pub fn format_sum(index: u64, digest: &[u8; 16]) -> String {
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{} {}", index, hex)
}
