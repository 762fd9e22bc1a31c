use std::mem::size_of;

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, Unaligned, I64};

use anyhow::Result;
pub use blocks::{unit_bytes, BlockList, Extent, Token};
pub use blocksum::{format_sum, BlockSums, WINDOW_SIZE};
pub use copy::{BlockCopier, Sink, COPY_CHUNK_SIZE};
pub use device::{open_destination, open_source, Create};
pub use diff::{generate, measure};
pub use direct::copy_direct;
pub use error::Error;
pub use patch::{apply, apply_to_path};
pub use progress::Progress;

/// Every frame of a diff stream starts with these bytes.
pub const SIGNATURE: &[u8; 8] = b"ERARANGE";
/// dm-era block sizes are given in sectors of this many bytes.
pub const SECTOR_SIZE: u64 = 512;
pub const FRAME_HEADER_LEN: usize = size_of::<FrameHeader>();

mod blocks;
mod blocksum;
mod copy;
mod device;
mod diff;
mod direct;
mod error;
mod patch;
mod progress;

/// Header of one diff stream frame, followed by `length` bytes of payload.
///
/// The stream has no header or trailer of its own: it is just frames back to
/// back, and running out of input at a frame boundary ends it. Integers are
/// 64-bit little-endian, which is what the original C tools wrote on x86-64.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub signature: [u8; 8],
    pub start: I64<LittleEndian>,
    pub length: I64<LittleEndian>,
}

impl FrameHeader {
    pub fn new(start: i64, length: i64) -> Self {
        FrameHeader {
            signature: *SIGNATURE,
            start: I64::new(start),
            length: I64::new(length),
        }
    }
}

/// What a run of the encoder, applier or direct copier went through.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Number of ranges (frames) processed.
    pub frames: u64,
    /// Payload bytes, not counting frame headers.
    pub bytes: u64,
}

impl Summary {
    fn record(&mut self, length: u64) {
        self.frames += 1;
        self.bytes += length;
    }

    /// Size of the diff stream that carries these frames.
    pub fn stream_len(&self) -> u64 {
        self.bytes + self.frames * FRAME_HEADER_LEN as u64
    }
}
