use std::io::{BufRead, Read};

use anyhow::{ensure, Context};
use regex::Regex;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::SECTOR_SIZE;

use super::Result;

const OPENING: &str = "<blocks>";
const CLOSING: &str = "</blocks>";
const RANGE: &str = "<range begin=\"NUMBER\" end=\"NUMBER\"/> with 64-bit numbers";
const BLOCK: &str = "<block block=\"NUMBER\"/> with a 64-bit number";
/// Longest block list item accepted, markup included.
const MAX_ITEM_LEN: u64 = 1024;

/// A run of changed blocks, `length` units starting at `start`.
///
/// [`BlockList`] hands these out in device-block units; [`Extent::to_bytes`]
/// turns them into byte offsets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn to_bytes(self, unit_bytes: u64) -> Result<Extent> {
        let overflow = |what, value| Error::Overflow {
            what,
            value,
            unit_bytes,
        };
        Ok(Extent {
            start: self
                .start
                .checked_mul(unit_bytes)
                .ok_or_else(|| overflow("block", self.start))?,
            length: self
                .length
                .checked_mul(unit_bytes)
                .ok_or_else(|| overflow("block count", self.length))?,
        })
    }
}

/// Bytes per tracked block, for a block size given in 512-byte sectors.
pub fn unit_bytes(unit_size: u64) -> Result<u64> {
    ensure!(unit_size > 0, Error::InvalidUnitSize(unit_size));
    Ok(unit_size
        .checked_mul(SECTOR_SIZE)
        .ok_or(Error::InvalidUnitSize(unit_size))?)
}

/// One markup item of a block list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Opening,
    Range { begin: u64, end: u64 },
    Block { block: u64 },
    Closing,
    Unrecognized(String),
}

struct Patterns {
    opening: Regex,
    closing: Regex,
    range: Regex,
    block: Regex,
}

impl Patterns {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| Regex::new(pattern).context("Failed to compile block list pattern");
        Ok(Patterns {
            opening: compile(r"^<\s*blocks\s*>$")?,
            closing: compile(r"^<\s*/\s*blocks\s*>$")?,
            range: compile(
                r#"^<\s*range\s*begin\s*=\s*"\s*(\d+)\s*"\s*end\s*=\s*"\s*(\d+)\s*"\s*/\s*>$"#,
            )?,
            block: compile(r#"^<\s*block\s*block\s*=\s*"\s*(\d+)\s*"\s*/\s*>$"#)?,
        })
    }

    fn classify(&self, item: &str) -> Result<Token> {
        let number = |expected: &'static str, text: &str| {
            text.parse::<u64>().map_err(|_| Error::Format {
                expected,
                found: item.to_owned(),
            })
        };
        Ok(if self.opening.is_match(item) {
            Token::Opening
        } else if self.closing.is_match(item) {
            Token::Closing
        } else if let Some(caps) = self.range.captures(item) {
            Token::Range {
                begin: number(RANGE, &caps[1])?,
                end: number(RANGE, &caps[2])?,
            }
        } else if let Some(caps) = self.block.captures(item) {
            Token::Block {
                block: number(BLOCK, &caps[1])?,
            }
        } else {
            Token::Unrecognized(item.to_owned())
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    ExpectOpening,
    Entries,
    Done,
}

/// Lazily parses the XML block list printed by `era_invalidate`:
///
/// ```text
/// <blocks>
///   <range begin="0" end="2"/>
///   <block block="5"/>
/// </blocks>
/// ```
///
/// Items are split on `>`, so line breaks do not matter. Yields one [`Extent`]
/// per entry, in block units. The first error ends the iteration.
pub struct BlockList<R> {
    reader: R,
    patterns: Patterns,
    state: State,
    item: Vec<u8>,
    raw: String,
}

impl<R: BufRead> BlockList<R> {
    pub fn new(reader: R) -> Result<Self> {
        Ok(BlockList {
            reader,
            patterns: Patterns::new()?,
            state: State::ExpectOpening,
            item: Vec::new(),
            raw: String::new(),
        })
    }

    fn token(&mut self) -> Result<Option<Token>> {
        self.item.clear();
        (&mut self.reader)
            .take(MAX_ITEM_LEN)
            .read_until(b'>', &mut self.item)
            .context("Failed to read block list")?;
        self.raw = String::from_utf8_lossy(&self.item).trim().to_owned();
        ensure!(
            (self.item.len() as u64) < MAX_ITEM_LEN || self.item.last() == Some(&b'>'),
            Error::Format {
                expected: "a block list item of at most 1024 bytes",
                found: self.raw.chars().take(64).collect(),
            }
        );
        if self.raw.is_empty() {
            return Ok(None);
        }
        let token = self.patterns.classify(&self.raw)?;
        trace!(?token, "block list item");
        Ok(Some(token))
    }

    fn unexpected(&self, expected: &'static str, found: Option<&Token>) -> anyhow::Error {
        let found = match found {
            Some(_) => self.raw.clone(),
            None => "end of input".to_owned(),
        };
        Error::Format { expected, found }.into()
    }

    fn advance(&mut self) -> Result<Option<Extent>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::ExpectOpening => match self.token()? {
                    None => {
                        warn!("Input block list is empty");
                        self.state = State::Done;
                    }
                    Some(Token::Opening) => self.state = State::Entries,
                    Some(other) => return Err(self.unexpected(OPENING, Some(&other))),
                },
                State::Entries => match self.token()? {
                    Some(Token::Range { begin, end }) => {
                        ensure!(
                            begin <= end,
                            Error::Format {
                                expected: "<range begin=N end=M /> with N <= M",
                                found: self.raw.clone(),
                            }
                        );
                        return Ok(Some(Extent {
                            start: begin,
                            length: end - begin,
                        }));
                    }
                    Some(Token::Block { block }) => {
                        return Ok(Some(Extent {
                            start: block,
                            length: 1,
                        }))
                    }
                    Some(Token::Closing) => self.state = State::Done,
                    Some(Token::Opening) | Some(Token::Unrecognized(_)) => {
                        debug!(item = %self.raw, "not a block entry, expecting end of list");
                        match self.token()? {
                            Some(Token::Closing) => self.state = State::Done,
                            other => return Err(self.unexpected(CLOSING, other.as_ref())),
                        }
                    }
                    None => return Err(self.unexpected(CLOSING, None)),
                },
            }
        }
    }
}

impl<R: BufRead> Iterator for BlockList<R> {
    type Item = Result<Extent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(extent) => extent.map(Ok),
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}
