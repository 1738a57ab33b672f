//! Transparent decompression of kernel and module files
//!
//! [`open`] looks at the first bytes of a file. A gzip member gets wrapped
//! in a [`GzipReader`]; anything else comes back as it was. The wrapper
//! answers absolute reads like any other [`FileRead`]: it inflates forward
//! from a cursor, keeps the most recent 32 KiB of output in the DEFLATE
//! window, and starts again from the top of the stream for reads that
//! fall behind that window.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use miniz_oxide::inflate::core::inflate_flags::TINFL_FLAG_HAS_MORE_INPUT;
use miniz_oxide::inflate::core::{decompress, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

use crate::fs::FileRead;
use crate::{Error, Result};

/// DEFLATE history size; also the span served without a restart.
pub const WINDOW_SIZE: usize = 32 * 1024;
const INPUT_CHUNK: usize = 4096;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const GZIP_DEFLATE: u8 = 8;
const GZIP_HEADER_LEN: u64 = 10;
const GZIP_TRAILER_LEN: u64 = 8;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xE0;

/// Wrap `source` in a decompressor when its contents are compressed.
pub fn open<'a, R: FileRead + 'a>(mut source: R) -> Result<Box<dyn FileRead + 'a>> {
    match GzipMember::probe(&mut source)? {
        Some(member) => {
            log::debug!(
                "decompress: gzip stream, {} -> {} bytes",
                source.size(),
                member.size
            );
            Ok(Box::new(GzipReader::new(source, member)))
        }
        None => Ok(Box::new(source)),
    }
}

/// Where the compressed data starts and how long the plaintext is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzipMember {
    pub data_start: u64,
    pub size: u64,
}

impl GzipMember {
    /// Parse the RFC 1952 header. `Ok(None)` when the magic is absent.
    pub fn probe<R: FileRead + ?Sized>(source: &mut R) -> Result<Option<Self>> {
        let total = source.size();
        if total < GZIP_HEADER_LEN + GZIP_TRAILER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; GZIP_HEADER_LEN as usize];
        source.read_exact_at(0, &mut header)?;
        if header[..2] != GZIP_MAGIC {
            return Ok(None);
        }
        if header[2] != GZIP_DEFLATE {
            log::warn!("decompress: gzip method {} not supported", header[2]);
            return Err(Error::NotSupported);
        }
        let flags = header[3];
        if flags & FRESERVED != 0 {
            return Err(Error::Invalid);
        }

        let mut at = GZIP_HEADER_LEN;
        if flags & FEXTRA != 0 {
            let mut xlen = [0u8; 2];
            source.read_exact_at(at, &mut xlen)?;
            at += 2 + u16::from_le_bytes(xlen) as u64;
        }
        if flags & FNAME != 0 {
            at = skip_string(source, at, total)?;
        }
        if flags & FCOMMENT != 0 {
            at = skip_string(source, at, total)?;
        }
        if flags & FHCRC != 0 {
            at += 2;
        }
        if at + GZIP_TRAILER_LEN > total {
            return Err(Error::Invalid);
        }

        let mut isize = [0u8; 4];
        source.read_exact_at(total - 4, &mut isize)?;
        Ok(Some(Self {
            data_start: at,
            size: u32::from_le_bytes(isize) as u64,
        }))
    }
}

/// Offset just past the NUL terminating the string at `at`.
fn skip_string<R: FileRead + ?Sized>(source: &mut R, mut at: u64, total: u64) -> Result<u64> {
    let mut chunk = [0u8; 64];
    while at < total {
        let n = source.read_at(at, &mut chunk)?;
        if n == 0 {
            break;
        }
        if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
            return Ok(at + nul as u64 + 1);
        }
        at += n as u64;
    }
    Err(Error::Invalid)
}

/// Random-access reader over one gzip member.
pub struct GzipReader<R> {
    source: R,
    member: GzipMember,
    inflater: Box<DecompressorOxide>,
    window: Vec<u8>,
    input: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    /// Next source offset to pull compressed bytes from
    in_offset: u64,
    /// Plaintext bytes produced so far
    cursor: u64,
    finished: bool,
    restarts: u32,
}

impl<R: FileRead> GzipReader<R> {
    pub fn new(source: R, member: GzipMember) -> Self {
        Self {
            source,
            member,
            inflater: Box::default(),
            window: vec![0u8; WINDOW_SIZE],
            input: vec![0u8; INPUT_CHUNK],
            in_pos: 0,
            in_len: 0,
            in_offset: member.data_start,
            cursor: 0,
            finished: false,
            restarts: 0,
        }
    }

    /// Plaintext offset the decoder has reached.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// How many times a backwards read forced decoding from the start.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn restart(&mut self) {
        self.inflater.init();
        self.in_pos = 0;
        self.in_len = 0;
        self.in_offset = self.member.data_start;
        self.cursor = 0;
        self.finished = false;
        self.restarts += 1;
    }

    /// Oldest plaintext offset still held in the window.
    fn window_start(&self) -> u64 {
        self.cursor.saturating_sub(WINDOW_SIZE as u64)
    }

    /// Run the decoder once, producing at most up to the end of the window.
    fn advance(&mut self) -> Result<()> {
        if self.finished {
            // The stream ended short of the size the trailer promised.
            return Err(Error::Io);
        }
        if self.in_pos == self.in_len {
            let n = self.source.read_at(self.in_offset, &mut self.input)?;
            self.in_offset += n as u64;
            self.in_pos = 0;
            self.in_len = n;
        }
        let more_input = self.in_offset < self.source.size();
        let flags = if more_input { TINFL_FLAG_HAS_MORE_INPUT } else { 0 };

        let out_pos = (self.cursor % WINDOW_SIZE as u64) as usize;
        let (status, consumed, written) = decompress(
            &mut self.inflater,
            &self.input[self.in_pos..self.in_len],
            &mut self.window,
            out_pos,
            flags,
        );
        self.in_pos += consumed;
        self.cursor += written as u64;

        match status {
            TINFLStatus::Done => self.finished = true,
            TINFLStatus::HasMoreOutput => {}
            TINFLStatus::NeedsMoreInput if more_input => {}
            status => {
                log::warn!(
                    "decompress: inflate stopped at {} ({:?})",
                    self.cursor,
                    status
                );
                return Err(Error::Io);
            }
        }
        if consumed == 0 && written == 0 && !self.finished && self.in_pos < self.in_len {
            return Err(Error::Io);
        }
        Ok(())
    }
}

impl<R: FileRead> FileRead for GzipReader<R> {
    fn size(&self) -> u64 {
        self.member.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.member.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.member.size - offset) as usize;
        if offset < self.window_start() {
            log::debug!("decompress: rewinding for read at {}", offset);
            self.restart();
        }

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            if pos < self.cursor {
                // Contiguous run inside the ring, up to its wrap point.
                let ring = (pos % WINDOW_SIZE as u64) as usize;
                let n = ((self.cursor - pos) as usize)
                    .min(len - done)
                    .min(WINDOW_SIZE - ring);
                buf[done..done + n].copy_from_slice(&self.window[ring..ring + n]);
                done += n;
            } else {
                self.advance()?;
            }
        }
        Ok(len)
    }
}
