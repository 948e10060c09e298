//! Block-oriented append-only file layer.
//!
//! A database file is divided into 4096-byte blocks. The first byte of every
//! block is a marker: `0x00` for plain data, `0x01` for a block that begins a
//! header. Appended chunks are a big-endian `u32` length prefix followed by
//! the payload, with one marker byte injected at every block boundary the
//! chunk crosses. Public offsets always refer to the first byte of the
//! length prefix; logical reads strip the interleaved marker bytes.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{DriftError, Result};
use crate::term::{self, Term};

pub const BLOCK_SIZE: u64 = 4096;

const DATA_MARKER: u8 = 0x00;
const HEADER_MARKER: u8 = 0x01;

#[cfg(unix)]
mod posio {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::fs::FileExt;

    pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod posio {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

pub struct BlockFile {
    file: File,
    eof: u64,
}

impl BlockFile {
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(file)
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> Result<Self> {
        let eof = file.metadata()?.len();
        Ok(Self { file, eof })
    }

    pub fn len(&self) -> u64 {
        self.eof
    }

    pub fn is_empty(&self) -> bool {
        self.eof == 0
    }

    pub fn block_count(&self) -> u64 {
        self.eof.div_ceil(BLOCK_SIZE)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Raw positioned read with no marker stripping; the scanner wants the
    /// bytes exactly as they sit on disk.
    pub fn read_raw(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        posio::read_exact_at(&self.file, off, dst)?;
        Ok(())
    }

    fn write_raw(&self, off: u64, src: &[u8]) -> Result<()> {
        posio::write_all_at(&self.file, off, src)?;
        Ok(())
    }

    /// Reads `n` payload bytes starting at `pos`, skipping the marker byte
    /// at every block boundary in the covered range.
    pub fn read_logical(&self, pos: u64, n: usize) -> Result<Vec<u8>> {
        let mut span: u64 = 0;
        let mut cursor = pos;
        let mut remaining = n as u64;
        while remaining > 0 {
            if cursor % BLOCK_SIZE == 0 {
                span += 1;
                cursor += 1;
                continue;
            }
            let in_block = BLOCK_SIZE - cursor % BLOCK_SIZE;
            let take = in_block.min(remaining);
            span += take;
            cursor += take;
            remaining -= take;
        }

        let mut raw = vec![0u8; span as usize];
        self.read_raw(pos, &mut raw)?;
        let mut out = Vec::with_capacity(n);
        for (i, &b) in raw.iter().enumerate() {
            if (pos + i as u64) % BLOCK_SIZE != 0 {
                out.push(b);
            }
        }
        Ok(out)
    }

    /// Appends a length-prefixed chunk, returning the offset of the first
    /// byte of the length prefix.
    pub fn append_chunk(&mut self, payload: &[u8]) -> Result<u64> {
        if payload.len() > u32::MAX as usize {
            return Err(DriftError::InvalidArgument(
                "chunk exceeds u32::MAX bytes".into(),
            ));
        }
        let pos = self.eof;
        let len_prefix = (payload.len() as u32).to_be_bytes();
        let mut raw = Vec::with_capacity(payload.len() + 8);
        let mut cursor = pos;
        for &b in len_prefix.iter().chain(payload.iter()) {
            if cursor % BLOCK_SIZE == 0 {
                raw.push(DATA_MARKER);
                cursor += 1;
            }
            raw.push(b);
            cursor += 1;
        }
        self.write_raw(pos, &raw)?;
        self.eof = cursor;
        Ok(pos)
    }

    pub fn append_term(&mut self, term: &Term) -> Result<u64> {
        self.append_chunk(&term::encode(term))
    }

    /// Decodes the length-prefixed term whose prefix starts at `pos`.
    pub fn read_term_at(&self, pos: u64) -> Result<Term> {
        if pos >= self.eof {
            return Err(DriftError::Corruption(format!(
                "term offset {pos} past end of file"
            )));
        }
        let prefix = self.read_logical(pos, 4)?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        if len == 0 || len > self.eof - pos {
            return Err(DriftError::Corruption(format!(
                "implausible term length {len} at offset {pos}"
            )));
        }
        let chunk = self.read_logical(pos, 4 + len as usize)?;
        Ok(term::decode_exact(&chunk[4..])?)
    }

    /// Appends a header record at the next block boundary: marker byte,
    /// length prefix, crc32 of the payload, then the payload itself. Returns
    /// the block-aligned header position.
    pub fn write_header(&mut self, term: &Term) -> Result<u64> {
        let payload = term::encode(term);
        let mut pos = self.eof;
        let tail = pos % BLOCK_SIZE;
        if tail != 0 {
            let fill = (BLOCK_SIZE - tail) as usize;
            self.write_raw(pos, &vec![0u8; fill])?;
            pos += fill as u64;
        }

        let crc = crc32fast::hash(&payload);
        let len_prefix = (payload.len() as u32).to_be_bytes();
        let crc_bytes = crc.to_be_bytes();
        let mut raw = Vec::with_capacity(payload.len() + 16);
        raw.push(HEADER_MARKER);
        let mut cursor = pos + 1;
        for &b in len_prefix
            .iter()
            .chain(crc_bytes.iter())
            .chain(payload.iter())
        {
            if cursor % BLOCK_SIZE == 0 {
                raw.push(DATA_MARKER);
                cursor += 1;
            }
            raw.push(b);
            cursor += 1;
        }
        self.write_raw(pos, &raw)?;
        self.eof = cursor;
        Ok(pos)
    }

    /// Reads the header record at a block-aligned position, verifying its
    /// marker byte and checksum.
    pub fn read_header_at(&self, pos: u64) -> Result<Term> {
        if pos % BLOCK_SIZE != 0 {
            return Err(DriftError::InvalidArgument(
                "header position is not block-aligned".into(),
            ));
        }
        let mut marker = [0u8; 1];
        self.read_raw(pos, &mut marker)?;
        if marker[0] != HEADER_MARKER {
            return Err(DriftError::NotFound("header"));
        }
        let meta = self.read_logical(pos + 1, 8)?;
        let len = u32::from_be_bytes([meta[0], meta[1], meta[2], meta[3]]) as u64;
        let crc = u32::from_be_bytes([meta[4], meta[5], meta[6], meta[7]]);
        if len == 0 || len > self.eof - pos {
            return Err(DriftError::Corruption(format!(
                "implausible header length {len} at block offset {pos}"
            )));
        }
        let chunk = self.read_logical(pos + 1, 8 + len as usize)?;
        let payload = &chunk[8..];
        if crc32fast::hash(payload) != crc {
            return Err(DriftError::Corruption(format!(
                "header checksum mismatch at block offset {pos}"
            )));
        }
        Ok(term::decode_exact(payload)?)
    }
}
