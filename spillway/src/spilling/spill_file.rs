//! Format of the spill files
//!
//! A spill file is a sequence of records:
//!
//! ```text
//! ┌──────────┬──────────────┬────────────────┬───────────┬─────────────┐
//! │ hash u64 │ key_size u32 │ value_size u32 │ key bytes │ value bytes │
//! └──────────┴──────────────┴────────────────┴───────────┴─────────────┘
//! ```
//!
//! Integers in the record header are little endian

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

use super::{ReadSnafu, Result, TruncatedSnafu, WriteSnafu};
use crate::common::types::HashValue;
use crate::pair::PairRef;

/// Size of the record header
pub const RECORD_HEADER_SIZE: usize = size_of::<u64>() + 2 * size_of::<u32>();

/// Write a record into the writer
pub(crate) fn write_record<W: Write>(
    writer: &mut W,
    path: &Path,
    hash: HashValue,
    pair: PairRef<'_>,
) -> Result<()> {
    let mut header = [0_u8; RECORD_HEADER_SIZE];
    header[..8].copy_from_slice(&hash.to_le_bytes());
    header[8..12].copy_from_slice(&(pair.key.len() as u32).to_le_bytes());
    header[12..].copy_from_slice(&(pair.value.len() as u32).to_le_bytes());
    writer
        .write_all(&header)
        .and_then(|_| writer.write_all(pair.key))
        .and_then(|_| writer.write_all(pair.value))
        .context(WriteSnafu { path })
}

/// Read until the buffer is full or the end of the reader. Returns the number of bytes
/// read
fn read_full<R: Read>(reader: &mut R, mut buf: &mut [u8]) -> std::io::Result<usize> {
    let len = buf.len();
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => buf = &mut buf[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(len - buf.len())
}

/// Forward only cursor over the records of a spill file
#[derive(Debug)]
pub struct SpillFileCursor {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    hash: HashValue,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
}

impl SpillFileCursor {
    /// Open the spill file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).context(ReadSnafu { path: &path })?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: 0,
            hash: 0,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
        })
    }

    /// Path of the spill file
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move to the next record. Returns false if the end of the file is reached
    pub fn advance(&mut self) -> Result<bool> {
        self.valid = false;
        let mut header = [0_u8; RECORD_HEADER_SIZE];
        let read = read_full(&mut self.reader, &mut header).context(ReadSnafu { path: &self.path })?;
        if read == 0 {
            return Ok(false);
        }
        ensure!(
            read == RECORD_HEADER_SIZE,
            TruncatedSnafu {
                path: &self.path,
                offset: self.offset
            }
        );

        let mut hash = [0_u8; 8];
        hash.copy_from_slice(&header[..8]);
        let mut key_size = [0_u8; 4];
        key_size.copy_from_slice(&header[8..12]);
        let mut value_size = [0_u8; 4];
        value_size.copy_from_slice(&header[12..]);

        self.hash = u64::from_le_bytes(hash);
        self.key.resize(u32::from_le_bytes(key_size) as usize, 0);
        self.value.resize(u32::from_le_bytes(value_size) as usize, 0);

        let key_read = read_full(&mut self.reader, &mut self.key).context(ReadSnafu { path: &self.path })?;
        let value_read =
            read_full(&mut self.reader, &mut self.value).context(ReadSnafu { path: &self.path })?;
        ensure!(
            key_read == self.key.len() && value_read == self.value.len(),
            TruncatedSnafu {
                path: &self.path,
                offset: self.offset
            }
        );

        self.offset += (RECORD_HEADER_SIZE + self.key.len() + self.value.len()) as u64;
        self.valid = true;
        Ok(true)
    }

    /// Hash code of the current record
    #[inline]
    pub fn hash(&self) -> HashValue {
        self.hash
    }

    /// Current record, `None` before the first [`Self::advance`] or after the end
    #[inline]
    pub fn pair(&self) -> Option<PairRef<'_>> {
        self.valid.then(|| PairRef {
            key: &self.key,
            value: &self.value,
        })
    }
}
