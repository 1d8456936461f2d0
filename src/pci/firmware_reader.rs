//! Intel HEX reader for DSP firmware images.
//!
//! Reads `:LLAAAATTDD..DDCC` records into a fixed-capacity program image.
//! Supported record types:
//! - `00` data
//! - `01` end of file
//! - `04` extended linear address (upper 16 bits of the load address)
//!
//! Other record types are reported and skipped. Problems are collected per
//! line so the whole file is always read; the file-level verdict is made at
//! the end.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::config::PROGRAM_BUFFER_SIZE;
use super::crc::crc32;
use super::error::{Upc2Error, Upc2Result};

/// Shortest possible record: `:LLAAAATTCC`.
const MIN_RECORD_CHARS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Data,
    EndOfFile,
    ExtendedLinearAddress,
    Other(u8),
}

impl RecordKind {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => RecordKind::Data,
            0x01 => RecordKind::EndOfFile,
            0x04 => RecordKind::ExtendedLinearAddress,
            other => RecordKind::Other(other),
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub kind: RecordKind,
    pub address: u16,
    pub data: Vec<u8>,
}

/// Why a line was not accepted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineIssue {
    /// Line does not start with `:`.
    NoStart,
    /// Line is too short for the record it declares.
    NoRecord,
    /// Non-hex characters where hex digits were expected.
    HexError,
    /// Record checksum does not cancel the byte sum.
    InvalidChecksum,
    /// Valid record of a type this loader ignores.
    UnknownType(u8),
}

impl LineIssue {
    /// Unknown record types are tolerated; everything else fails the file.
    pub fn is_error(self) -> bool {
        !matches!(self, LineIssue::UnknownType(_))
    }

    pub fn description(self) -> String {
        match self {
            LineIssue::NoStart => "':' is not the starting character".into(),
            LineIssue::NoRecord => "not enough characters for a record".into(),
            LineIssue::HexError => "invalid hex digit".into(),
            LineIssue::InvalidChecksum => "invalid checksum".into(),
            LineIssue::UnknownType(t) => format!("unknown record type {:02X}", t),
        }
    }
}

fn hex_byte(text: &[u8], at: usize) -> Result<u8, LineIssue> {
    let pair = text.get(at..at + 2).ok_or(LineIssue::NoRecord)?;
    let hi = (pair[0] as char).to_digit(16).ok_or(LineIssue::HexError)?;
    let lo = (pair[1] as char).to_digit(16).ok_or(LineIssue::HexError)?;
    Ok((hi * 16 + lo) as u8)
}

/// Decode one record line. Trailing whitespace is ignored.
pub fn parse_hex_line(line: &str) -> Result<HexRecord, LineIssue> {
    let text = line.trim_end().as_bytes();
    if text.len() < MIN_RECORD_CHARS {
        return Err(LineIssue::NoRecord);
    }
    if text[0] != b':' {
        return Err(LineIssue::NoStart);
    }

    let length = hex_byte(text, 1)? as usize;
    let addr_hi = hex_byte(text, 3)?;
    let addr_lo = hex_byte(text, 5)?;
    let kind_byte = hex_byte(text, 7)?;
    if text.len() < MIN_RECORD_CHARS + length * 2 {
        return Err(LineIssue::NoRecord);
    }

    let data = (0..length)
        .map(|i| hex_byte(text, 9 + i * 2))
        .collect::<Result<Vec<u8>, _>>()?;
    let checksum = hex_byte(text, 9 + length * 2)?;

    let sum = data
        .iter()
        .fold(length as u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_add(addr_hi)
        .wrapping_add(addr_lo)
        .wrapping_add(kind_byte)
        .wrapping_add(checksum);
    if sum != 0 {
        return Err(LineIssue::InvalidChecksum);
    }

    let kind = RecordKind::from_byte(kind_byte);
    if kind == RecordKind::ExtendedLinearAddress && data.len() < 2 {
        return Err(LineIssue::NoRecord);
    }
    Ok(HexRecord {
        kind,
        address: u16::from_be_bytes([addr_hi, addr_lo]),
        data,
    })
}

/// Decoded firmware image.
///
/// The backing buffer has a fixed capacity and starts out erased (`0xFF`).
/// `len` counts the data bytes actually stored, which is the size sent to
/// the device.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    buffer: Vec<u8>,
    len: usize,
    upper_address: u32,
}

impl ProgramImage {
    pub fn new() -> Self {
        Self::with_capacity(PROGRAM_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0xFF; capacity],
            len: 0,
            upper_address: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Image bytes sent to the device.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len.min(self.buffer.len())]
    }

    /// Image bytes rounded up to whole words, padded with erased bytes.
    pub fn word_padded(&self) -> Vec<u8> {
        let mut out = self.bytes().to_vec();
        let padded = (out.len() + 3) & !3;
        out.resize(padded, 0xFF);
        out
    }

    pub fn crc(&self) -> u32 {
        crc32(self.bytes())
    }

    /// Absolute load address of a record offset.
    pub fn load_address(&self, offset: u16) -> u32 {
        self.upper_address | offset as u32
    }

    /// Apply a decoded record. Returns `false` if a data record had to be
    /// dropped because it falls outside the buffer.
    pub fn apply(&mut self, record: &HexRecord) -> bool {
        match record.kind {
            RecordKind::Data => {
                let start = self.load_address(record.address) as usize;
                let end = start + record.data.len();
                if end > self.buffer.len() {
                    return false;
                }
                self.buffer[start..end].copy_from_slice(&record.data);
                self.len += record.data.len();
                true
            }
            RecordKind::ExtendedLinearAddress => {
                self.upper_address = (u16::from_be_bytes([record.data[0], record.data[1]]) as u32) << 16;
                true
            }
            RecordKind::EndOfFile | RecordKind::Other(_) => true,
        }
    }
}

impl Default for ProgramImage {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of reading a whole HEX text.
#[derive(Debug)]
pub struct HexReport {
    pub image: ProgramImage,
    /// `(line number, issue)` in file order, 1-based lines.
    pub issues: Vec<(usize, LineIssue)>,
    /// The last record in the file was a valid end-of-file record.
    pub ends_with_eof: bool,
    /// Data records dropped for not fitting the buffer.
    pub skipped_records: usize,
}

impl HexReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|(_, issue)| issue.is_error())
    }

    /// File-level verdict. A checksum problem outranks any other record
    /// problem; a missing end record fails an otherwise clean file.
    pub fn into_image(self) -> Upc2Result<ProgramImage> {
        let errors = || self.issues.iter().filter(|(_, issue)| issue.is_error());
        if let Some((line, _)) = errors().find(|(_, i)| *i == LineIssue::InvalidChecksum) {
            return Err(Upc2Error::HexChecksum { line: *line });
        }
        if let Some((line, issue)) = errors().next() {
            return Err(Upc2Error::HexFile {
                line: *line,
                reason: issue.description(),
            });
        }
        if !self.ends_with_eof {
            return Err(Upc2Error::HexFile {
                line: 0,
                reason: "missing end-of-file record".into(),
            });
        }
        Ok(self.image)
    }
}

/// Read HEX text into an image of the given capacity.
pub fn parse_hex_with_capacity(content: &str, capacity: usize) -> HexReport {
    let mut report = HexReport {
        image: ProgramImage::with_capacity(capacity),
        issues: Vec::new(),
        ends_with_eof: false,
        skipped_records: 0,
    };

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        match parse_hex_line(line) {
            Ok(record) => {
                report.ends_with_eof = record.kind == RecordKind::EndOfFile;
                if let RecordKind::Other(t) = record.kind {
                    warn!("Unknown record type {:02X} at line {}", t, line_no);
                    report.issues.push((line_no, LineIssue::UnknownType(t)));
                }
                if !report.image.apply(&record) {
                    debug!("Record at line {} does not fit the program buffer", line_no);
                    report.skipped_records += 1;
                }
            }
            Err(issue) => {
                warn!("HEX line {}: {}", line_no, issue.description());
                report.ends_with_eof = false;
                report.issues.push((line_no, issue));
            }
        }
    }
    report
}

pub fn parse_hex(content: &str) -> HexReport {
    parse_hex_with_capacity(content, PROGRAM_BUFFER_SIZE)
}

/// Read an Intel HEX file into a program image.
///
/// # Arguments
/// * `path` - Path to the `.hex` file
///
/// # Returns
/// The decoded image; its `len()` is the byte count to program.
pub fn read_hex_file<P: AsRef<Path>>(path: P) -> Upc2Result<ProgramImage> {
    let path = path.as_ref();
    let content = fs::read(path).map_err(|source| Upc2Error::FileOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let image = parse_hex(&String::from_utf8_lossy(&content)).into_image()?;
    debug!("Read {} bytes of firmware from {}", image.len(), path.display());
    Ok(image)
}
