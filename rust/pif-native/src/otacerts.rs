//! Entry listing for the OTA certificate archive.
//!
//! Only the central directory of the zip is read: the companion needs the
//! entry names, never their contents. ZIP64 archives are not supported;
//! the platform's `otacerts.zip` holds a handful of small PEM files.

use std::fs;
use std::path::Path;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const EOCD_MIN_LEN: usize = 22;
const CENTRAL_HEADER_LEN: usize = 46;
const MAX_COMMENT_LEN: usize = u16::MAX as usize;

/// Errors raised while listing an archive.
#[derive(Debug)]
pub enum ArchiveError {
    /// The archive could not be read.
    Io(std::io::Error),
    /// No end-of-central-directory record was found.
    MissingDirectory,
    /// A central directory record points outside the file.
    Truncated,
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "cannot read archive: {}", err),
            ArchiveError::MissingDirectory => write!(f, "end of central directory not found"),
            ArchiveError::Truncated => write!(f, "central directory is truncated"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io(err)
    }
}

fn u16_at(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Locate the end-of-central-directory record, scanning back over a trailing comment.
fn find_eocd(data: &[u8]) -> Option<usize> {
    if data.len() < EOCD_MIN_LEN {
        return None;
    }
    let last = data.len() - EOCD_MIN_LEN;
    let first = last.saturating_sub(MAX_COMMENT_LEN);
    (first..=last)
        .rev()
        .find(|&at| u32_at(data, at) == Some(EOCD_SIGNATURE))
}

/// List entry names from raw zip bytes.
pub fn entry_names(data: &[u8]) -> Result<Vec<String>, ArchiveError> {
    let eocd = find_eocd(data).ok_or(ArchiveError::MissingDirectory)?;
    let count = u16_at(data, eocd + 10).ok_or(ArchiveError::Truncated)? as usize;
    let mut at = u32_at(data, eocd + 16).ok_or(ArchiveError::Truncated)? as usize;

    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        if u32_at(data, at) != Some(CENTRAL_HEADER_SIGNATURE) {
            return Err(ArchiveError::Truncated);
        }
        let name_len = u16_at(data, at + 28).ok_or(ArchiveError::Truncated)? as usize;
        let extra_len = u16_at(data, at + 30).ok_or(ArchiveError::Truncated)? as usize;
        let comment_len = u16_at(data, at + 32).ok_or(ArchiveError::Truncated)? as usize;

        let name_start = at + CENTRAL_HEADER_LEN;
        let name = data
            .get(name_start..name_start + name_len)
            .ok_or(ArchiveError::Truncated)?;
        names.push(String::from_utf8_lossy(name).into_owned());

        at = name_start + name_len + extra_len + comment_len;
    }
    Ok(names)
}

/// Whether any entry name in the archive at `path` contains `needle`.
pub fn has_entry_containing(path: &Path, needle: &str) -> Result<bool, ArchiveError> {
    let data = fs::read(path)?;
    Ok(entry_names(&data)?.iter().any(|name| name.contains(needle)))
}

/// Build a minimal stored zip with empty entries. Test fixture shared with the companion tests.
#[cfg(test)]
pub(crate) fn build_zip(names: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(out.len() as u32);
        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&[0; 12]); // crc, sizes
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    let cd_start = out.len() as u32;
    for (name, offset) in names.iter().zip(&offsets) {
        out.extend_from_slice(&CENTRAL_HEADER_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&[0; 12]); // crc, sizes
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 12]); // extra, comment, disk, attrs
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    let cd_len = out.len() as u32 - cd_start;
    out.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&(names.len() as u16).to_le_bytes());
    out.extend_from_slice(&(names.len() as u16).to_le_bytes());
    out.extend_from_slice(&cd_len.to_le_bytes());
    out.extend_from_slice(&cd_start.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}
