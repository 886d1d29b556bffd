//! Length-prefixed framing over a connected byte stream.
//!
//! Both ends of the module/companion socket run on the same device, so the
//! 4-byte length prefix uses the native byte order. There is no message
//! envelope beyond `length + bytes`: each side knows the order and size of
//! what it expects next.
//!
//! The counted helpers keep the partial-transfer semantics of `read(2)` and
//! `write(2)` loops: `Interrupted` is retried, an error before any byte moved
//! is a channel failure, and an error after a partial transfer returns the
//! partial count so the caller can decide.

use std::io::{self, ErrorKind, Read, Write};

/// Errors raised by the framing helpers.
#[derive(Debug)]
pub enum ChannelError {
    /// The underlying stream failed before any byte was transferred.
    Io(io::Error),
    /// Fewer bytes were transferred than the frame requires.
    Short { expected: usize, actual: usize },
    /// The peer announced a frame larger than the receiver accepts.
    TooLarge { len: usize, max: usize },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Io(err) => write!(f, "channel I/O error: {}", err),
            ChannelError::Short { expected, actual } => {
                write!(f, "short transfer: expected {} bytes, got {}", expected, actual)
            }
            ChannelError::TooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds limit of {}", len, max)
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        ChannelError::Io(err)
    }
}

/// Read until `buf` is full, the peer closes, or the stream fails.
///
/// Returns the number of bytes read, which is less than `buf.len()` only on
/// EOF or on an error after a partial read.
pub fn read_all_counted<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ChannelError> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if total > 0 {
                    return Ok(total);
                }
                return Err(ChannelError::Io(e));
            }
        }
    }
    Ok(total)
}

/// Write all of `buf` unless the stream fails or stops accepting data.
///
/// Returns the number of bytes written, which is less than `buf.len()` only
/// when the writer reported zero progress or failed after a partial write.
pub fn write_all_counted<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> Result<usize, ChannelError> {
    let mut total = 0;
    while total < buf.len() {
        match writer.write(&buf[total..]) {
            // A writer that accepts nothing will not make progress on retry.
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if total > 0 {
                    return Ok(total);
                }
                return Err(ChannelError::Io(e));
            }
        }
    }
    Ok(total)
}

fn expect_full(expected: usize, actual: usize) -> Result<(), ChannelError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ChannelError::Short { expected, actual })
    }
}

/// Read exactly `len` bytes.
pub fn read_exact_len<R: Read + ?Sized>(reader: &mut R, len: usize) -> Result<Vec<u8>, ChannelError> {
    let mut buf = vec![0u8; len];
    let n = read_all_counted(reader, &mut buf)?;
    expect_full(len, n)?;
    Ok(buf)
}

/// Write a native-endian `u32` length followed by `payload`.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), ChannelError> {
    let len = u32::try_from(payload.len()).map_err(|_| ChannelError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let n = write_all_counted(writer, &len.to_ne_bytes())?;
    expect_full(4, n)?;
    let n = write_all_counted(writer, payload)?;
    expect_full(payload.len(), n)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame written by [`write_frame`], refusing lengths above `max_len`.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ChannelError> {
    let mut len_buf = [0u8; 4];
    let n = read_all_counted(reader, &mut len_buf)?;
    expect_full(4, n)?;
    let len = u32::from_ne_bytes(len_buf) as usize;
    if len > max_len {
        return Err(ChannelError::TooLarge { len, max: max_len });
    }
    read_exact_len(reader, len)
}

/// Write a single boolean byte.
pub fn write_bool<W: Write + ?Sized>(writer: &mut W, value: bool) -> Result<(), ChannelError> {
    let n = write_all_counted(writer, &[u8::from(value)])?;
    expect_full(1, n)?;
    writer.flush()?;
    Ok(())
}

/// Read a single boolean byte; any non-zero value is `true`.
pub fn read_bool<R: Read + ?Sized>(reader: &mut R) -> Result<bool, ChannelError> {
    let mut byte = [0u8; 1];
    let n = read_all_counted(reader, &mut byte)?;
    expect_full(1, n)?;
    Ok(byte[0] != 0)
}
