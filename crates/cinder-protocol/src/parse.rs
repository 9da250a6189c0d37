//! Incremental RESP reply parser.
//!
//! Operates on a buffered byte slice. The caller reads data from the
//! network into its own buffer; the parser either produces a complete
//! frame plus the number of bytes consumed, or reports that more data is
//! needed so the caller can retry after the next read.
//!
//! Accepts both RESP3 frames and the RESP2 forms a cluster speaks by
//! default: `$-1\r\n` and `*-1\r\n` parse as [`Frame::Null`] alongside the
//! RESP3 `_\r\n`.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Maximum nesting depth for arrays and maps. Prevents stack overflow
/// from malformed deeply-nested frames.
const MAX_NESTING_DEPTH: usize = 32;

/// Maximum number of elements in an array or map.
const MAX_ELEMENTS: i64 = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for `Vec::with_capacity` in array/map parsing. A declared count in
/// the millions would otherwise pre-allocate a huge Vec before a single
/// child frame has been validated.
const PREALLOC_CAP: usize = 1024;

/// Parses one frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` if a complete frame was parsed,
/// `Ok(None)` if the buffer doesn't contain enough data yet,
/// or `Err(...)` if the data is malformed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            Ok(Some((frame, consumed)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep);
    }

    let prefix = get_u8(cursor)?;
    match prefix {
        b'+' => {
            let line = get_line(cursor)?;
            Ok(Frame::Simple(String::from_utf8_lossy(line).into_owned()))
        }
        b'-' => {
            let line = get_line(cursor)?;
            Ok(Frame::Error(String::from_utf8_lossy(line).into_owned()))
        }
        b':' => {
            let line = get_line(cursor)?;
            Ok(Frame::Integer(parse_int(line)?))
        }
        b'$' => {
            let len = parse_int(get_line(cursor)?)?;
            if len == -1 {
                // RESP2 null bulk string
                return Ok(Frame::Null);
            }
            if len < 0 || len > MAX_BULK_LEN {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            let data = get_exact(cursor, len as usize)?;
            let frame = Frame::Bulk(Bytes::copy_from_slice(data));
            expect_crlf(cursor)?;
            Ok(frame)
        }
        b'*' => {
            let len = parse_int(get_line(cursor)?)?;
            if len == -1 {
                // RESP2 null array
                return Ok(Frame::Null);
            }
            if len < 0 || len > MAX_ELEMENTS {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            let mut items = Vec::with_capacity((len as usize).min(PREALLOC_CAP));
            for _ in 0..len {
                items.push(try_parse(cursor, depth + 1)?);
            }
            Ok(Frame::Array(items))
        }
        b'%' => {
            let len = parse_int(get_line(cursor)?)?;
            if len < 0 || len > MAX_ELEMENTS {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            let mut pairs = Vec::with_capacity((len as usize).min(PREALLOC_CAP));
            for _ in 0..len {
                let key = try_parse(cursor, depth + 1)?;
                let value = try_parse(cursor, depth + 1)?;
                pairs.push((key, value));
            }
            Ok(Frame::Map(pairs))
        }
        b'_' => {
            let line = get_line(cursor)?;
            if !line.is_empty() {
                return Err(ProtocolError::BadLineTerminator);
            }
            Ok(Frame::Null)
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

fn get_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    let byte = *buf.get(pos).ok_or(ProtocolError::Incomplete)?;
    cursor.set_position(pos as u64 + 1);
    Ok(byte)
}

/// Reads up to (not including) the next CRLF, consuming the terminator.
fn get_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let buf = *cursor.get_ref();

    let mut i = start;
    while i < buf.len() {
        match buf[i] {
            b'\r' => {
                let Some(&next) = buf.get(i + 1) else {
                    return Err(ProtocolError::Incomplete);
                };
                if next != b'\n' {
                    return Err(ProtocolError::BadLineTerminator);
                }
                cursor.set_position(i as u64 + 2);
                return Ok(&buf[start..i]);
            }
            b'\n' => return Err(ProtocolError::BadLineTerminator),
            _ => i += 1,
        }
    }
    Err(ProtocolError::Incomplete)
}

fn get_exact<'a>(cursor: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let buf = *cursor.get_ref();
    if buf.len() < start + n {
        return Err(ProtocolError::Incomplete);
    }
    cursor.set_position((start + n) as u64);
    Ok(&buf[start..start + n])
}

fn expect_crlf(cursor: &mut Cursor<&[u8]>) -> Result<(), ProtocolError> {
    let terminator = get_exact(cursor, 2)?;
    if terminator != b"\r\n" {
        return Err(ProtocolError::BadLineTerminator);
    }
    Ok(())
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    let s = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidInteger)?;
    s.parse().map_err(|_| ProtocolError::InvalidInteger)
}
