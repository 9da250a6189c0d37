//! Direct-to-buffer RESP serialization.
//!
//! [`encode_command`] is the client write path: every command goes on the
//! wire as an array of bulk strings. [`Frame::serialize`] covers the full
//! frame enum so test servers can produce replies with the same code.

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

/// Serializes a command, given as string tokens, into `buf`.
///
/// Produces the standard client → server form: a RESP array of bulk
/// strings, e.g. `["CLUSTER", "SLOTS"]` becomes
/// `*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n`.
pub fn encode_command<T: AsRef<str>>(tokens: &[T], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    put_decimal(buf, tokens.len() as i64);
    for token in tokens {
        let bytes = token.as_ref().as_bytes();
        buf.put_u8(b'$');
        put_decimal(buf, bytes.len() as i64);
        buf.put_slice(bytes);
        buf.put_slice(b"\r\n");
    }
}

impl Frame {
    /// Serializes this frame into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Frame::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.put_u8(b':');
                put_decimal(buf, *n);
            }
            Frame::Bulk(data) => {
                buf.put_u8(b'$');
                put_decimal(buf, data.len() as i64);
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                buf.put_u8(b'*');
                put_decimal(buf, items.len() as i64);
                for item in items {
                    item.serialize(buf);
                }
            }
            Frame::Null => {
                buf.put_slice(b"_\r\n");
            }
            Frame::Map(pairs) => {
                buf.put_u8(b'%');
                put_decimal(buf, pairs.len() as i64);
                for (key, value) in pairs {
                    key.serialize(buf);
                    value.serialize(buf);
                }
            }
        }
    }
}

/// Writes a decimal integer followed by CRLF. Uses `itoa` for
/// stack-based formatting with no intermediate allocation.
fn put_decimal(buf: &mut BytesMut, n: i64) {
    let mut tmp = itoa::Buffer::new();
    buf.put_slice(tmp.format(n).as_bytes());
    buf.put_slice(b"\r\n");
}
