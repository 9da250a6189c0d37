//! cinder-protocol: RESP wire protocol for Redis-compatible servers.
//!
//! Client-side subset of RESP2/RESP3: parsing the frames a server sends
//! and serializing the token-array command form a client sends.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use cinder_protocol::{encode_command, parse_frame, Frame};
//!
//! // serialize a command
//! let mut buf = BytesMut::new();
//! encode_command(&["PING"], &mut buf);
//! assert_eq!(&buf[..], b"*1\r\n$4\r\nPING\r\n");
//!
//! // parse a reply
//! let (frame, consumed) = parse_frame(b"+PONG\r\n").unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("PONG".into()));
//! assert_eq!(consumed, 7);
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use serialize::encode_command;
pub use types::Frame;
