//! MOVED / ASK redirect parsing.
//!
//! When a node answers a command with `-MOVED <slot> <host:port>` or
//! `-ASK <slot> <host:port>`, the local slot map is stale (MOVED) or the
//! slot is mid-migration (ASK). Command routers parse the reply with
//! [`Redirect::parse`], connect the target via
//! [`ClusterClient::connect_node`](crate::ClusterClient::connect_node),
//! and report the staleness via
//! [`ClusterClient::update_slots`](crate::ClusterClient::update_slots).

use cinder_node::Addr;
use cinder_protocol::Frame;

use crate::slots::SLOT_COUNT;

/// The two redirect flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// The slot has moved permanently; refresh the slot map.
    Moved,
    /// One-shot redirect during slot migration; do not refresh.
    Ask,
}

/// A parsed redirect reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub addr: Addr,
}

impl Redirect {
    /// Parses a reply frame as a redirect, if it is one.
    ///
    /// Returns `None` for non-error frames and for error replies that are
    /// not well-formed redirects.
    pub fn parse(frame: &Frame) -> Option<Redirect> {
        let Frame::Error(msg) = frame else {
            return None;
        };
        let mut parts = msg.split_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot: u16 = parts.next()?.parse().ok()?;
        if slot >= SLOT_COUNT {
            return None;
        }
        let addr: Addr = parts.next()?.parse().ok()?;
        Some(Redirect { kind, slot, addr })
    }
}
