//! simpub wire format: everything two bus instances must agree on.
//!
//! Topic and service traffic travels as `"<name>:<payload>"` frames. The
//! name is UTF-8 and never contains the delimiter; the payload is opaque
//! bytes and may contain anything, because frames are split on the first
//! delimiter only. Discovery uses a small JSON announcement behind a magic
//! prefix so unrelated UDP traffic on the port is cheap to reject.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Separates the topic or service name from the payload.
pub const DELIMITER: u8 = b':';

/// Longest accepted topic or service name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Largest frame accepted on a topic or service stream.
/// Asset replies are the big ones; meshes and textures fit comfortably.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Prefix of a bus-generated failure reply. Handler-written replies are
/// never wrapped, so this is the only in-band marker on the service wire.
pub const ERROR_REPLY_PREFIX: &[u8] = b"\0simpub-error\0";

/// First bytes of every discovery datagram.
pub const ANNOUNCE_MAGIC: &[u8] = b"SIMPUB1";

/// Announcements larger than this are refused at encode time.
pub const MAX_DATAGRAM_LEN: usize = 8192;

// ── Port roles ────────────────────────────────────────────────────────────────

/// The three sockets every bus binds. Each role has a well-known port so
/// two hosts can rendezvous knowing nothing but each other's IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRole {
    /// UDP, announcements in and out.
    Discovery,
    /// TCP, lock-step request/reply.
    Service,
    /// TCP, one-to-many topic broadcast.
    Topic,
}

impl PortRole {
    pub const ALL: [PortRole; 3] = [PortRole::Discovery, PortRole::Service, PortRole::Topic];

    pub const fn default_port(self) -> u16 {
        match self {
            PortRole::Discovery => 7720,
            PortRole::Service => 7721,
            PortRole::Topic => 7722,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PortRole::Discovery => "discovery",
            PortRole::Service => "service",
            PortRole::Topic => "topic",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame has no ':' delimiter")]
    MissingDelimiter,
    #[error("name is empty")]
    EmptyName,
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
    #[error("name {0:?} contains the ':' delimiter")]
    NameContainsDelimiter(String),
    #[error("name is {0} bytes, limit is {}", MAX_NAME_LEN)]
    NameTooLong(usize),
    #[error("datagram is not a simpub announcement")]
    NotAnnouncement,
    #[error("malformed announcement: {0}")]
    MalformedAnnouncement(#[source] serde_json::Error),
    #[error("announcement is {0} bytes, limit is {}", MAX_DATAGRAM_LEN)]
    DatagramTooLarge(usize),
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Check that `name` can be used as a topic or service name.
pub fn validate_name(name: &str) -> Result<(), WireError> {
    if name.is_empty() {
        return Err(WireError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.len()));
    }
    if name.as_bytes().contains(&DELIMITER) {
        return Err(WireError::NameContainsDelimiter(name.to_string()));
    }
    Ok(())
}

/// Split a frame on its first delimiter into `(name, payload)`.
pub fn split_frame(frame: &[u8]) -> Result<(&str, &[u8]), WireError> {
    let at = frame
        .iter()
        .position(|b| *b == DELIMITER)
        .ok_or(WireError::MissingDelimiter)?;
    if at == 0 {
        return Err(WireError::EmptyName);
    }
    let name = std::str::from_utf8(&frame[..at]).map_err(|_| WireError::InvalidUtf8)?;
    Ok((name, &frame[at + 1..]))
}

/// Build `"<name>:<payload>"`. The caller is responsible for `name` having
/// passed [`validate_name`].
pub fn join_frame(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(name.len() + 1 + payload.len());
    frame.extend_from_slice(name.as_bytes());
    frame.push(DELIMITER);
    frame.extend_from_slice(payload);
    frame
}

/// Build a bus-generated failure reply.
pub fn error_reply(reason: &str) -> Vec<u8> {
    let mut reply = Vec::with_capacity(ERROR_REPLY_PREFIX.len() + reason.len());
    reply.extend_from_slice(ERROR_REPLY_PREFIX);
    reply.extend_from_slice(reason.as_bytes());
    reply
}

/// If `reply` is a bus-generated failure, return its reason.
pub fn parse_error_reply(reply: &[u8]) -> Option<String> {
    reply
        .strip_prefix(ERROR_REPLY_PREFIX)
        .map(|reason| String::from_utf8_lossy(reason).into_owned())
}

// ── Announcement ──────────────────────────────────────────────────────────────

/// Periodic discovery datagram: who I am, where to reach me, what I offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Random per-process identity. Survives renames; changes on restart.
    pub instance_id: u64,
    /// Display name: the registry key on the receiving side.
    pub name: String,
    /// Address peers should connect to. Unspecified = use the datagram source.
    pub addr: IpAddr,
    pub topic_port: u16,
    pub service_port: u16,
    /// Services this bus answers on its service port.
    pub services: Vec<String>,
    /// Topics this bus publishes on its topic port.
    pub topics: Vec<String>,
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = serde_json::to_vec(self).map_err(WireError::MalformedAnnouncement)?;
        let len = ANNOUNCE_MAGIC.len() + body.len();
        if len > MAX_DATAGRAM_LEN {
            return Err(WireError::DatagramTooLarge(len));
        }
        let mut datagram = Vec::with_capacity(len);
        datagram.extend_from_slice(ANNOUNCE_MAGIC);
        datagram.extend_from_slice(&body);
        Ok(datagram)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let body = datagram
            .strip_prefix(ANNOUNCE_MAGIC)
            .ok_or(WireError::NotAnnouncement)?;
        serde_json::from_slice(body).map_err(WireError::MalformedAnnouncement)
    }
}
