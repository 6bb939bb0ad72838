//! memcached binary protocol framing.
//!
//! Every packet starts with a fixed 24-byte header followed by extras, key
//! and value, in that order:
//!
//! ```text
//!  0      1       2..4       4        5          6..8            8..12      12..16   16..24
//! magic opcode  key len  extras len  dtype  vbucket / status  body len   opaque    cas
//! ```
//!
//! Requests carry magic `0x80` and a vbucket id in bytes 6..8; responses
//! carry magic `0x81` and a status code there. TAP streams reuse request
//! framing for packets pushed by the server.

use std::fmt;
use std::io::Read;

use crate::error::ClientError;

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 24;

/// Magic byte of a request packet.
pub const REQ_MAGIC: u8 = 0x80;

/// Magic byte of a response packet.
pub const RES_MAGIC: u8 = 0x81;

/// Largest body accepted from the wire.
pub const MAX_BODY_LEN: usize = 22_000_000;

/// Largest key the 16-bit key length field can describe.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Largest extras section the 8-bit extras length field can describe.
pub const MAX_EXTRAS_LEN: usize = u8::MAX as usize;

/// Command opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const GET: Opcode = Opcode(0x00);
    pub const SET: Opcode = Opcode(0x01);
    pub const NOOP: Opcode = Opcode(0x0a);
    pub const SASL_LIST_MECHS: Opcode = Opcode(0x20);
    pub const SASL_AUTH: Opcode = Opcode(0x21);
    pub const TAP_CONNECT: Opcode = Opcode(0x40);
    pub const TAP_MUTATION: Opcode = Opcode(0x41);
    pub const TAP_DELETE: Opcode = Opcode(0x42);
    pub const TAP_FLUSH: Opcode = Opcode(0x43);
    pub const TAP_OPAQUE: Opcode = Opcode(0x44);
    pub const TAP_VBUCKET_SET: Opcode = Opcode(0x45);
    pub const TAP_CHECKPOINT_START: Opcode = Opcode(0x46);
    pub const TAP_CHECKPOINT_END: Opcode = Opcode(0x47);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Opcode::GET => "GET",
            Opcode::SET => "SET",
            Opcode::NOOP => "NOOP",
            Opcode::SASL_LIST_MECHS => "SASL_LIST_MECHS",
            Opcode::SASL_AUTH => "SASL_AUTH",
            Opcode::TAP_CONNECT => "TAP_CONNECT",
            Opcode::TAP_MUTATION => "TAP_MUTATION",
            Opcode::TAP_DELETE => "TAP_DELETE",
            Opcode::TAP_FLUSH => "TAP_FLUSH",
            Opcode::TAP_OPAQUE => "TAP_OPAQUE",
            Opcode::TAP_VBUCKET_SET => "TAP_VBUCKET_SET",
            Opcode::TAP_CHECKPOINT_START => "TAP_CHECKPOINT_START",
            Opcode::TAP_CHECKPOINT_END => "TAP_CHECKPOINT_END",
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "opcode 0x{:02x}", self.0),
        }
    }
}

/// Response status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    pub const KEY_ENOENT: Status = Status(0x01);
    pub const KEY_EEXISTS: Status = Status(0x02);
    pub const E2BIG: Status = Status(0x03);
    pub const EINVAL: Status = Status(0x04);
    pub const NOT_STORED: Status = Status(0x05);
    pub const NOT_MY_VBUCKET: Status = Status(0x07);
    pub const AUTH_ERROR: Status = Status(0x20);
    pub const AUTH_CONTINUE: Status = Status(0x21);
    pub const UNKNOWN_COMMAND: Status = Status(0x81);
    pub const ENOMEM: Status = Status(0x82);
    pub const TMPFAIL: Status = Status(0x86);

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Status::SUCCESS => "SUCCESS",
            Status::KEY_ENOENT => "KEY_ENOENT",
            Status::KEY_EEXISTS => "KEY_EEXISTS",
            Status::E2BIG => "E2BIG",
            Status::EINVAL => "EINVAL",
            Status::NOT_STORED => "NOT_STORED",
            Status::NOT_MY_VBUCKET => "NOT_MY_VBUCKET",
            Status::AUTH_ERROR => "AUTH_ERROR",
            Status::AUTH_CONTINUE => "AUTH_CONTINUE",
            Status::UNKNOWN_COMMAND => "UNKNOWN_COMMAND",
            Status::ENOMEM => "ENOMEM",
            Status::TMPFAIL => "TMPFAIL",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "status 0x{:04x}", self.0),
        }
    }
}

/// A request packet (client to server, or server-pushed TAP packet).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_key(self, key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }

    pub fn with_extras(self, extras: impl Into<Vec<u8>>) -> Self {
        Self {
            extras: extras.into(),
            ..self
        }
    }

    pub fn with_body(self, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..self
        }
    }

    /// Check that every section fits its header length field.
    pub fn validate(&self) -> Result<(), ClientError> {
        check_lengths(&self.extras, &self.key, &self.body)
    }

    /// Serialize the packet. Sections must pass [`validate`](Self::validate).
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(
            REQ_MAGIC,
            self.opcode,
            self.vbucket,
            self.opaque,
            self.cas,
            &self.extras,
            &self.key,
            &self.body,
        )
    }
}

/// A response packet (server to client, or a client TAP acknowledgement).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(opcode: Opcode, status: Status) -> Self {
        Self {
            opcode,
            status,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(self, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        check_lengths(&self.extras, &self.key, &self.body)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(
            RES_MAGIC,
            self.opcode,
            self.status.0,
            self.opaque,
            self.cas,
            &self.extras,
            &self.key,
            &self.body,
        )
    }
}

/// A decoded packet of either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

fn check_lengths(extras: &[u8], key: &[u8], body: &[u8]) -> Result<(), ClientError> {
    if key.len() > MAX_KEY_LEN {
        return Err(ClientError::Frame(format!(
            "key length {} exceeds {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if extras.len() > MAX_EXTRAS_LEN {
        return Err(ClientError::Frame(format!(
            "extras length {} exceeds {MAX_EXTRAS_LEN}",
            extras.len()
        )));
    }
    let total = extras.len() + key.len() + body.len();
    if total > MAX_BODY_LEN {
        return Err(ClientError::Frame(format!(
            "body length {total} exceeds {MAX_BODY_LEN}"
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_frame(
    magic: u8,
    opcode: Opcode,
    vbucket_or_status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    body: &[u8],
) -> Vec<u8> {
    debug_assert!(check_lengths(extras, key, body).is_ok());
    let total = extras.len() + key.len() + body.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + total);
    buf.push(magic);
    buf.push(opcode.0);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.push(extras.len() as u8);
    buf.push(0); // raw bytes data type
    buf.extend_from_slice(&vbucket_or_status.to_be_bytes());
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(&cas.to_be_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(body);
    buf
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Read one complete packet from `reader`.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Frame, ClientError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let magic = header[0];
    if magic != REQ_MAGIC && magic != RES_MAGIC {
        return Err(ClientError::Frame(format!("bad magic 0x{magic:02x}")));
    }

    let opcode = Opcode(header[1]);
    let key_len = be_u16(&header[2..4]) as usize;
    let extras_len = header[4] as usize;
    let vbucket_or_status = be_u16(&header[6..8]);
    let total = be_u32(&header[8..12]) as usize;
    let opaque = be_u32(&header[12..16]);
    let cas = be_u64(&header[16..24]);

    if total > MAX_BODY_LEN {
        return Err(ClientError::Frame(format!(
            "body length {total} exceeds {MAX_BODY_LEN}"
        )));
    }
    if extras_len + key_len > total {
        return Err(ClientError::Frame(format!(
            "extras ({extras_len}) and key ({key_len}) exceed body length {total}"
        )));
    }

    let mut payload = vec![0u8; total];
    reader.read_exact(&mut payload)?;
    let body = payload.split_off(extras_len + key_len);
    let key = payload.split_off(extras_len);
    let extras = payload;

    Ok(if magic == REQ_MAGIC {
        Frame::Request(Request {
            opcode,
            vbucket: vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            body,
        })
    } else {
        Frame::Response(Response {
            opcode,
            status: Status(vbucket_or_status),
            opaque,
            cas,
            extras,
            key,
            body,
        })
    })
}
