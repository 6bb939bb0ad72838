//! TAP streaming feed.
//!
//! Sending `TAP_CONNECT` turns a connection into a one-way stream of
//! server-pushed packets. The connection cannot carry ordinary requests
//! afterwards, so [`TapFeed`] takes ownership of its transport and reads it on
//! a dedicated thread, delivering decoded [`TapEvent`]s over a bounded channel.

use std::io::Write;
use std::net::{Shutdown, TcpStream};

use tokio::sync::mpsc;

use super::protocol::{Frame, Opcode, Request, Response, Status, read_frame};
use super::transport::Transport;
use crate::error::ClientError;

/// `TAP_CONNECT` flags.
pub mod flags {
    pub const BACKFILL: u32 = 0x01;
    pub const DUMP: u32 = 0x02;
    pub const LIST_VBUCKETS: u32 = 0x04;
    pub const TAKEOVER_VBUCKETS: u32 = 0x08;
    pub const SUPPORT_ACK: u32 = 0x10;
    pub const REQUEST_KEYS_ONLY: u32 = 0x20;
    pub const CHECKPOINT: u32 = 0x40;
}

/// Per-packet flag asking the client to acknowledge.
const TAP_ACK: u16 = 0x01;

/// Events buffered between the reader thread and the consumer.
const FEED_BUFFER: usize = 16;

/// Parameters of a `TAP_CONNECT` request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TapArguments {
    /// Replay changes since this timestamp (0 disables backfill).
    pub backfill: u64,
    /// Dump current contents, then end the stream.
    pub dump: bool,
    /// Restrict the stream to these vbuckets (empty means all).
    pub vbuckets: Vec<u16>,
    /// Take over the listed vbuckets once the stream completes.
    pub takeover: bool,
    /// Client acknowledges packets flagged with TAP_ACK.
    pub support_ack: bool,
    /// Send keys without values.
    pub keys_only: bool,
    /// Stream checkpoint markers.
    pub checkpoint: bool,
    /// Name of a registered TAP client; empty for an anonymous stream.
    pub client_name: String,
}

impl TapArguments {
    pub fn flags(&self) -> u32 {
        let mut f = 0;
        if self.backfill != 0 {
            f |= flags::BACKFILL;
        }
        if self.dump {
            f |= flags::DUMP;
        }
        if !self.vbuckets.is_empty() {
            f |= flags::LIST_VBUCKETS;
        }
        if self.takeover {
            f |= flags::TAKEOVER_VBUCKETS;
        }
        if self.support_ack {
            f |= flags::SUPPORT_ACK;
        }
        if self.keys_only {
            f |= flags::REQUEST_KEYS_ONLY;
        }
        if self.checkpoint {
            f |= flags::CHECKPOINT;
        }
        f
    }

    /// Encode as a `TAP_CONNECT` request.
    pub fn to_request(&self) -> Result<Request, ClientError> {
        let mut body = Vec::new();
        if self.backfill != 0 {
            body.extend_from_slice(&self.backfill.to_be_bytes());
        }
        if !self.vbuckets.is_empty() {
            let count = u16::try_from(self.vbuckets.len()).map_err(|_| {
                ClientError::Frame(format!(
                    "{} vbuckets exceed {}",
                    self.vbuckets.len(),
                    u16::MAX
                ))
            })?;
            body.extend_from_slice(&count.to_be_bytes());
            for vb in &self.vbuckets {
                body.extend_from_slice(&vb.to_be_bytes());
            }
        }

        let req = Request::new(Opcode::TAP_CONNECT)
            .with_extras(self.flags().to_be_bytes().to_vec())
            .with_key(self.client_name.as_bytes())
            .with_body(body);
        req.validate()?;
        Ok(req)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapEventKind {
    Mutation,
    Deletion,
    Flush,
    Opaque,
    VBucketSet,
    CheckpointStart,
    CheckpointEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
    Unknown(u32),
}

impl From<u32> for VBucketState {
    fn from(raw: u32) -> Self {
        match raw {
            1 => VBucketState::Active,
            2 => VBucketState::Replica,
            3 => VBucketState::Pending,
            4 => VBucketState::Dead,
            other => VBucketState::Unknown(other),
        }
    }
}

/// A change pushed by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapEvent {
    pub kind: TapEventKind,
    pub vbucket: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub cas: u64,
    /// Item flags (mutations only).
    pub flags: u32,
    /// Item expiration (mutations only).
    pub expiry: u32,
    /// New state (vbucket-set events only).
    pub vbucket_state: Option<VBucketState>,
}

impl TapEvent {
    /// Decode a server-pushed packet. Returns `None` for packets that carry no
    /// event (NOOP keepalives, unknown opcodes).
    pub fn from_request(req: &Request) -> Option<TapEvent> {
        let kind = match req.opcode {
            Opcode::TAP_MUTATION => TapEventKind::Mutation,
            Opcode::TAP_DELETE => TapEventKind::Deletion,
            Opcode::TAP_FLUSH => TapEventKind::Flush,
            Opcode::TAP_OPAQUE => TapEventKind::Opaque,
            Opcode::TAP_VBUCKET_SET => TapEventKind::VBucketSet,
            Opcode::TAP_CHECKPOINT_START => TapEventKind::CheckpointStart,
            Opcode::TAP_CHECKPOINT_END => TapEventKind::CheckpointEnd,
            _ => return None,
        };

        let mut event = TapEvent {
            kind,
            vbucket: req.vbucket,
            key: req.key.clone(),
            value: req.body.clone(),
            cas: req.cas,
            flags: 0,
            expiry: 0,
            vbucket_state: None,
        };

        // engine-private(2) tap-flags(2) ttl(1) reserved(3) item-flags(4) expiry(4)
        if kind == TapEventKind::Mutation && req.extras.len() >= 16 {
            let e = &req.extras;
            event.flags = u32::from_be_bytes([e[8], e[9], e[10], e[11]]);
            event.expiry = u32::from_be_bytes([e[12], e[13], e[14], e[15]]);
        }
        if kind == TapEventKind::VBucketSet && req.body.len() >= 4 {
            let b = &req.body;
            event.vbucket_state = Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]).into());
        }

        Some(event)
    }
}

fn wants_ack(req: &Request) -> bool {
    req.extras.len() >= 4 && u16::from_be_bytes([req.extras[2], req.extras[3]]) & TAP_ACK != 0
}

/// A running TAP stream. Owns the connection it was started on; dropping or
/// closing the feed shuts that connection down.
#[derive(Debug)]
pub struct TapFeed {
    events: mpsc::Receiver<Result<TapEvent, ClientError>>,
    shutdown: Option<TcpStream>,
}

impl TapFeed {
    /// Hand `transport` (already past `TAP_CONNECT`) to a reader thread.
    pub(crate) fn spawn(transport: Transport) -> Result<Self, ClientError> {
        let shutdown = transport.shutdown_handle()?;
        let (tx, rx) = mpsc::channel(FEED_BUFFER);

        std::thread::Builder::new()
            .name("tap-feed".to_string())
            .spawn(move || read_events(transport, tx))?;

        Ok(Self {
            events: rx,
            shutdown: Some(shutdown),
        })
    }

    /// Next event, or `None` once the stream has ended.
    ///
    /// A transport or server error is delivered once as `Some(Err(_))`
    /// before the stream ends.
    pub async fn next(&mut self) -> Option<Result<TapEvent, ClientError>> {
        self.events.recv().await
    }

    /// Blocking variant of [`next`](Self::next) for use outside a runtime.
    pub fn blocking_next(&mut self) -> Option<Result<TapEvent, ClientError>> {
        self.events.blocking_recv()
    }

    /// Stop the stream and close the underlying connection. The work happens
    /// in `Drop`; this just consumes the feed.
    pub fn close(self) {}
}

impl Drop for TapFeed {
    fn drop(&mut self) {
        self.events.close();
        if let Some(stream) = self.shutdown.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn read_events(mut transport: Transport, tx: mpsc::Sender<Result<TapEvent, ClientError>>) {
    loop {
        let frame = match read_frame(&mut transport) {
            Ok(frame) => frame,
            Err(err) => {
                // A closed receiver means the feed was shut down on purpose.
                if !tx.is_closed() {
                    tracing::debug!(error = %err, "tap feed ended");
                    let _ = tx.blocking_send(Err(err));
                }
                break;
            }
        };

        match frame {
            Frame::Request(req) => {
                if wants_ack(&req) {
                    let mut ack = Response::new(req.opcode, Status::SUCCESS);
                    ack.opaque = req.opaque;
                    if let Err(err) = transport.write_all(&ack.encode()) {
                        let _ = tx.blocking_send(Err(err.into()));
                        break;
                    }
                }
                if let Some(event) = TapEvent::from_request(&req) {
                    if tx.blocking_send(Ok(event)).is_err() {
                        break;
                    }
                }
            }
            Frame::Response(res) if !res.status.is_success() => {
                let _ = tx.blocking_send(Err(ClientError::Status {
                    opcode: res.opcode,
                    status: res.status,
                }));
                break;
            }
            Frame::Response(_) => {}
        }
    }
    transport.shutdown();
}
