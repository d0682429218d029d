//! Per-socket TCP link state.
//!
//! A link is one peer-to-peer socket in exactly one phase of its life.
//! The engine owns every link's state and drives it from pump-task
//! messages; the structs here hold the state machine, the outgoing queue
//! used while a connection is still being established, and the inbound
//! byte accumulator that reassembles length-prefixed frames from partial
//! reads.
//!
//! ```text
//!  New ──► Listening
//!  New ──► Connecting ──► (SOCKS tunnel) ──► HelloWait ──► Framed ──► Raw
//!                                              ▲                 (chat only)
//!  accepted sockets start here ────────────────┘
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::FrameCodec;
use crate::error::TernError;
use crate::event::TCP_VERSION;
use crate::packet::Packet;
use crate::registry::SessionId;
use crate::socks::SocksPhase;

/// Deadline for a connect (including any proxy negotiation).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// First byte of every hello packet.
pub const HELLO_OPCODE: u8 = 0xFF;

/// Hello length floor, checked before any field is read.
pub const HELLO_MIN_LEN: usize = 26;

// ── LinkKind ─────────────────────────────────────────────────────

/// Determines framing mode and payload semantics of a TCP link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Message,
    Chat,
    File,
}

// ── LinkPhase ────────────────────────────────────────────────────

/// The current phase of a TCP link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPhase {
    /// Freshly created, no socket activity yet.
    #[default]
    New,

    /// Bound and accepting inbound connections on an ephemeral port.
    Listening,

    /// Non-blocking connect in flight.
    Connecting,

    /// Proxy tunnel negotiation in flight (5 ordered sub-phases).
    SocksTunnel(SocksPhase),

    /// Connection is up; the first inbound packet must be the hello.
    HelloWait,

    /// Steady state for message and file links: length-prefixed frames.
    Framed,

    /// Steady state for chat links after the font/color negotiation:
    /// unframed byte stream with inline control codes.
    Raw,
}

impl LinkPhase {
    /// Sends are deferred to the queue until the handshake completes.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            LinkPhase::New
                | LinkPhase::Connecting
                | LinkPhase::SocksTunnel(_)
                | LinkPhase::HelloWait
        )
    }

    pub fn is_established(&self) -> bool {
        matches!(self, LinkPhase::Framed | LinkPhase::Raw)
    }

    // ── Transitions ──────────────────────────────────────────────

    pub fn begin_listen(&mut self) -> Result<(), TernError> {
        match self {
            LinkPhase::New => {
                *self = LinkPhase::Listening;
                Ok(())
            }
            _ => Err(TernError::InvalidTransition("listen: link already started")),
        }
    }

    pub fn begin_connect(&mut self) -> Result<(), TernError> {
        match self {
            LinkPhase::New => {
                *self = LinkPhase::Connecting;
                Ok(())
            }
            _ => Err(TernError::InvalidTransition("connect: link already started")),
        }
    }

    pub fn enter_socks(&mut self, phase: SocksPhase) -> Result<(), TernError> {
        match self {
            LinkPhase::Connecting | LinkPhase::SocksTunnel(_) => {
                *self = LinkPhase::SocksTunnel(phase);
                Ok(())
            }
            _ => Err(TernError::InvalidTransition("socks: link not connecting")),
        }
    }

    pub fn enter_hello_wait(&mut self) -> Result<(), TernError> {
        match self {
            LinkPhase::Connecting | LinkPhase::SocksTunnel(_) => {
                *self = LinkPhase::HelloWait;
                Ok(())
            }
            _ => Err(TernError::InvalidTransition("hello: link not connecting")),
        }
    }

    pub fn enter_framed(&mut self) -> Result<(), TernError> {
        match self {
            LinkPhase::HelloWait => {
                *self = LinkPhase::Framed;
                Ok(())
            }
            _ => Err(TernError::InvalidTransition("framed: hello not complete")),
        }
    }

    pub fn enter_raw(&mut self) -> Result<(), TernError> {
        match self {
            LinkPhase::Framed => {
                *self = LinkPhase::Raw;
                Ok(())
            }
            _ => Err(TernError::InvalidTransition("raw: link not framed")),
        }
    }
}

// ── Hello ────────────────────────────────────────────────────────

/// The first packet on any peer link, advertising version, uin and
/// listen ports before any traffic is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u32,
    pub listen_port: u32,
    pub uin: u32,
    /// Externally visible address (host order).
    pub ip: u32,
    /// Address behind any NAT (host order).
    pub real_ip: u32,
    pub flags: u8,
    pub secondary_port: u32,
}

impl Hello {
    pub fn new(uin: u32, listen_port: u32, ip: u32, real_ip: u32) -> Self {
        Self {
            version: TCP_VERSION as u32,
            listen_port,
            uin,
            ip,
            real_ip,
            flags: 0x04,
            secondary_port: 0,
        }
    }

    pub fn build(&self) -> Result<Packet, TernError> {
        let mut p = Packet::new();
        p.append_u8(HELLO_OPCODE)?;
        p.append_u32(self.version)?;
        p.append_u32(self.listen_port)?;
        p.append_u32(self.uin)?;
        p.append_u32_net(self.ip)?;
        p.append_u32_net(self.real_ip)?;
        p.append_u8(self.flags)?;
        p.append_u32(self.secondary_port)?;
        Ok(p)
    }

    /// Length and opcode are validated before any dependent field is
    /// read.
    pub fn parse(p: &mut Packet) -> Result<Self, TernError> {
        if p.len() < HELLO_MIN_LEN {
            return Err(TernError::BadHello("below minimum length"));
        }
        p.goto(0)?;
        if p.read_u8()? != HELLO_OPCODE {
            return Err(TernError::BadHello("wrong opcode"));
        }
        Ok(Hello {
            version: p.read_u32()?,
            listen_port: p.read_u32()?,
            uin: p.read_u32()?,
            ip: p.read_u32_net()?,
            real_ip: p.read_u32_net()?,
            flags: p.read_u8()?,
            secondary_port: p.read_u32()?,
        })
    }
}

// ── Link ─────────────────────────────────────────────────────────

/// Bytes handed to a writer pump task.
pub type WriterTx = mpsc::UnboundedSender<Vec<u8>>;

/// What happened to a packet handed to [`Link::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket writer.
    Sent,
    /// Deferred; the link is still being established.
    Queued,
}

/// Engine-side state for one TCP link.
#[derive(Debug)]
pub struct Link {
    pub kind: LinkKind,
    pub phase: LinkPhase,
    pub remote_uin: u32,
    pub remote_version: u16,
    /// Attached chat or file session, when this link carries one.
    pub session: Option<SessionId>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    send_queue: VecDeque<Packet>,
    accumulator: BytesMut,
    codec: FrameCodec,
    writer: Option<WriterTx>,
}

impl Link {
    /// An outbound link; the engine starts the connect afterwards.
    pub fn outgoing(kind: LinkKind, remote_uin: u32) -> Self {
        Self {
            kind,
            phase: LinkPhase::New,
            remote_uin,
            remote_version: 0,
            session: None,
            local_addr: None,
            remote_addr: None,
            send_queue: VecDeque::new(),
            accumulator: BytesMut::new(),
            codec: FrameCodec,
            writer: None,
        }
    }

    /// An accepted inbound link: the socket exists, the peer's hello has
    /// not arrived yet. The writer pump attaches right after insertion.
    pub fn accepted(kind: LinkKind, remote_addr: SocketAddr) -> Self {
        Self {
            kind,
            phase: LinkPhase::HelloWait,
            remote_uin: 0,
            remote_version: 0,
            session: None,
            local_addr: None,
            remote_addr: Some(remote_addr),
            send_queue: VecDeque::new(),
            accumulator: BytesMut::new(),
            codec: FrameCodec,
            writer: None,
        }
    }

    /// A listening link bound to an ephemeral port.
    pub fn listening(kind: LinkKind, local_addr: SocketAddr) -> Self {
        Self {
            kind,
            phase: LinkPhase::Listening,
            remote_uin: 0,
            remote_version: 0,
            session: None,
            local_addr: Some(local_addr),
            remote_addr: None,
            send_queue: VecDeque::new(),
            accumulator: BytesMut::new(),
            codec: FrameCodec,
            writer: None,
        }
    }

    pub fn attach_writer(&mut self, writer: WriterTx) {
        self.writer = Some(writer);
    }

    pub fn queued_len(&self) -> usize {
        self.send_queue.len()
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Send a framed packet, or queue it FIFO while the link is still
    /// being established.
    pub fn send(&mut self, packet: Packet) -> Result<SendOutcome, TernError> {
        if self.phase.is_connecting() {
            self.send_queue.push_back(packet);
            return Ok(SendOutcome::Queued);
        }
        self.transmit(packet)?;
        Ok(SendOutcome::Sent)
    }

    /// Stamp the correlation sequence onto the packet tail and send.
    pub fn send_seq(&mut self, mut packet: Packet, seq: u32) -> Result<SendOutcome, TernError> {
        packet.set_id(seq);
        let end = packet.len();
        packet.goto(end)?;
        packet.append_u32(seq)?;
        self.send(packet)
    }

    /// Write a framed packet now, bypassing the connecting-time queue.
    /// The hello is sent this way — it must precede everything queued.
    pub fn send_immediate(&mut self, packet: Packet) -> Result<(), TernError> {
        self.transmit(packet)
    }

    fn transmit(&mut self, packet: Packet) -> Result<(), TernError> {
        let writer = self.writer.as_ref().ok_or(TernError::ChannelClosed)?;
        let mut buf = BytesMut::new();
        self.codec.encode(packet, &mut buf)?;
        writer
            .send(buf.to_vec())
            .map_err(|_| TernError::ChannelClosed)
    }

    /// Write unframed bytes (raw chat stream).
    pub fn send_raw(&mut self, bytes: Vec<u8>) -> Result<(), TernError> {
        let writer = self.writer.as_ref().ok_or(TernError::ChannelClosed)?;
        writer.send(bytes).map_err(|_| TernError::ChannelClosed)
    }

    /// Flush the connecting-time queue in enqueue order. Returns the ids
    /// of the flushed packets so the caller can notify their requests.
    /// On a write failure the packet stays queued — teardown must still
    /// resolve it.
    pub fn flush_queue(&mut self) -> Result<Vec<u32>, TernError> {
        let mut ids = Vec::with_capacity(self.send_queue.len());
        while let Some(front) = self.send_queue.front() {
            let id = front.id();
            let packet = front.clone();
            self.transmit(packet)?;
            self.send_queue.pop_front();
            ids.push(id);
        }
        Ok(ids)
    }

    /// Drain the queue without sending; every packet still waiting gets
    /// reported as failed exactly once by the caller.
    pub fn fail_queue(&mut self) -> Vec<u32> {
        self.send_queue.drain(..).map(|p| p.id()).collect()
    }

    // ── Receiving ────────────────────────────────────────────────

    /// Append raw socket bytes to the inbound accumulator.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.accumulator.extend_from_slice(bytes);
    }

    /// Pop the next complete frame off the accumulator, if one is
    /// buffered. The caller re-checks the phase between frames — a
    /// frame may flip the link into raw mode, and whatever follows it
    /// in the buffer is then stream data, not frames.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, TernError> {
        self.codec.decode(&mut self.accumulator)
    }

    /// Drain the accumulator as unframed stream bytes (raw phase).
    pub fn take_raw(&mut self) -> Vec<u8> {
        self.accumulator.split().to_vec()
    }
}

// ── Tests ────────────────────────────────────────────────────────
