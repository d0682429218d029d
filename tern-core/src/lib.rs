//! # tern-core
//!
//! Peer-to-peer session and transport engine for a legacy ICQ-family
//! instant-messaging protocol: a scrambled UDP channel to the central
//! server plus direct TCP links between peers for real-time messages,
//! chat sessions, and file transfer, with an optional SOCKS5 tunnel in
//! front of every connection.
//!
//! This crate contains:
//! - **Packet**: cursor-addressed byte buffer with typed append/read
//! - **Cipher**: the UDP obfuscation cipher (checkcode + XOR scramble)
//! - **Codec**: `FrameCodec` / `UdpCodec` for framed I/O via `tokio_util`
//! - **Event**: the peer event model (message, URL, chat, file × ack/cancel)
//! - **Link**: the per-socket TCP link state machine and hello handshake
//! - **Socks**: the 5-phase SOCKS5 proxy tunnel sub-machine
//! - **Udp**: sequence-numbered reliable delivery to the central server
//! - **Session**: chat and file transfer session state
//! - **Engine**: the single-owner actor that ties it all together

pub mod cipher;
pub mod codec;
pub mod config;
pub mod contact;
pub mod engine;
pub mod error;
pub mod event;
pub mod link;
pub mod notify;
pub mod packet;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod socks;
pub mod udp;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{FrameCodec, UdpCodec};
pub use config::{EngineConfig, ProxyConfig};
pub use contact::{Contact, ContactDirectory};
pub use engine::{Engine, EngineHandle, Route};
pub use error::{ProxyError, TernError};
pub use event::{DeliveryStatus, EventBody, EventKind, PeerEvent};
pub use link::{Hello, LinkKind, LinkPhase};
pub use notify::{DisconnectReason, Notification};
pub use packet::{MAX_PACKET_SIZE, Packet};
pub use registry::{LinkId, SessionId, SessionRegistry};
pub use resolver::{Resolver, SystemResolver};
pub use session::chat::{ChatSession, ChatTranscoder, StyleFlags};
pub use session::file::{FileSession, FileSink};
pub use socks::SocksPhase;
pub use udp::{ServerCommand, UdpCommand, UdpHeader};
