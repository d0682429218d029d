//! Caller-facing notifications.
//!
//! The engine reports everything through one tagged enum delivered over
//! an unbounded channel: request lifecycle stages, inbound events, and
//! session traffic. Request stages correlate through the id returned by
//! the send operation.

use crate::link::LinkKind;
use crate::registry::SessionId;
use crate::session::chat::StyleChange;

/// Lifecycle stage of a caller-initiated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    /// The carrying link is still being established; the packet is
    /// queued.
    Connecting,
    /// The link came up; the queued packet is about to flush.
    Connected,
    /// Written to the socket.
    Sent,
    /// The peer or server acknowledged it.
    Acked,
    /// Delivery failed; the request is finished.
    Failed,
    /// The request completed.
    Succeeded,
}

/// Why the engine considers itself disconnected from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A reliable request exceeded its retransmission ceiling.
    RetryExhausted,
    /// The server told us to go away.
    ServerForced,
    /// The UDP socket died.
    ConnectionLost,
    /// Caller-initiated logout.
    Logout,
}

/// Timestamp attached to offline (store-and-forward) messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

/// Everything the engine can tell its embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    // ── Request lifecycle ────────────────────────────────────────
    Request { id: u32, stage: RequestStage },
    /// The peer refused a chat or file request.
    Refused { id: u32, reason: String },

    // ── Server channel ───────────────────────────────────────────
    /// A kind-specific listening socket is up on this port.
    ListenerReady { kind: LinkKind, port: u16 },
    LoggedIn,
    Disconnected(DisconnectReason),
    NewUin(u32),
    WrongPassword,
    InvalidUin,

    // ── Inbound peer events ──────────────────────────────────────
    MessageReceived {
        uin: u32,
        text: String,
        stamp: Option<MessageStamp>,
    },
    UrlReceived {
        uin: u32,
        url: String,
        description: String,
        stamp: Option<MessageStamp>,
    },
    /// Surfaced without auto-acknowledgement; the caller must accept
    /// or refuse with the carried `seq`.
    ChatRequested {
        uin: u32,
        reason: String,
        seq: u32,
    },
    FileRequested {
        uin: u32,
        reason: String,
        filename: String,
        size: u32,
        seq: u32,
    },
    RequestCancelled {
        uin: u32,
        seq: u32,
    },

    // ── Presence ─────────────────────────────────────────────────
    ContactOnline { uin: u32, status: u32 },
    ContactOffline { uin: u32 },
    ContactStatus { uin: u32, status: u32 },

    // ── Chat sessions ────────────────────────────────────────────
    ChatSessionUp { session: SessionId, uin: u32 },
    ChatData { session: SessionId, text: String },
    ChatStyle { session: SessionId, change: StyleChange },
    ChatClosed { session: SessionId },

    // ── File sessions ────────────────────────────────────────────
    FileSessionUp { session: SessionId, uin: u32 },
    FileProgress {
        session: SessionId,
        filename: String,
        transferred: u64,
        total: u64,
    },
    FileDone { session: SessionId },
    FileClosed { session: SessionId },
}
