//! Domain-specific error types for the tern engine.
//!
//! All fallible operations return `Result<T, TernError>`.
//! Wire input never panics — every malformed byte sequence maps to a
//! typed, recoverable error that is handled at the link or session
//! boundary.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the engine.
#[derive(Debug, Error)]
pub enum TernError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A read advanced past the end of the packet.
    #[error("packet underrun: needed {needed} bytes, {available} available")]
    Underrun { needed: usize, available: usize },

    /// Appending would grow the packet past its bounded maximum.
    #[error("packet overflow: {size} bytes (max {max})")]
    PacketOverflow { size: usize, max: usize },

    /// A length-prefixed TCP frame exceeds the link buffer. Unrecoverable
    /// for the link carrying it.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A UDP datagram was shorter than the fixed header or otherwise
    /// not decodable.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// The scramble cipher's checkcode did not verify after decoding.
    #[error("cipher checkcode mismatch")]
    CheckcodeMismatch,

    /// The first packet on a TCP link was not a valid hello.
    #[error("bad hello: {0}")]
    BadHello(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u32 },

    /// The peer offered a protocol version we do not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// A state machine was asked for an illegal transition.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Transport Errors ─────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly (engine shut down).
    #[error("channel closed")]
    ChannelClosed,

    /// A connect attempt exceeded its deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Hostname resolution failed.
    #[error("resolve failed: {0}")]
    Resolve(String),

    // ── Proxy Errors ─────────────────────────────────────────────
    /// The SOCKS5 tunnel negotiation failed.
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    // ── Exhaustion Errors ────────────────────────────────────────
    /// A reliable UDP request ran out of retransmissions. Escalates to
    /// a top-level disconnect, unlike a single-request failure.
    #[error("retry exhausted for seq {seq:#06x} after {attempts} attempts")]
    RetryExhausted { seq: u16, attempts: u8 },
}

// ── ProxyError ───────────────────────────────────────────────────

/// The closed set of SOCKS5 failure reasons.
///
/// Codes 1–8 come straight off the wire in the CONNECT reply; the
/// remaining variants cover negotiation failures before that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// The proxy did not accept any authentication method we offered.
    #[error("authentication method rejected")]
    MethodRejected,

    /// Username/password or CHAP sub-negotiation failed.
    #[error("authorization failure")]
    AuthFailed,

    #[error("general SOCKS server failure")]
    GeneralFailure,

    #[error("connection not allowed by ruleset")]
    RulesetForbidden,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("TTL expired")]
    TtlExpired,

    #[error("command not supported")]
    CommandNotSupported,

    #[error("address type not supported")]
    AddressTypeNotSupported,

    /// The proxy sent a reply we could not parse.
    #[error("malformed proxy reply")]
    MalformedReply,
}

impl ProxyError {
    /// Map a SOCKS5 CONNECT reply code (1–8) to its error kind.
    pub fn from_reply_code(code: u8) -> Self {
        match code {
            1 => ProxyError::GeneralFailure,
            2 => ProxyError::RulesetForbidden,
            3 => ProxyError::NetworkUnreachable,
            4 => ProxyError::HostUnreachable,
            5 => ProxyError::ConnectionRefused,
            6 => ProxyError::TtlExpired,
            7 => ProxyError::CommandNotSupported,
            8 => ProxyError::AddressTypeNotSupported,
            _ => ProxyError::MalformedReply,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TernError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TernError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = TernError::Underrun {
            needed: 4,
            available: 1,
        };
        assert!(e.to_string().contains("4"));
        assert!(e.to_string().contains("1"));

        let e = TernError::FrameTooLarge {
            size: 9000,
            max: 2048,
        };
        assert!(e.to_string().contains("9000"));
    }

    #[test]
    fn proxy_reply_codes_cover_all_eight() {
        assert_eq!(ProxyError::from_reply_code(1), ProxyError::GeneralFailure);
        assert_eq!(ProxyError::from_reply_code(5), ProxyError::ConnectionRefused);
        assert_eq!(
            ProxyError::from_reply_code(8),
            ProxyError::AddressTypeNotSupported
        );
        assert_eq!(ProxyError::from_reply_code(99), ProxyError::MalformedReply);
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: TernError = io_err.into();
        assert!(matches!(e, TernError::Io(_)));
    }
}
