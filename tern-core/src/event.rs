//! The peer event model.
//!
//! Everything that travels over a message-kind TCP link is one of four
//! event bodies (plain message, URL, chat request, file request) crossed
//! with three kinds (message, ack, cancel). Each combination serializes
//! to and parses from a framed packet with match-based dispatch — the
//! compiler checks exhaustiveness, there is no runtime wiring.
//!
//! Frame layout (inside the u16 length prefix):
//!
//! ```text
//! uin:      u32       sender
//! version:  u16
//! command:  u16       message / ack / cancel
//! kind:     u16       msg / chat / file / url
//! text:     string    body text, URL pair, or refusal reason
//! ip:       u32 (n)   sender address
//! port:     u32       sender message port
//! flags:    u8
//! status:   u16       accept / refuse
//! trailer:  kind-specific (chat: port; file: port + name + size)
//! seq:      u32       appended when the packet is queued for send
//! ```

use crate::error::TernError;
use crate::packet::Packet;

/// Protocol version advertised in hello packets and event frames.
pub const TCP_VERSION: u16 = 3;

/// Separator between the description and the URL inside a URL body.
pub const URL_SENTINEL: u8 = 0xFE;

// ── EventKind ────────────────────────────────────────────────────

/// The command field: what this frame does to its event.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new event from the peer.
    Message = 0x07EE,
    /// Acceptance or refusal of a previously received event.
    Ack = 0x07DA,
    /// Withdrawal of a previously sent event.
    Cancel = 0x07D0,
}

impl TryFrom<u16> for EventKind {
    type Error = TernError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x07EE => Ok(EventKind::Message),
            0x07DA => Ok(EventKind::Ack),
            0x07D0 => Ok(EventKind::Cancel),
            _ => Err(TernError::UnknownVariant {
                type_name: "EventKind",
                value: value as u32,
            }),
        }
    }
}

// ── DeliveryStatus ───────────────────────────────────────────────

/// Status word carried on every event frame. Zero accepts; one refuses.
/// Other values pass through untouched (legacy away-status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStatus(pub u16);

impl DeliveryStatus {
    pub const ACCEPT: DeliveryStatus = DeliveryStatus(0);
    pub const REFUSE: DeliveryStatus = DeliveryStatus(1);

    pub fn is_refusal(&self) -> bool {
        self.0 == Self::REFUSE.0
    }
}

// ── EventBody ────────────────────────────────────────────────────

/// The four event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    Message {
        text: String,
    },
    Url {
        description: String,
        url: String,
    },
    /// Chat invitation; `listen_port` is where the inviter (or, on an
    /// ack, the accepter) listens for the chat connection.
    ChatRequest {
        reason: String,
        listen_port: u32,
    },
    /// File offer; `listen_port` carries the accepter's port on acks.
    FileRequest {
        reason: String,
        filename: String,
        size: u32,
        listen_port: u32,
    },
}

impl EventBody {
    /// Wire discriminant for the kind field.
    pub fn kind_code(&self) -> u16 {
        match self {
            EventBody::Message { .. } => 1,
            EventBody::ChatRequest { .. } => 2,
            EventBody::FileRequest { .. } => 3,
            EventBody::Url { .. } => 4,
        }
    }
}

// ── PeerEvent ────────────────────────────────────────────────────

/// One event frame, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub uin: u32,
    pub kind: EventKind,
    pub body: EventBody,
    pub status: DeliveryStatus,
    /// Sender address as reported inside the frame (host order).
    pub ip: u32,
    /// Sender's message listen port.
    pub port: u32,
    pub flags: u8,
    /// Correlation sequence. Zero until parsed or stamped by the send
    /// path.
    pub seq: u32,
}

impl PeerEvent {
    /// Serialize everything except the trailing sequence id, which the
    /// link send path appends when the packet is queued.
    pub fn build(&self) -> Result<Packet, TernError> {
        let mut p = Packet::new();
        p.append_u32(self.uin)?;
        p.append_u16(TCP_VERSION)?;
        p.append_u16(self.kind as u16)?;
        p.append_u16(self.body.kind_code())?;

        match &self.body {
            EventBody::Message { text } => p.append_string(text)?,
            EventBody::Url { description, url } => {
                let len = description.len() + 1 + url.len() + 1;
                p.append_u16(len as u16)?;
                p.append_bytes(description.as_bytes())?;
                p.append_u8(URL_SENTINEL)?;
                p.append_bytes(url.as_bytes())?;
                p.append_u8(0)?;
            }
            EventBody::ChatRequest { reason, .. } => p.append_string(reason)?,
            EventBody::FileRequest { reason, .. } => p.append_string(reason)?,
        }

        p.append_u32_net(self.ip)?;
        p.append_u32(self.port)?;
        p.append_u8(self.flags)?;
        p.append_u16(self.status.0)?;

        match &self.body {
            EventBody::Message { .. } | EventBody::Url { .. } => {}
            EventBody::ChatRequest { listen_port, .. } => p.append_u32(*listen_port)?,
            EventBody::FileRequest {
                filename,
                size,
                listen_port,
                ..
            } => {
                p.append_u32(*listen_port)?;
                p.append_string(filename)?;
                p.append_u32(*size)?;
            }
        }
        Ok(p)
    }

    /// Parse a complete event frame, trailing sequence id included.
    pub fn parse(p: &mut Packet) -> Result<Self, TernError> {
        p.goto(0)?;
        let uin = p.read_u32()?;
        let _version = p.read_u16()?;
        let kind = EventKind::try_from(p.read_u16()?)?;
        let kind_code = p.read_u16()?;

        // body text is read raw so the URL sentinel survives
        let text_len = p.read_u16()? as usize;
        if text_len == 0 {
            return Err(TernError::Malformed("zero-length event text"));
        }
        let raw = p.read_bytes(text_len)?;
        let raw = raw[..text_len - 1].to_vec();

        let ip = p.read_u32_net()?;
        let port = p.read_u32()?;
        let flags = p.read_u8()?;
        let status = DeliveryStatus(p.read_u16()?);

        let body = match kind_code {
            1 => EventBody::Message {
                text: String::from_utf8_lossy(&raw).into_owned(),
            },
            4 => {
                let split = raw.iter().position(|&b| b == URL_SENTINEL);
                let (descr, url) = match split {
                    Some(i) => (&raw[..i], &raw[i + 1..]),
                    None => (&raw[..], &[][..]),
                };
                EventBody::Url {
                    description: String::from_utf8_lossy(descr).into_owned(),
                    url: String::from_utf8_lossy(url).into_owned(),
                }
            }
            2 => EventBody::ChatRequest {
                reason: String::from_utf8_lossy(&raw).into_owned(),
                listen_port: p.read_u32()?,
            },
            3 => {
                let listen_port = p.read_u32()?;
                let filename = p.read_string()?;
                let size = p.read_u32()?;
                EventBody::FileRequest {
                    reason: String::from_utf8_lossy(&raw).into_owned(),
                    filename,
                    size,
                    listen_port,
                }
            }
            other => {
                return Err(TernError::UnknownVariant {
                    type_name: "EventBody",
                    value: other as u32,
                });
            }
        };

        let seq = p.read_u32()?;

        Ok(PeerEvent {
            uin,
            kind,
            body,
            status,
            ip,
            port,
            flags,
            seq,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
