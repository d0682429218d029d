//! Chat sessions.
//!
//! After the hello, the two ends exchange their handles, colors, and
//! font over framed packets, then the link switches to a raw byte
//! stream. Inside that stream, control bytes below 0x20 carry color,
//! font, and style changes inline with the text; the transcoder
//! separates the two and never splits a multi-byte control sequence
//! across reads.

use bitflags::bitflags;

use crate::error::TernError;
use crate::packet::Packet;
use crate::registry::LinkId;

// control bytes in the raw stream
const CTRL_FOREGROUND: u8 = 0x00;
const CTRL_BACKGROUND: u8 = 0x01;
const CTRL_BELL: u8 = 0x07;
const CTRL_BACKSPACE: u8 = 0x08;
const CTRL_FONT: u8 = 0x10;
const CTRL_STYLE: u8 = 0x11;
const CTRL_SIZE: u8 = 0x12;

bitflags! {
    /// Text style bits carried by the 0x11 control sequence.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StyleFlags: u32 {
        const BOLD = 1;
        const ITALIC = 2;
        const UNDERLINE = 4;
    }
}

/// One inline state change extracted from the raw stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StyleChange {
    Foreground(u32),
    Background(u32),
    Style(StyleFlags),
    Size(u32),
    Font { name: String, encoding: u16 },
    Bell,
    Backspace,
}

/// Output of one transcoder push: text runs interleaved with control
/// changes, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutput {
    Text(String),
    Control(StyleChange),
}

// ── ChatTranscoder ───────────────────────────────────────────────

/// Incremental scanner for the raw chat stream.
#[derive(Debug, Default)]
pub struct ChatTranscoder {
    partial: Vec<u8>,
}

impl ChatTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Width of the control sequence starting at `buf[0]`, or `None`
    /// when more bytes are needed to know.
    fn sequence_len(buf: &[u8]) -> Option<usize> {
        match buf[0] {
            CTRL_FOREGROUND | CTRL_BACKGROUND | CTRL_STYLE | CTRL_SIZE => Some(5),
            CTRL_FONT => {
                // 0x10, name length, name bytes, u16 encoding
                if buf.len() < 2 {
                    None
                } else {
                    Some(2 + buf[1] as usize + 2)
                }
            }
            _ => Some(1),
        }
    }

    fn decode_sequence(seq: &[u8]) -> Option<StyleChange> {
        let word = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        match seq[0] {
            CTRL_FOREGROUND => Some(StyleChange::Foreground(word(&seq[1..]))),
            CTRL_BACKGROUND => Some(StyleChange::Background(word(&seq[1..]))),
            CTRL_STYLE => Some(StyleChange::Style(StyleFlags::from_bits_truncate(word(
                &seq[1..],
            )))),
            CTRL_SIZE => Some(StyleChange::Size(word(&seq[1..]))),
            CTRL_FONT => {
                let name_len = seq[1] as usize;
                let name = String::from_utf8_lossy(&seq[2..2 + name_len]).into_owned();
                let encoding =
                    u16::from_le_bytes([seq[2 + name_len], seq[3 + name_len]]);
                Some(StyleChange::Font { name, encoding })
            }
            CTRL_BELL => Some(StyleChange::Bell),
            CTRL_BACKSPACE => Some(StyleChange::Backspace),
            // remaining control values carry no state we track
            _ => None,
        }
    }

    /// Feed stream bytes; returns completed text runs and control
    /// changes. An incomplete control sequence at the end of the input
    /// stays buffered for the next push.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ChatOutput> {
        self.partial.extend_from_slice(bytes);
        let buf = std::mem::take(&mut self.partial);

        let mut out = Vec::new();
        let mut text = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            if b >= 0x20 || b == b'\r' || b == b'\n' {
                text.push(b);
                i += 1;
                continue;
            }
            let len = match Self::sequence_len(&buf[i..]) {
                Some(len) if i + len <= buf.len() => len,
                // incomplete: hold the tail, emit what we have
                _ => {
                    self.partial = buf[i..].to_vec();
                    if !text.is_empty() {
                        out.push(ChatOutput::Text(
                            String::from_utf8_lossy(&text).into_owned(),
                        ));
                    }
                    return out;
                }
            };
            if !text.is_empty() {
                out.push(ChatOutput::Text(
                    String::from_utf8_lossy(&text).into_owned(),
                ));
                text.clear();
            }
            if let Some(change) = Self::decode_sequence(&buf[i..i + len]) {
                out.push(ChatOutput::Control(change));
            }
            i += len;
        }
        if !text.is_empty() {
            out.push(ChatOutput::Text(
                String::from_utf8_lossy(&text).into_owned(),
            ));
        }
        out
    }

    /// Encode a control change for the outbound stream.
    pub fn encode(change: &StyleChange) -> Vec<u8> {
        match change {
            StyleChange::Foreground(c) => {
                let mut v = vec![CTRL_FOREGROUND];
                v.extend_from_slice(&c.to_le_bytes());
                v
            }
            StyleChange::Background(c) => {
                let mut v = vec![CTRL_BACKGROUND];
                v.extend_from_slice(&c.to_le_bytes());
                v
            }
            StyleChange::Style(flags) => {
                let mut v = vec![CTRL_STYLE];
                v.extend_from_slice(&flags.bits().to_le_bytes());
                v
            }
            StyleChange::Size(s) => {
                let mut v = vec![CTRL_SIZE];
                v.extend_from_slice(&s.to_le_bytes());
                v
            }
            StyleChange::Font { name, encoding } => {
                let mut v = vec![CTRL_FONT, name.len() as u8];
                v.extend_from_slice(name.as_bytes());
                v.extend_from_slice(&encoding.to_le_bytes());
                v
            }
            StyleChange::Bell => vec![CTRL_BELL],
            StyleChange::Backspace => vec![CTRL_BACKSPACE],
        }
    }
}

// ── Init packets ─────────────────────────────────────────────────

/// First framed packet each side sends after the hello: handle and
/// colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInit {
    pub uin: u32,
    pub handle: String,
    pub foreground: u32,
    pub background: u32,
}

impl ChatInit {
    pub fn build(&self) -> Result<Packet, TernError> {
        let mut p = Packet::new();
        p.append_u32(self.uin)?;
        p.append_string(&self.handle)?;
        p.append_u32(self.foreground)?;
        p.append_u32(self.background)?;
        Ok(p)
    }

    pub fn parse(p: &mut Packet) -> Result<Self, TernError> {
        p.goto(0)?;
        Ok(Self {
            uin: p.read_u32()?,
            handle: p.read_string()?,
            foreground: p.read_u32()?,
            background: p.read_u32()?,
        })
    }
}

/// Font advertisement sent by the connecting side after its init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFont {
    pub size: u32,
    pub style: StyleFlags,
    pub name: String,
}

impl ChatFont {
    pub fn build(&self) -> Result<Packet, TernError> {
        let mut p = Packet::new();
        p.append_u32(self.size)?;
        p.append_u32(self.style.bits())?;
        p.append_string(&self.name)?;
        Ok(p)
    }

    pub fn parse(p: &mut Packet) -> Result<Self, TernError> {
        p.goto(0)?;
        Ok(Self {
            size: p.read_u32()?,
            style: StyleFlags::from_bits_truncate(p.read_u32()?),
            name: p.read_string()?,
        })
    }
}

// ── ChatSession ──────────────────────────────────────────────────

/// Lifecycle of a chat session while its link initializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    /// Accepter: listening for the requester's connection.
    Listening,
    /// Requester: dialing the accepter's advertised port.
    Connecting,
    /// Link is up; waiting for the peer's handle/color packet.
    WaitInfo,
    /// Handle received; waiting for the peer's font packet.
    WaitFont,
    /// Init exchange complete; raw data flows.
    Ready,
}

/// State for one chat conversation.
#[derive(Debug)]
pub struct ChatSession {
    pub remote_uin: u32,
    /// Correlation id of the originating chat request.
    pub seq: u32,
    /// Attached link, if any. The registry keeps both sides in sync.
    pub link: Option<LinkId>,
    pub status: ChatStatus,
    pub remote_handle: String,
    pub foreground: u32,
    pub background: u32,
    pub font: Option<ChatFont>,
    transcoder: ChatTranscoder,
}

impl ChatSession {
    /// Session created on the requesting side, before connecting out.
    pub fn outgoing(remote_uin: u32, seq: u32) -> Self {
        Self::with_status(remote_uin, seq, ChatStatus::Connecting)
    }

    /// Session created on the accepting side, before the peer dials in.
    pub fn listening(remote_uin: u32, seq: u32) -> Self {
        Self::with_status(remote_uin, seq, ChatStatus::Listening)
    }

    fn with_status(remote_uin: u32, seq: u32, status: ChatStatus) -> Self {
        Self {
            remote_uin,
            seq,
            link: None,
            status,
            remote_handle: String::new(),
            foreground: 0x00FF_FFFF,
            background: 0,
            font: None,
            transcoder: ChatTranscoder::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ChatStatus::Ready
    }

    pub fn record_init(&mut self, init: &ChatInit) {
        self.remote_handle = init.handle.clone();
        self.foreground = init.foreground;
        self.background = init.background;
    }

    pub fn record_font(&mut self, font: ChatFont) {
        self.font = Some(font);
    }

    /// Run inbound raw bytes through this session's transcoder.
    pub fn transcode(&mut self, bytes: &[u8]) -> Vec<ChatOutput> {
        self.transcoder.push(bytes)
    }
}

// ── Tests ────────────────────────────────────────────────────────
