//! The UDP reliable-delivery layer.
//!
//! Everything that travels to the central server goes over one datagram
//! socket behind the scramble cipher. Requests carry a 16-bit sequence
//! number; all but acks and keepalives are cloned into a retry queue and
//! retransmitted verbatim until the matching server ack arrives or the
//! attempt ceiling is hit — the latter escalates to a full disconnect.
//!
//! Header (24 bytes, little-endian unless marked):
//!
//! ```text
//! version:  u16   (5)
//! zero:     u32
//! uin:      u32
//! session:  u32
//! command:  u16
//! seq1:     u16
//! seq2:     u16
//! checksum: u32   (zero until the cipher injects the checkcode)
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cipher::{PacketRng, UDP_HEADER_LEN};
use crate::error::TernError;
use crate::event::URL_SENTINEL;
use crate::notify::MessageStamp;
use crate::packet::Packet;

/// Only protocol version 5 is spoken.
pub const UDP_VERSION: u16 = 5;

/// Retransmission ceiling; exceeding it is a fatal disconnect.
pub const UDP_MAX_ATTEMPTS: u8 = 6;

/// Contacts uploaded per list packet.
pub const CONTACTS_PER_PACKET: usize = 64;

/// Body type codes shared by server-mediated and direct messages.
pub const TYPE_MSG: u16 = 1;
pub const TYPE_URL: u16 = 4;

// ── Command sets ─────────────────────────────────────────────────

/// Client-to-server commands.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UdpCommand {
    Ack = 0x000A,
    SendThruServer = 0x010E,
    Login = 0x03E8,
    ContactList = 0x0406,
    AckMessages = 0x0442,
    KeepAlive = 0x042E,
    SendTextCode = 0x0438,
    LoginComplete = 0x044C,
    ChangeStatus = 0x04D8,
    AddContact = 0x053C,
    InvisibleList = 0x06A4,
    VisibleList = 0x06AE,
}

/// Server-to-client commands.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCommand {
    Ack = 0x000A,
    ForcedDisconnect = 0x0028,
    NewUin = 0x0046,
    LoginReply = 0x005A,
    WrongPassword = 0x0064,
    UserOnline = 0x006E,
    UserOffline = 0x0078,
    OfflineMessage = 0x00DC,
    EndMessages = 0x00E6,
    TryAgain = 0x00FA,
    OnlineMessage = 0x0104,
    InvalidUin = 0x012C,
    StatusUpdate = 0x01A4,
    MultiPacket = 0x0212,
    BeginMessages = 0x021C,
}

impl TryFrom<u16> for ServerCommand {
    type Error = TernError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        Ok(match value {
            0x000A => Ack,
            0x0028 => ForcedDisconnect,
            0x0046 => NewUin,
            0x005A => LoginReply,
            0x0064 => WrongPassword,
            0x006E => UserOnline,
            0x0078 => UserOffline,
            0x00DC => OfflineMessage,
            0x00E6 => EndMessages,
            0x00FA => TryAgain,
            0x0104 => OnlineMessage,
            0x012C => InvalidUin,
            0x01A4 => StatusUpdate,
            0x0212 => MultiPacket,
            0x021C => BeginMessages,
            other => {
                return Err(TernError::UnknownVariant {
                    type_name: "ServerCommand",
                    value: other as u32,
                });
            }
        })
    }
}

// ── UdpHeader ────────────────────────────────────────────────────

/// The fixed 24-byte header on every datagram, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub version: u16,
    pub uin: u32,
    pub session: u32,
    pub command: u16,
    pub seq1: u16,
    pub seq2: u16,
}

impl UdpHeader {
    pub fn build(&self) -> Result<Packet, TernError> {
        let mut p = Packet::new();
        p.append_u16(self.version)?;
        p.append_u32(0)?;
        p.append_u32(self.uin)?;
        p.append_u32(self.session)?;
        p.append_u16(self.command)?;
        p.append_u16(self.seq1)?;
        p.append_u16(self.seq2)?;
        p.append_u32(0)?; // checksum, injected by the cipher
        Ok(p)
    }

    pub fn parse(p: &mut Packet) -> Result<Self, TernError> {
        if p.len() < UDP_HEADER_LEN {
            return Err(TernError::Malformed("datagram shorter than header"));
        }
        p.goto(0)?;
        let version = p.read_u16()?;
        let _zero = p.read_u32()?;
        let uin = p.read_u32()?;
        let session = p.read_u32()?;
        let command = p.read_u16()?;
        let seq1 = p.read_u16()?;
        let seq2 = p.read_u16()?;
        let _checksum = p.read_u32()?;
        Ok(UdpHeader {
            version,
            uin,
            session,
            command,
            seq1,
            seq2,
        })
    }
}

// ── Retry queue ──────────────────────────────────────────────────

/// A reliable request awaiting its server ack.
#[derive(Debug, Clone)]
pub struct PendingUdpRequest {
    /// Plaintext clone, retransmitted verbatim.
    pub packet: Packet,
    /// Transmissions so far; starts at 1 for the initial send.
    pub attempt: u8,
    pub expires_at: Instant,
}

/// What to do after a sweep of the retry queue.
#[derive(Debug, Default)]
pub struct RetrySweep {
    /// Packets to retransmit verbatim.
    pub resend: Vec<Packet>,
    /// `(wire sequence, request id)` pairs that ran out of attempts;
    /// exhaustion escalates to a disconnect.
    pub exhausted: Vec<(u16, u32)>,
}

// ── UdpChannel ───────────────────────────────────────────────────

/// Sequence assignment, retry tracking, and duplicate suppression for
/// the server channel. Socket I/O stays with the engine.
#[derive(Debug)]
pub struct UdpChannel {
    uin: u32,
    session: u32,
    seq1: u16,
    seq2: u16,
    expire: Duration,
    pending: HashMap<u16, PendingUdpRequest>,
    /// One bit per possible 16-bit sequence value.
    seen: Box<[u8; 8192]>,
    /// External address as reported by the login reply (host order).
    pub our_ip: u32,
    pub our_port: u16,
}

impl UdpChannel {
    pub fn new(uin: u32, expire: Duration) -> Self {
        Self {
            uin,
            session: 0,
            seq1: 0,
            seq2: 0,
            expire,
            pending: HashMap::new(),
            seen: Box::new([0; 8192]),
            our_ip: 0,
            our_port: 0,
        }
    }

    /// Reset counters and tables for a fresh login.
    pub fn start_session(&mut self, rng: &mut PacketRng) {
        self.session = rng.next_u32() & 0x3FFF_FFFF;
        self.seq1 = (rng.next_u32() & 0x7FFF) as u16;
        self.seq2 = 1;
        self.pending.clear();
        self.seen.fill(0);
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ── Packet construction ──────────────────────────────────────

    fn header(&self, command: UdpCommand, seq1: u16) -> UdpHeader {
        UdpHeader {
            version: UDP_VERSION,
            uin: self.uin,
            session: self.session,
            command: command as u16,
            seq1,
            seq2: self.seq2,
        }
    }

    /// A sequenced packet; bumps both counters. Returns the packet with
    /// its id stamped to the assigned sequence.
    pub fn std_packet(&mut self, command: UdpCommand) -> Result<Packet, TernError> {
        let seq = self.seq1;
        self.seq1 = self.seq1.wrapping_add(1);
        self.seq2 = self.seq2.wrapping_add(1);
        let mut p = self.header(command, seq).build()?;
        p.set_id(seq as u32);
        Ok(p)
    }

    /// A packet reusing an explicit sequence (acks, keepalives).
    pub fn seq_packet(&self, command: UdpCommand, seq: u16) -> Result<Packet, TernError> {
        let mut p = self.header(command, seq).build()?;
        p.set_id(seq as u32);
        Ok(p)
    }

    /// The login request: timestamp, listen port, password, external
    /// address and TCP capability, desired status.
    #[allow(clippy::too_many_arguments)]
    pub fn login(
        &mut self,
        timestamp: u32,
        tcp_listen_port: u16,
        password: &str,
        external_ip: u32,
        tcp_capable: bool,
        status: u32,
    ) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::Login)?;
        p.append_u32(timestamp)?;
        p.append_u32_net(tcp_listen_port as u32)?;
        p.append_string(password)?;
        p.append_u32(0x000000D5)?; // login constant
        p.append_u32_net(external_ip)?;
        p.append_u8(if tcp_capable { 0x04 } else { 0x00 })?;
        p.append_u32(status)?;
        p.append_u32(0x00000002)?;
        Ok(p)
    }

    /// Keepalive; never queued for retry.
    pub fn keepalive(&mut self, rng: &mut PacketRng) -> Result<Packet, TernError> {
        let seq = self.seq1;
        self.seq1 = self.seq1.wrapping_add(1);
        let mut p = self.seq_packet(UdpCommand::KeepAlive, seq)?;
        p.append_u32(rng.next_u32())?;
        Ok(p)
    }

    /// Ack of a server packet; never queued for retry.
    pub fn ack(&self, seq: u16, rng: &mut PacketRng) -> Result<Packet, TernError> {
        let mut p = self.seq_packet(UdpCommand::Ack, seq)?;
        p.append_u32(rng.next_u32())?;
        Ok(p)
    }

    /// The logout text-code packet; sent once, unqueued.
    pub fn logout(&mut self) -> Result<Packet, TernError> {
        let seq = self.seq1;
        self.seq1 = self.seq1.wrapping_add(1);
        let mut p = self.seq_packet(UdpCommand::SendTextCode, seq)?;
        p.append_string("B_USER_DISCONNECTED")?;
        p.append_u8(5)?;
        p.append_u8(0)?;
        Ok(p)
    }

    /// Second-stage login confirmation.
    pub fn login_complete(&mut self, rng: &mut PacketRng) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::LoginComplete)?;
        p.append_u32(rng.next_u32())?;
        Ok(p)
    }

    /// Acknowledge receipt of stored offline messages.
    pub fn ack_messages(&mut self, rng: &mut PacketRng) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::AckMessages)?;
        p.append_u32(rng.next_u32())?;
        Ok(p)
    }

    /// Server-mediated text message.
    pub fn message(&mut self, uin: u32, text: &str) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::SendThruServer)?;
        p.append_u32(uin)?;
        p.append_u16(TYPE_MSG)?;
        p.append_string(text)?;
        Ok(p)
    }

    /// Server-mediated URL: description and URL joined by the sentinel.
    pub fn url(&mut self, uin: u32, url: &str, description: &str) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::SendThruServer)?;
        p.append_u32(uin)?;
        p.append_u16(TYPE_URL)?;
        let len = description.len() + 1 + url.len() + 1;
        p.append_u16(len as u16)?;
        p.append_bytes(description.as_bytes())?;
        p.append_u8(URL_SENTINEL)?;
        p.append_bytes(url.as_bytes())?;
        p.append_u8(0)?;
        Ok(p)
    }

    /// Upload a batch of contact uins under the given list command.
    pub fn contact_batch(
        &mut self,
        command: UdpCommand,
        uins: &[u32],
    ) -> Result<Packet, TernError> {
        let mut p = self.std_packet(command)?;
        p.append_u8(uins.len() as u8)?;
        for &uin in uins {
            p.append_u32(uin)?;
        }
        Ok(p)
    }

    pub fn add_contact(&mut self, uin: u32) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::AddContact)?;
        p.append_u32(uin)?;
        Ok(p)
    }

    pub fn change_status(&mut self, status: u32) -> Result<Packet, TernError> {
        let mut p = self.std_packet(UdpCommand::ChangeStatus)?;
        p.append_u32(status)?;
        Ok(p)
    }

    // ── Retry tracking ───────────────────────────────────────────

    /// Clone an outbound reliable request into the retry queue, keyed
    /// by its wire sequence. The packet keeps the caller-visible
    /// request id in its `id` field.
    pub fn track(&mut self, seq: u16, packet: &Packet) {
        self.pending.insert(
            seq,
            PendingUdpRequest {
                packet: packet.clone(),
                attempt: 1,
                expires_at: Instant::now() + self.expire,
            },
        );
    }

    /// A matching server ack removes the queue entry and returns the
    /// clone so the caller can resolve its request.
    pub fn acked(&mut self, seq: u16) -> Option<Packet> {
        self.pending.remove(&seq).map(|r| r.packet)
    }

    /// Sweep for expired entries: each one either retransmits (and is
    /// reinserted at a later expiry) or, past the attempt ceiling, is
    /// dropped and reported exhausted.
    pub fn sweep(&mut self) -> RetrySweep {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(&seq, _)| seq)
            .collect();

        let mut out = RetrySweep::default();
        for seq in expired {
            let attempt = match self.pending.get(&seq) {
                Some(r) => r.attempt,
                None => continue,
            };
            if attempt > UDP_MAX_ATTEMPTS {
                let entry = self.pending.remove(&seq).expect("checked above");
                out.exhausted.push((seq, entry.packet.id()));
            } else if let Some(entry) = self.pending.get_mut(&seq) {
                entry.attempt += 1;
                entry.expires_at = now + self.expire;
                out.resend.push(entry.packet.clone());
            }
        }
        out
    }

    // ── Duplicate suppression ────────────────────────────────────

    pub fn already_seen(&self, seq: u16) -> bool {
        self.seen[seq as usize / 8] & (1 << (seq % 8)) != 0
    }

    pub fn mark_seen(&mut self, seq: u16) {
        self.seen[seq as usize / 8] |= 1 << (seq % 8);
    }
}

// ── Server payload parsing ───────────────────────────────────────

/// Position the cursor at the start of the command payload.
pub fn goto_payload(p: &mut Packet) -> Result<(), TernError> {
    p.goto(UDP_HEADER_LEN)
}

/// Unwrap a multi-packet reply into its sub-packets, each dispatched
/// individually through the normal response path.
pub fn unwrap_multi(p: &mut Packet) -> Result<Vec<Packet>, TernError> {
    goto_payload(p)?;
    let count = p.read_u8()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = p.read_u16()? as usize;
        let bytes = p.read_bytes(len)?;
        out.push(Packet::from_bytes(bytes)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserOnline {
    pub uin: u32,
    pub ip: u32,
    pub port: u32,
    pub real_ip: u32,
    pub tcp_flag: u8,
    pub status: u32,
}

pub fn parse_user_online(p: &mut Packet) -> Result<UserOnline, TernError> {
    goto_payload(p)?;
    Ok(UserOnline {
        uin: p.read_u32()?,
        ip: p.read_u32_net()?,
        port: p.read_u32()?,
        real_ip: p.read_u32_net()?,
        tcp_flag: p.read_u8()?,
        status: p.read_u32()?,
    })
}

pub fn parse_user_offline(p: &mut Packet) -> Result<u32, TernError> {
    goto_payload(p)?;
    p.read_u32()
}

pub fn parse_status_update(p: &mut Packet) -> Result<(u32, u32), TernError> {
    goto_payload(p)?;
    Ok((p.read_u32()?, p.read_u32()?))
}

pub fn parse_login_reply(p: &mut Packet) -> Result<u32, TernError> {
    goto_payload(p)?;
    p.read_u32_net()
}

/// A message relayed by the server, online or offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    pub uin: u32,
    pub kind: u16,
    pub body: Vec<u8>,
    pub stamp: Option<MessageStamp>,
}

impl RelayedMessage {
    /// Split a URL body on the sentinel into (description, url).
    pub fn split_url(&self) -> (String, String) {
        match self.body.iter().position(|&b| b == URL_SENTINEL) {
            Some(i) => (
                String::from_utf8_lossy(&self.body[..i]).into_owned(),
                String::from_utf8_lossy(&self.body[i + 1..]).into_owned(),
            ),
            None => (String::from_utf8_lossy(&self.body).into_owned(), String::new()),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn read_message_tail(p: &mut Packet, uin: u32, stamp: Option<MessageStamp>) -> Result<RelayedMessage, TernError> {
    let kind = p.read_u16()?;
    let len = p.read_u16()? as usize;
    if len == 0 {
        return Err(TernError::Malformed("zero-length relayed message"));
    }
    let raw = p.read_bytes(len)?;
    Ok(RelayedMessage {
        uin,
        kind,
        body: raw[..len - 1].to_vec(),
        stamp,
    })
}

pub fn parse_online_message(p: &mut Packet) -> Result<RelayedMessage, TernError> {
    goto_payload(p)?;
    let uin = p.read_u32()?;
    read_message_tail(p, uin, None)
}

pub fn parse_offline_message(p: &mut Packet) -> Result<RelayedMessage, TernError> {
    goto_payload(p)?;
    let uin = p.read_u32()?;
    let stamp = MessageStamp {
        year: p.read_u16()?,
        month: p.read_u8()?,
        day: p.read_u8()?,
        hour: p.read_u8()?,
        minute: p.read_u8()?,
    };
    read_message_tail(p, uin, Some(stamp))
}

pub fn parse_new_uin(p: &mut Packet) -> Result<u32, TernError> {
    goto_payload(p)?;
    p.read_u32()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> UdpChannel {
        let mut ch = UdpChannel::new(123456, Duration::ZERO);
        ch.start_session(&mut PacketRng::seeded(3));
        ch
    }

    #[test]
    fn header_roundtrip() {
        let header = UdpHeader {
            version: UDP_VERSION,
            uin: 123456,
            session: 0x1234_5678 & 0x3FFF_FFFF,
            command: UdpCommand::Login as u16,
            seq1: 0x0101,
            seq2: 1,
        };
        let mut p = header.build().unwrap();
        assert_eq!(p.len(), UDP_HEADER_LEN);
        assert_eq!(UdpHeader::parse(&mut p).unwrap(), header);
    }

    #[test]
    fn std_packets_get_increasing_sequences() {
        let mut ch = channel();
        let a = ch.std_packet(UdpCommand::ChangeStatus).unwrap();
        let b = ch.std_packet(UdpCommand::ChangeStatus).unwrap();
        assert_eq!(b.id(), a.id().wrapping_add(1) & 0xFFFF);
    }

    #[test]
    fn retry_exactly_six_times_then_exhausted() {
        let mut ch = channel();
        let p = ch.change_status(0).unwrap();
        ch.track(p.id() as u16, &p);

        let mut resends = 0;
        let mut exhausted = Vec::new();
        // Duration::ZERO expiry: every sweep sees the entry expired
        for _ in 0..20 {
            let sweep = ch.sweep();
            resends += sweep.resend.len();
            exhausted.extend(sweep.exhausted);
            if !exhausted.is_empty() {
                break;
            }
        }
        assert_eq!(resends, UDP_MAX_ATTEMPTS as usize);
        assert_eq!(exhausted, vec![(p.id() as u16, p.id())]);
        assert_eq!(ch.pending_count(), 0);

        // nothing further happens for this sequence
        let sweep = ch.sweep();
        assert!(sweep.resend.is_empty() && sweep.exhausted.is_empty());
    }

    #[test]
    fn ack_cancels_retry() {
        let mut ch = channel();
        let p = ch.change_status(0).unwrap();
        ch.track(p.id() as u16, &p);
        assert!(ch.acked(p.id() as u16).is_some());
        assert!(ch.acked(p.id() as u16).is_none());
        let sweep = ch.sweep();
        assert!(sweep.resend.is_empty());
    }

    #[test]
    fn resend_is_verbatim() {
        let mut ch = channel();
        let p = ch.message(777, "retry me").unwrap();
        ch.track(p.id() as u16, &p);
        let sweep = ch.sweep();
        assert_eq!(sweep.resend.len(), 1);
        assert_eq!(sweep.resend[0].as_bytes(), p.as_bytes());
    }

    #[test]
    fn duplicate_suppression_bitmap() {
        let mut ch = channel();
        assert!(!ch.already_seen(0));
        assert!(!ch.already_seen(0xFFFF));
        ch.mark_seen(0);
        ch.mark_seen(0xFFFF);
        ch.mark_seen(12345);
        assert!(ch.already_seen(0));
        assert!(ch.already_seen(0xFFFF));
        assert!(ch.already_seen(12345));
        assert!(!ch.already_seen(12346));

        ch.start_session(&mut PacketRng::seeded(4));
        assert!(!ch.already_seen(12345));
    }

    #[test]
    fn multi_packet_unwrap() {
        let mut ch = channel();
        let inner1 = ch.seq_packet(UdpCommand::Ack, 1).unwrap();
        let inner2 = ch.seq_packet(UdpCommand::Ack, 2).unwrap();

        let header = UdpHeader {
            version: UDP_VERSION,
            uin: 0,
            session: ch.session(),
            command: ServerCommand::MultiPacket as u16,
            seq1: 9,
            seq2: 0,
        };
        let mut outer = header.build().unwrap();
        outer.append_u8(2).unwrap();
        for inner in [&inner1, &inner2] {
            outer.append_u16(inner.len() as u16).unwrap();
            outer.append_bytes(inner.as_bytes()).unwrap();
        }

        let subs = unwrap_multi(&mut outer).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].as_bytes(), inner1.as_bytes());
        assert_eq!(subs[1].as_bytes(), inner2.as_bytes());
    }

    #[test]
    fn truncated_multi_packet_fails_cleanly() {
        let header = UdpHeader {
            version: UDP_VERSION,
            uin: 0,
            session: 0,
            command: ServerCommand::MultiPacket as u16,
            seq1: 0,
            seq2: 0,
        };
        let mut outer = header.build().unwrap();
        outer.append_u8(3).unwrap();
        outer.append_u16(500).unwrap(); // claims 500 bytes, none follow
        assert!(unwrap_multi(&mut outer).is_err());
    }

    #[test]
    fn login_packet_shape() {
        let mut ch = channel();
        let mut p = ch
            .login(1_000_000, 4000, "hunter2", 0xC0A8_0001, true, 0)
            .unwrap();
        let header = UdpHeader::parse(&mut p).unwrap();
        assert_eq!(header.command, UdpCommand::Login as u16);
        goto_payload(&mut p).unwrap();
        assert_eq!(p.read_u32().unwrap(), 1_000_000);
        assert_eq!(p.read_u32_net().unwrap(), 4000);
        assert_eq!(p.read_string().unwrap(), "hunter2");
    }

    #[test]
    fn relayed_url_splits_on_sentinel() {
        let mut ch = channel();
        let mut p = ch.url(42, "http://x.test/", "see this").unwrap();

        // reuse the outbound shape as an inbound online message: the
        // payload after uin is (type, string)
        let header = UdpHeader {
            version: UDP_VERSION,
            uin: 0,
            session: 0,
            command: ServerCommand::OnlineMessage as u16,
            seq1: 0,
            seq2: 0,
        };
        let mut inbound = header.build().unwrap();
        goto_payload(&mut p).unwrap();
        inbound.append_bytes(p.tail()).unwrap();

        let msg = parse_online_message(&mut inbound).unwrap();
        assert_eq!(msg.uin, 42);
        assert_eq!(msg.kind, TYPE_URL);
        let (descr, url) = msg.split_url();
        assert_eq!(descr, "see this");
        assert_eq!(url, "http://x.test/");
    }

    #[test]
    fn offline_message_carries_stamp() {
        let header = UdpHeader {
            version: UDP_VERSION,
            uin: 0,
            session: 0,
            command: ServerCommand::OfflineMessage as u16,
            seq1: 3,
            seq2: 0,
        };
        let mut p = header.build().unwrap();
        p.append_u32(555).unwrap(); // sender
        p.append_u16(2001).unwrap(); // year
        p.append_u8(6).unwrap();
        p.append_u8(9).unwrap();
        p.append_u8(14).unwrap();
        p.append_u8(46).unwrap();
        p.append_u16(TYPE_MSG).unwrap();
        p.append_string("stored hello").unwrap();

        let msg = parse_offline_message(&mut p).unwrap();
        assert_eq!(msg.uin, 555);
        assert_eq!(msg.text(), "stored hello");
        let stamp = msg.stamp.unwrap();
        assert_eq!((stamp.year, stamp.month, stamp.day), (2001, 6, 9));
        assert_eq!((stamp.hour, stamp.minute), (14, 46));
    }
}
