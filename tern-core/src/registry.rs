//! The session registry.
//!
//! One registry instance per engine owns every live TCP link, chat and
//! file session, and the pending peer-request tables. Links and sessions
//! reference each other through opaque ids resolved via the registry, so
//! mutual teardown degrades to a no-op when the other side is already
//! gone — there are no back-pointers to dangle.
//!
//! Only the engine task mutates the registry, so no locking exists; every
//! mutating operation is safe to re-enter from the teardown cascades it
//! triggers.

use std::collections::HashMap;

use crate::event::PeerEvent;
use crate::link::{Link, LinkKind, LinkPhase};
use crate::session::chat::ChatSession;
use crate::session::file::FileSession;

/// Opaque handle to a live TCP link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

/// Opaque handle to a chat or file session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// A chat or file session slot.
#[derive(Debug)]
pub enum Session {
    Chat(ChatSession),
    File(FileSession),
}

impl Session {
    pub fn link(&self) -> Option<LinkId> {
        match self {
            Session::Chat(s) => s.link,
            Session::File(s) => s.link,
        }
    }

    pub fn set_link(&mut self, link: Option<LinkId>) {
        match self {
            Session::Chat(s) => s.link = link,
            Session::File(s) => s.link = link,
        }
    }

    pub fn remote_uin(&self) -> u32 {
        match self {
            Session::Chat(s) => s.remote_uin,
            Session::File(s) => s.remote_uin,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Session::Chat(s) => s.seq,
            Session::File(s) => s.seq,
        }
    }
}

/// An event we sent (or received) that still awaits its ack or an
/// accept/refuse decision, keyed by `(uin, seq)`.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub event: PeerEvent,
    /// Outbound file offers remember the paths to transfer once the
    /// peer accepts.
    pub files: Vec<std::path::PathBuf>,
}

/// Lookup tables mapping peers to live links and sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: u64,
    links: HashMap<LinkId, Link>,
    sessions: HashMap<SessionId, Session>,
    /// Requests we sent, awaiting the peer's ack.
    outbound: HashMap<(u32, u32), PendingRequest>,
    /// Requests the peer sent, awaiting the caller's accept/refuse.
    inbound: HashMap<(u32, u32), PendingRequest>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ── Links ────────────────────────────────────────────────────

    pub fn insert_link(&mut self, link: Link) -> LinkId {
        let id = LinkId(self.next_id());
        self.links.insert(id, link);
        id
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    /// Remove a link slot. Returns the link so the caller can fail its
    /// queues and tear down any attached session.
    pub fn remove_link(&mut self, id: LinkId) -> Option<Link> {
        self.links.remove(&id)
    }

    /// Find the non-listening link to a peer for the given kind.
    pub fn find_link(&self, uin: u32, kind: LinkKind) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, l)| {
                l.remote_uin == uin && l.kind == kind && l.phase != LinkPhase::Listening
            })
            .map(|(&id, _)| id)
    }

    /// Find the listening link for a kind, if one is open.
    pub fn find_listener(&self, kind: LinkKind) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, l)| l.kind == kind && l.phase == LinkPhase::Listening)
            .map(|(&id, _)| id)
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    // ── Sessions ─────────────────────────────────────────────────

    pub fn insert_session(&mut self, session: Session) -> SessionId {
        let id = SessionId(self.next_id());
        self.sessions.insert(id, session);
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn find_session(&self, uin: u32, seq: u32) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.remote_uin() == uin && s.seq() == seq)
            .map(|(&id, _)| id)
    }

    /// Bind a link and a session to each other.
    pub fn attach(&mut self, link_id: LinkId, session_id: SessionId) {
        if let Some(link) = self.links.get_mut(&link_id) {
            link.session = Some(session_id);
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.set_link(Some(link_id));
        }
    }

    /// Unbind both sides of a link/session pairing. Either id may
    /// already be gone; whatever remains is cleared.
    pub fn detach(&mut self, link_id: LinkId, session_id: SessionId) {
        if let Some(link) = self.links.get_mut(&link_id) {
            if link.session == Some(session_id) {
                link.session = None;
            }
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.link() == Some(link_id) {
                session.set_link(None);
            }
        }
    }

    // ── Pending peer requests ────────────────────────────────────

    pub fn add_outbound(&mut self, uin: u32, seq: u32, event: PeerEvent, files: Vec<std::path::PathBuf>) {
        self.outbound.insert((uin, seq), PendingRequest { event, files });
    }

    pub fn take_outbound(&mut self, uin: u32, seq: u32) -> Option<PendingRequest> {
        self.outbound.remove(&(uin, seq))
    }

    pub fn add_inbound(&mut self, uin: u32, seq: u32, event: PeerEvent) {
        self.inbound.insert((uin, seq), PendingRequest { event, files: Vec::new() });
    }

    pub fn take_inbound(&mut self, uin: u32, seq: u32) -> Option<PendingRequest> {
        self.inbound.remove(&(uin, seq))
    }
}

// ── Tests ────────────────────────────────────────────────────────
