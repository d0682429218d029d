//! The engine actor.
//!
//! One task owns every piece of mutable state: the session registry, the
//! contact directory, the UDP channel, and each link's state machine.
//! Socket I/O lives in small pump tasks that shuttle bytes over
//! channels; they never touch state. Commands come in from
//! [`EngineHandle`]s, results go out as [`Notification`]s.
//!
//! Ordering: for a single link, packets go out in enqueue order and
//! inbound frames are dispatched in arrival order. Across links there
//! is no ordering guarantee.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cipher::{self, PacketRng};
use crate::config::EngineConfig;
use crate::contact::ContactDirectory;
use crate::error::TernError;
use crate::event::{DeliveryStatus, EventBody, EventKind, PeerEvent};
use crate::link::{CONNECT_TIMEOUT, Hello, Link, LinkKind, LinkPhase, SendOutcome, WriterTx};
use crate::notify::{DisconnectReason, Notification, RequestStage};
use crate::packet::{MAX_PACKET_SIZE, Packet};
use crate::registry::{LinkId, Session, SessionId, SessionRegistry};
use crate::resolver::Resolver;
use crate::session::chat::{ChatFont, ChatInit, ChatOutput, ChatSession, ChatStatus, StyleChange, StyleFlags, ChatTranscoder};
use crate::session::file::{FilePacket, FileSession, FileSink, FileSource, FileStatus, TransferDirection};
use crate::socks::{self, SocksPhase};
use crate::udp::{self, ServerCommand, UdpChannel, UdpHeader, TYPE_URL, UDP_VERSION};

/// First caller-visible request id; ids decrease from here.
const INITIAL_SEQUENCE: u32 = 0xFFFF_FFFE;

/// How an outbound message or URL travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ThroughServer,
    Direct,
    /// Direct when the contact advertises TCP capability, otherwise
    /// through the server.
    BestWay,
}

// ── Commands ─────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Connect { host: String, port: u16 },
    Disconnect,
    Login { status: u32 },
    ChangeStatus { id: u32, status: u32 },
    AddContact { uin: u32 },
    RemoveContact { uin: u32 },
    SetVisible { uin: u32, on: bool },
    SetInvisible { uin: u32, on: bool },
    SetContactEndpoint { uin: u32, ip: u32, port: u16, tcp_capable: bool },
    SendMessage { id: u32, uin: u32, text: String, route: Route },
    SendUrl { id: u32, uin: u32, url: String, description: String, route: Route },
    SendChatRequest { id: u32, uin: u32, reason: String },
    SendFileRequest { id: u32, uin: u32, reason: String, files: Vec<PathBuf> },
    AcceptChat { uin: u32, seq: u32 },
    RefuseChat { uin: u32, seq: u32, reason: String },
    CancelChat { uin: u32, seq: u32 },
    AcceptFile { uin: u32, seq: u32 },
    RefuseFile { uin: u32, seq: u32, reason: String },
    CancelFile { uin: u32, seq: u32 },
    ChatSend { session: SessionId, text: String },
    ChatSendStyle { session: SessionId, change: StyleChange },
    ChatClose { session: SessionId },
    FileSetSpeed { session: SessionId, speed: u32 },
    FileClose { session: SessionId },
    Shutdown,
}

/// Messages from the I/O pump tasks.
#[derive(Debug)]
enum PumpMsg {
    Connected {
        link: LinkId,
        stream: TcpStream,
        socks_phases: Vec<SocksPhase>,
    },
    ConnectFailed { link: LinkId, error: String },
    Accepted { listener: LinkId, stream: TcpStream },
    Data { link: LinkId, bytes: Vec<u8> },
    Closed { link: LinkId },
}

// ── EngineHandle ─────────────────────────────────────────────────

/// Cheap, cloneable command surface for one engine. Send operations
/// return the request id used by later `Notification::Request` stages.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_seq: Arc<AtomicU32>,
}

impl EngineHandle {
    /// Request ids are the protocol's monotonically decreasing local
    /// sequence.
    fn next_id(&self) -> u32 {
        self.next_seq.fetch_sub(1, Ordering::Relaxed)
    }

    fn send(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }

    pub fn connect(&self, host: impl Into<String>, port: u16) {
        self.send(Command::Connect {
            host: host.into(),
            port,
        });
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn login(&self, status: u32) {
        self.send(Command::Login { status });
    }

    pub fn change_status(&self, status: u32) -> u32 {
        let id = self.next_id();
        self.send(Command::ChangeStatus { id, status });
        id
    }

    pub fn add_contact(&self, uin: u32) {
        self.send(Command::AddContact { uin });
    }

    pub fn remove_contact(&self, uin: u32) {
        self.send(Command::RemoveContact { uin });
    }

    pub fn set_visible(&self, uin: u32, on: bool) {
        self.send(Command::SetVisible { uin, on });
    }

    pub fn set_invisible(&self, uin: u32, on: bool) {
        self.send(Command::SetInvisible { uin, on });
    }

    /// Seed a contact's direct-connection endpoint without server
    /// presence (the host application may learn addresses elsewhere).
    pub fn set_contact_endpoint(&self, uin: u32, ip: u32, port: u16, tcp_capable: bool) {
        self.send(Command::SetContactEndpoint {
            uin,
            ip,
            port,
            tcp_capable,
        });
    }

    pub fn send_message(&self, uin: u32, text: impl Into<String>, route: Route) -> u32 {
        let id = self.next_id();
        self.send(Command::SendMessage {
            id,
            uin,
            text: text.into(),
            route,
        });
        id
    }

    pub fn send_url(
        &self,
        uin: u32,
        url: impl Into<String>,
        description: impl Into<String>,
        route: Route,
    ) -> u32 {
        let id = self.next_id();
        self.send(Command::SendUrl {
            id,
            uin,
            url: url.into(),
            description: description.into(),
            route,
        });
        id
    }

    pub fn send_chat_request(&self, uin: u32, reason: impl Into<String>) -> u32 {
        let id = self.next_id();
        self.send(Command::SendChatRequest {
            id,
            uin,
            reason: reason.into(),
        });
        id
    }

    pub fn send_file_request(
        &self,
        uin: u32,
        reason: impl Into<String>,
        files: Vec<PathBuf>,
    ) -> u32 {
        let id = self.next_id();
        self.send(Command::SendFileRequest {
            id,
            uin,
            reason: reason.into(),
            files,
        });
        id
    }

    pub fn accept_chat_request(&self, uin: u32, seq: u32) {
        self.send(Command::AcceptChat { uin, seq });
    }

    pub fn refuse_chat_request(&self, uin: u32, seq: u32, reason: impl Into<String>) {
        self.send(Command::RefuseChat {
            uin,
            seq,
            reason: reason.into(),
        });
    }

    pub fn cancel_chat_request(&self, uin: u32, seq: u32) {
        self.send(Command::CancelChat { uin, seq });
    }

    pub fn accept_file_request(&self, uin: u32, seq: u32) {
        self.send(Command::AcceptFile { uin, seq });
    }

    pub fn refuse_file_request(&self, uin: u32, seq: u32, reason: impl Into<String>) {
        self.send(Command::RefuseFile {
            uin,
            seq,
            reason: reason.into(),
        });
    }

    pub fn cancel_file_request(&self, uin: u32, seq: u32) {
        self.send(Command::CancelFile { uin, seq });
    }

    pub fn chat_send(&self, session: SessionId, text: impl Into<String>) {
        self.send(Command::ChatSend {
            session,
            text: text.into(),
        });
    }

    pub fn chat_send_style(&self, session: SessionId, change: StyleChange) {
        self.send(Command::ChatSendStyle { session, change });
    }

    pub fn chat_close(&self, session: SessionId) {
        self.send(Command::ChatClose { session });
    }

    pub fn file_set_speed(&self, session: SessionId, speed: u32) {
        self.send(Command::FileSetSpeed { session, speed });
    }

    pub fn file_close(&self, session: SessionId) {
        self.send(Command::FileClose { session });
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// The session-and-transport engine. Construct with [`Engine::new`],
/// then drive it to completion with [`Engine::run`] on its own task.
pub struct Engine {
    config: EngineConfig,
    resolver: Box<dyn Resolver>,
    registry: SessionRegistry,
    contacts: ContactDirectory,
    channel: UdpChannel,
    rng: PacketRng,
    udp: Option<Arc<UdpSocket>>,
    notify: mpsc::UnboundedSender<Notification>,
    pump_tx: mpsc::UnboundedSender<PumpMsg>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
    pump_rx: Option<mpsc::UnboundedReceiver<PumpMsg>>,
    status: u32,
    logged_in: bool,
    /// True between a successful server connect and the disconnect
    /// notification; guards "exactly one disconnect" per session.
    server_active: bool,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        resolver: Box<dyn Resolver>,
    ) -> (
        Self,
        EngineHandle,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let channel = UdpChannel::new(config.uin, Duration::from_secs(config.udp_expire_secs));
        let engine = Engine {
            config,
            resolver,
            registry: SessionRegistry::new(),
            contacts: ContactDirectory::new(),
            channel,
            rng: PacketRng::new(),
            udp: None,
            notify: notify_tx,
            pump_tx,
            cmd_rx: Some(cmd_rx),
            pump_rx: Some(pump_rx),
            status: 0,
            logged_in: false,
            server_active: false,
        };
        let handle = EngineHandle {
            tx: cmd_tx,
            next_seq: Arc::new(AtomicU32::new(INITIAL_SEQUENCE)),
        };
        (engine, handle, notify_rx)
    }

    /// The actor loop. Runs until `shutdown()` or every handle is
    /// dropped.
    pub async fn run(mut self) {
        let mut cmd_rx = self.cmd_rx.take().expect("run called twice");
        let mut pump_rx = self.pump_rx.take().expect("run called twice");

        let mut retry = tokio::time::interval(Duration::from_secs(1));
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(self.config.keepalive_secs.max(1)));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let udp = self.udp.clone();
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(msg) = pump_rx.recv() => self.handle_pump(msg).await,
                result = Self::recv_datagram(udp.clone().expect("guarded")), if udp.is_some() => {
                    match result {
                        Ok(bytes) => self.handle_datagram(bytes).await,
                        Err(e) => {
                            warn!(error = %e, "server socket failed");
                            self.udp = None;
                            self.mark_disconnected(DisconnectReason::ConnectionLost);
                        }
                    }
                },
                _ = retry.tick() => self.retry_sweep().await,
                _ = keepalive.tick(), if self.logged_in => self.send_keepalive().await,
            }
        }
    }

    async fn recv_datagram(socket: Arc<UdpSocket>) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    // ── Notification helpers ─────────────────────────────────────

    fn emit(&self, n: Notification) {
        let _ = self.notify.send(n);
    }

    /// Request-stage notification; id 0 marks engine-internal traffic
    /// with no caller to tell.
    fn emit_request(&self, id: u32, stage: RequestStage) {
        if id != 0 {
            self.emit(Notification::Request { id, stage });
        }
    }

    fn mark_disconnected(&mut self, reason: DisconnectReason) {
        self.logged_in = false;
        if self.server_active {
            self.server_active = false;
            self.emit(Notification::Disconnected(reason));
        }
    }

    // ── Command handling ─────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { host, port } => self.connect_server(&host, port).await,
            Command::Disconnect => self.disconnect_server().await,
            Command::Login { status } => {
                self.status = status;
                self.channel.start_session(&mut self.rng);
                self.send_login().await;
            }
            Command::ChangeStatus { id, status } => {
                self.status = status;
                match self.channel.change_status(status) {
                    Ok(p) => self.send_reliable(p, id).await,
                    Err(e) => warn!(error = %e, "change_status build failed"),
                }
            }
            Command::AddContact { uin } => {
                self.contacts.add(uin);
                if self.logged_in {
                    if let Ok(p) = self.channel.add_contact(uin) {
                        self.send_reliable(p, 0).await;
                    }
                }
            }
            Command::RemoveContact { uin } => {
                self.contacts.remove(uin);
            }
            Command::SetVisible { uin, on } => {
                self.contacts.add(uin).visible = on;
            }
            Command::SetInvisible { uin, on } => {
                self.contacts.add(uin).invisible = on;
            }
            Command::SetContactEndpoint {
                uin,
                ip,
                port,
                tcp_capable,
            } => {
                self.contacts.set_online(uin, 0, ip, ip, port, tcp_capable);
            }
            Command::SendMessage {
                id,
                uin,
                text,
                route,
            } => match self.effective_route(route, uin) {
                Route::ThroughServer => match self.channel.message(uin, &text) {
                    Ok(p) => self.send_reliable(p, id).await,
                    Err(e) => {
                        warn!(error = %e, "message build failed");
                        self.emit_request(id, RequestStage::Failed);
                    }
                },
                _ => self.send_direct_event(id, uin, EventBody::Message { text }),
            },
            Command::SendUrl {
                id,
                uin,
                url,
                description,
                route,
            } => match self.effective_route(route, uin) {
                Route::ThroughServer => match self.channel.url(uin, &url, &description) {
                    Ok(p) => self.send_reliable(p, id).await,
                    Err(e) => {
                        warn!(error = %e, "url build failed");
                        self.emit_request(id, RequestStage::Failed);
                    }
                },
                _ => self.send_direct_event(id, uin, EventBody::Url { description, url }),
            },
            Command::SendChatRequest { id, uin, reason } => {
                let body = EventBody::ChatRequest {
                    reason,
                    listen_port: 0,
                };
                self.send_peer_request(id, uin, body, Vec::new());
            }
            Command::SendFileRequest {
                id,
                uin,
                reason,
                files,
            } => {
                let mut total: u64 = 0;
                for path in &files {
                    match tokio::fs::metadata(path).await {
                        Ok(meta) => total += meta.len(),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "file request failed");
                            self.emit_request(id, RequestStage::Failed);
                            return;
                        }
                    }
                }
                let filename = files
                    .first()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let body = EventBody::FileRequest {
                    reason,
                    filename,
                    size: total as u32,
                    listen_port: 0,
                };
                self.send_peer_request(id, uin, body, files);
            }
            Command::AcceptChat { uin, seq } => self.accept_chat(uin, seq).await,
            Command::RefuseChat { uin, seq, reason } => {
                if self.registry.take_inbound(uin, seq).is_some() {
                    self.send_refusal(
                        uin,
                        seq,
                        EventBody::ChatRequest {
                            reason,
                            listen_port: 0,
                        },
                    );
                }
            }
            Command::CancelChat { uin, seq } => self.cancel_request(uin, seq),
            Command::AcceptFile { uin, seq } => self.accept_file(uin, seq).await,
            Command::RefuseFile { uin, seq, reason } => {
                if let Some(pending) = self.registry.take_inbound(uin, seq) {
                    let (filename, size) = match pending.event.body {
                        EventBody::FileRequest { filename, size, .. } => (filename, size),
                        _ => (String::new(), 0),
                    };
                    self.send_refusal(
                        uin,
                        seq,
                        EventBody::FileRequest {
                            reason,
                            filename,
                            size,
                            listen_port: 0,
                        },
                    );
                }
            }
            Command::CancelFile { uin, seq } => self.cancel_request(uin, seq),
            Command::ChatSend { session, text } => {
                self.chat_write(session, text.into_bytes());
            }
            Command::ChatSendStyle { session, change } => {
                self.chat_write(session, ChatTranscoder::encode(&change));
            }
            Command::ChatClose { session } => self.close_session(session),
            Command::FileSetSpeed { session, speed } => {
                let link = match self.registry.session_mut(session) {
                    Some(Session::File(fs)) => {
                        fs.speed = speed;
                        fs.link
                    }
                    _ => None,
                };
                if let Some(link) = link {
                    self.send_file_packet(link, &FilePacket::Speed { speed });
                }
            }
            Command::FileClose { session } => self.close_session(session),
            Command::Shutdown => unreachable!("handled in run"),
        }
    }

    fn effective_route(&self, route: Route, uin: u32) -> Route {
        match route {
            Route::BestWay => {
                let direct = self.config.use_tcp
                    && self
                        .contacts
                        .get(uin)
                        .map(|c| c.is_online() && c.tcp_capable && c.port != 0)
                        .unwrap_or(false);
                if direct {
                    Route::Direct
                } else {
                    Route::ThroughServer
                }
            }
            other => other,
        }
    }

    // ── Server channel ───────────────────────────────────────────

    async fn connect_server(&mut self, host: &str, port: u16) {
        let addrs = match self.resolver.resolve(host, port).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(host, error = %e, "resolve failed");
                self.emit(Notification::Disconnected(DisconnectReason::ConnectionLost));
                return;
            }
        };

        // caller-level candidate loop: try each resolved address
        let mut connected = None;
        for addr in addrs {
            let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "udp bind failed");
                    continue;
                }
            };
            match socket.connect(addr).await {
                Ok(()) => {
                    connected = Some(socket);
                    break;
                }
                Err(e) => warn!(%addr, error = %e, "udp connect failed, trying next"),
            }
        }
        let Some(socket) = connected else {
            self.emit(Notification::Disconnected(DisconnectReason::ConnectionLost));
            return;
        };

        if let Ok(local) = socket.local_addr() {
            self.channel.our_port = local.port();
        }
        debug!(server = host, "server socket up");
        self.udp = Some(Arc::new(socket));
        self.server_active = true;

        if self.config.use_tcp && self.registry.find_listener(LinkKind::Message).is_none() {
            if let Err(e) = self.open_listener(LinkKind::Message).await {
                warn!(error = %e, "message listener failed");
            }
        }
    }

    async fn disconnect_server(&mut self) {
        if self.logged_in {
            if let Ok(p) = self.channel.logout() {
                let _ = self.send_datagram(p).await;
            }
        }
        for link in self.registry.link_ids() {
            self.close_link(link);
        }
        self.udp = None;
        self.logged_in = false;
        if self.server_active {
            self.server_active = false;
            self.emit(Notification::Disconnected(DisconnectReason::Logout));
        }
    }

    async fn send_login(&mut self) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let listen_port = self.message_port();
        let password = self.config.password.clone();
        let external_ip = self.local_ip();
        let packet = self.channel.login(
            timestamp,
            listen_port,
            &password,
            external_ip,
            self.config.use_tcp,
            self.status,
        );
        match packet {
            Ok(p) => self.send_reliable(p, 0).await,
            Err(e) => warn!(error = %e, "login build failed"),
        }
    }

    async fn send_keepalive(&mut self) {
        let packet = self.channel.keepalive(&mut self.rng);
        match packet {
            Ok(p) => {
                if let Err(e) = self.send_datagram(p).await {
                    warn!(error = %e, "keepalive failed");
                }
            }
            Err(e) => warn!(error = %e, "keepalive build failed"),
        }
    }

    async fn send_datagram(&mut self, packet: Packet) -> Result<(), TernError> {
        let Some(socket) = self.udp.clone() else {
            return Err(TernError::InvalidTransition("no server connection"));
        };
        let mut data = packet.into_bytes();
        cipher::encode(&mut data, &mut self.rng)?;
        socket.send(&data).await?;
        Ok(())
    }

    /// Send a sequenced request and clone it into the retry queue.
    async fn send_reliable(&mut self, mut packet: Packet, request_id: u32) {
        let wire_seq = packet.id() as u16;
        packet.set_id(request_id);
        self.channel.track(wire_seq, &packet);
        match self.send_datagram(packet).await {
            Ok(()) => self.emit_request(request_id, RequestStage::Sent),
            Err(e) => {
                // the clone stays queued; retransmission will retry
                warn!(error = %e, wire_seq, "reliable send failed, retry queued");
            }
        }
    }

    async fn send_ack(&mut self, seq: u16) {
        let packet = self.channel.ack(seq, &mut self.rng);
        if let Ok(p) = packet {
            if let Err(e) = self.send_datagram(p).await {
                debug!(error = %e, "ack send failed");
            }
        }
    }

    async fn retry_sweep(&mut self) {
        let sweep = self.channel.sweep();
        for packet in sweep.resend {
            debug!(seq = packet.id(), "retransmitting");
            if let Err(e) = self.send_datagram(packet).await {
                debug!(error = %e, "retransmit failed");
            }
        }
        if !sweep.exhausted.is_empty() {
            for (seq, id) in &sweep.exhausted {
                warn!(seq, "request exhausted its retransmissions");
                self.emit_request(*id, RequestStage::Failed);
            }
            self.mark_disconnected(DisconnectReason::RetryExhausted);
        }
    }

    // ── Inbound datagrams ────────────────────────────────────────

    async fn handle_datagram(&mut self, mut data: Vec<u8>) {
        if let Err(e) = cipher::decode(&mut data) {
            warn!(error = %e, len = data.len(), "undecodable datagram dropped");
            return;
        }
        let mut packet = match Packet::from_bytes(&data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "oversized datagram dropped");
                return;
            }
        };
        let header = match UdpHeader::parse(&mut packet) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "malformed datagram dropped");
                return;
            }
        };
        if header.version != UDP_VERSION {
            warn!(version = header.version, "unsupported protocol version");
            return;
        }

        let seq = header.seq1;
        let cmd = ServerCommand::try_from(header.command);
        let dup_exempt = matches!(
            cmd,
            Ok(ServerCommand::NewUin | ServerCommand::ForcedDisconnect | ServerCommand::Ack)
        );
        if self.channel.already_seen(seq) && !dup_exempt {
            debug!(seq, "duplicate server message ignored");
            self.send_ack(seq).await;
            return;
        }
        if !matches!(cmd, Ok(ServerCommand::Ack)) {
            self.channel.mark_seen(seq);
        }

        // worklist instead of recursion: multi-packet replies unwrap
        // into sub-packets dispatched through the same path
        let mut work = vec![packet];
        while let Some(mut p) = work.pop() {
            let header = match UdpHeader::parse(&mut p) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "malformed sub-packet dropped");
                    continue;
                }
            };
            match ServerCommand::try_from(header.command) {
                Ok(ServerCommand::MultiPacket) => match udp::unwrap_multi(&mut p) {
                    Ok(subs) => {
                        debug!(count = subs.len(), "multi-packet unwrapped");
                        work.extend(subs);
                    }
                    Err(e) => warn!(error = %e, "bad multi-packet"),
                },
                Ok(cmd) => self.dispatch_server(cmd, &header, &mut p).await,
                Err(_) => {
                    warn!(command = header.command, "unhandled server command");
                    self.send_ack(header.seq1).await;
                }
            }
        }
    }

    async fn dispatch_server(&mut self, cmd: ServerCommand, header: &UdpHeader, p: &mut Packet) {
        let seq = header.seq1;
        match cmd {
            ServerCommand::Ack => {
                if let Some(packet) = self.channel.acked(seq) {
                    debug!(seq, "server acknowledged");
                    self.emit_request(packet.id(), RequestStage::Acked);
                    self.emit_request(packet.id(), RequestStage::Succeeded);
                }
            }
            ServerCommand::LoginReply => {
                match udp::parse_login_reply(p) {
                    Ok(ip) => self.channel.our_ip = ip,
                    Err(e) => {
                        warn!(error = %e, "bad login reply");
                        return;
                    }
                }
                self.send_ack(seq).await;
                if let Ok(p) = self.channel.login_complete(&mut self.rng) {
                    self.send_reliable(p, 0).await;
                }
                self.upload_contact_lists().await;
                self.logged_in = true;
                self.emit(Notification::LoggedIn);
            }
            ServerCommand::WrongPassword => {
                self.send_ack(seq).await;
                self.emit(Notification::WrongPassword);
            }
            ServerCommand::InvalidUin => {
                self.send_ack(seq).await;
                self.emit(Notification::InvalidUin);
            }
            ServerCommand::NewUin => {
                self.send_ack(seq).await;
                match udp::parse_new_uin(p) {
                    Ok(uin) => self.emit(Notification::NewUin(uin)),
                    Err(e) => warn!(error = %e, "bad new-uin reply"),
                }
            }
            ServerCommand::TryAgain => {
                warn!("server busy, retrying login");
                self.send_login().await;
            }
            ServerCommand::ForcedDisconnect => {
                self.mark_disconnected(DisconnectReason::ServerForced);
            }
            ServerCommand::UserOnline => {
                match udp::parse_user_online(p) {
                    Ok(info) => {
                        self.contacts.set_online(
                            info.uin,
                            info.status,
                            info.ip,
                            info.real_ip,
                            info.port as u16,
                            info.tcp_flag == 0x04,
                        );
                        self.emit(Notification::ContactOnline {
                            uin: info.uin,
                            status: info.status,
                        });
                    }
                    Err(e) => warn!(error = %e, "bad user-online"),
                }
                self.send_ack(seq).await;
            }
            ServerCommand::UserOffline => {
                match udp::parse_user_offline(p) {
                    Ok(uin) => {
                        self.contacts.set_offline(uin);
                        self.emit(Notification::ContactOffline { uin });
                    }
                    Err(e) => warn!(error = %e, "bad user-offline"),
                }
                self.send_ack(seq).await;
            }
            ServerCommand::StatusUpdate => {
                match udp::parse_status_update(p) {
                    Ok((uin, status)) => {
                        if let Some(c) = self.contacts.get_mut(uin) {
                            c.status = Some(status);
                        }
                        self.emit(Notification::ContactStatus { uin, status });
                    }
                    Err(e) => warn!(error = %e, "bad status update"),
                }
                self.send_ack(seq).await;
            }
            ServerCommand::OnlineMessage => {
                match udp::parse_online_message(p) {
                    Ok(msg) => self.deliver_relayed(msg),
                    Err(e) => warn!(error = %e, "bad online message"),
                }
                self.send_ack(seq).await;
            }
            ServerCommand::OfflineMessage => {
                match udp::parse_offline_message(p) {
                    Ok(msg) => self.deliver_relayed(msg),
                    Err(e) => warn!(error = %e, "bad offline message"),
                }
                self.send_ack(seq).await;
            }
            ServerCommand::BeginMessages => {
                self.send_ack(seq).await;
            }
            ServerCommand::EndMessages => {
                self.send_ack(seq).await;
                if let Ok(p) = self.channel.ack_messages(&mut self.rng) {
                    self.send_reliable(p, 0).await;
                }
            }
            // unwrapped before dispatch
            ServerCommand::MultiPacket => {}
        }
    }

    fn deliver_relayed(&mut self, msg: udp::RelayedMessage) {
        if msg.kind == TYPE_URL {
            let (description, url) = msg.split_url();
            self.emit(Notification::UrlReceived {
                uin: msg.uin,
                url,
                description,
                stamp: msg.stamp,
            });
        } else {
            self.emit(Notification::MessageReceived {
                uin: msg.uin,
                text: msg.text(),
                stamp: msg.stamp,
            });
        }
    }

    async fn upload_contact_lists(&mut self) {
        let uins: Vec<u32> = self.contacts.uins().collect();
        for chunk in uins.chunks(udp::CONTACTS_PER_PACKET) {
            if let Ok(p) = self.channel.contact_batch(udp::UdpCommand::ContactList, chunk) {
                self.send_reliable(p, 0).await;
            }
        }
        let visible: Vec<u32> = self.contacts.visible_uins().collect();
        if !visible.is_empty() {
            if let Ok(p) = self
                .channel
                .contact_batch(udp::UdpCommand::VisibleList, &visible)
            {
                self.send_reliable(p, 0).await;
            }
        }
        let invisible: Vec<u32> = self.contacts.invisible_uins().collect();
        if !invisible.is_empty() {
            if let Ok(p) = self
                .channel
                .contact_batch(udp::UdpCommand::InvisibleList, &invisible)
            {
                self.send_reliable(p, 0).await;
            }
        }
    }

    // ── Peer link management ─────────────────────────────────────

    fn local_ip(&self) -> u32 {
        self.udp
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| match a.ip() {
                IpAddr::V4(v4) => Some(u32::from(v4)),
                IpAddr::V6(_) => None,
            })
            .unwrap_or(0)
    }

    fn message_port(&self) -> u16 {
        self.registry
            .find_listener(LinkKind::Message)
            .and_then(|id| self.registry.link(id))
            .and_then(|l| l.local_addr)
            .map(|a| a.port())
            .unwrap_or(0)
    }

    async fn open_listener(&mut self, kind: LinkKind) -> Result<u16, TernError> {
        if let Some(id) = self.registry.find_listener(kind) {
            if let Some(port) = self
                .registry
                .link(id)
                .and_then(|l| l.local_addr)
                .map(|a| a.port())
            {
                return Ok(port);
            }
        }
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let local = listener.local_addr()?;
        let id = self.registry.insert_link(Link::listening(kind, local));
        debug!(?kind, port = local.port(), "listener up");

        let pump_tx = self.pump_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if pump_tx
                            .send(PumpMsg::Accepted {
                                listener: id,
                                stream,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        self.emit(Notification::ListenerReady {
            kind,
            port: local.port(),
        });
        Ok(local.port())
    }

    /// Find or create the outbound link of a kind to a peer. The
    /// connect (and any proxy negotiation) runs in a pump task.
    fn open_peer_link(
        &mut self,
        uin: u32,
        kind: LinkKind,
        port_override: Option<u16>,
    ) -> Result<LinkId, TernError> {
        if let Some(id) = self.registry.find_link(uin, kind) {
            return Ok(id);
        }
        let (ip, port) = {
            let contact = self
                .contacts
                .get(uin)
                .filter(|c| c.is_online())
                .ok_or(TernError::InvalidTransition("peer has no known address"))?;
            let port = port_override.unwrap_or(contact.port);
            if port == 0 {
                return Err(TernError::InvalidTransition("peer advertises no port"));
            }
            (contact.connect_ip(self.channel.our_ip), port)
        };

        let mut link = Link::outgoing(kind, uin);
        link.phase.begin_connect()?;
        let id = self.registry.insert_link(link);
        debug!(uin, ?kind, %ip, port, "initiating peer connect");
        self.spawn_connect(id, SocketAddrV4::new(ip, port));
        Ok(id)
    }

    fn spawn_connect(&self, link: LinkId, addr: SocketAddrV4) {
        let pump_tx = self.pump_tx.clone();
        let proxy = self.config.proxy.clone();
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(CONNECT_TIMEOUT, async {
                match &proxy {
                    None => {
                        let stream = TcpStream::connect(SocketAddr::V4(addr)).await?;
                        Ok::<_, TernError>((stream, Vec::new()))
                    }
                    Some(pc) => {
                        let mut stream =
                            TcpStream::connect((pc.host.as_str(), pc.port)).await?;
                        let phases =
                            socks::negotiate(&mut stream, &pc.auth, *addr.ip(), addr.port())
                                .await?;
                        Ok((stream, phases))
                    }
                }
            })
            .await;

            let msg = match attempt {
                Ok(Ok((stream, socks_phases))) => PumpMsg::Connected {
                    link,
                    stream,
                    socks_phases,
                },
                Ok(Err(e)) => PumpMsg::ConnectFailed {
                    link,
                    error: e.to_string(),
                },
                Err(_) => PumpMsg::ConnectFailed {
                    link,
                    error: format!("connect timed out after {CONNECT_TIMEOUT:?}"),
                },
            };
            let _ = pump_tx.send(msg);
        });
    }

    /// Spawn the byte pumps for an established socket.
    fn spawn_io(&self, link: LinkId, stream: TcpStream) -> WriterTx {
        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let pump_tx = self.pump_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = pump_tx.send(PumpMsg::Closed { link });
                        break;
                    }
                    Ok(n) => {
                        if pump_tx
                            .send(PumpMsg::Data {
                                link,
                                bytes: buf[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        writer_tx
    }

    fn send_hello(&mut self, link: LinkId) {
        let hello = Hello::new(
            self.config.uin,
            self.message_port() as u32,
            self.channel.our_ip,
            self.local_ip(),
        );
        let packet = match hello.build() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "hello build failed");
                return;
            }
        };
        if let Some(l) = self.registry.link_mut(link) {
            if let Err(e) = l.send_immediate(packet) {
                warn!(error = %e, "hello send failed");
                self.close_link(link);
            }
        }
    }

    // ── Pump handling ────────────────────────────────────────────

    async fn handle_pump(&mut self, msg: PumpMsg) {
        match msg {
            PumpMsg::Connected {
                link,
                stream,
                socks_phases,
            } => {
                if self.registry.link(link).is_none() {
                    // closed while the connect was in flight
                    return;
                }
                let local = stream.local_addr().ok();
                let remote = stream.peer_addr().ok();
                let writer = self.spawn_io(link, stream);
                if let Some(l) = self.registry.link_mut(link) {
                    l.attach_writer(writer);
                    l.local_addr = local;
                    l.remote_addr = remote;
                    for phase in socks_phases {
                        debug!(?phase, "proxy phase complete");
                        let _ = l.phase.enter_socks(phase);
                    }
                    if let Err(e) = l.phase.enter_hello_wait() {
                        warn!(error = %e, "connect in wrong phase");
                        self.close_link(link);
                        return;
                    }
                }
                self.send_hello(link);
            }
            PumpMsg::ConnectFailed { link, error } => {
                warn!(%error, "peer connect failed");
                self.close_link(link);
            }
            PumpMsg::Accepted { listener, stream } => {
                let Some(kind) = self.registry.link(listener).map(|l| l.kind) else {
                    return;
                };
                let Ok(remote) = stream.peer_addr() else {
                    return;
                };
                let local = stream.local_addr().ok();
                debug!(?kind, %remote, "accepted peer connection");
                let id = self.registry.insert_link(Link::accepted(kind, remote));
                let writer = self.spawn_io(id, stream);
                if let Some(l) = self.registry.link_mut(id) {
                    l.attach_writer(writer);
                    l.local_addr = local;
                }
                self.send_hello(id);
            }
            PumpMsg::Data { link, bytes } => self.handle_data(link, bytes).await,
            PumpMsg::Closed { link } => self.close_link(link),
        }
    }

    async fn handle_data(&mut self, link: LinkId, bytes: Vec<u8>) {
        match self.registry.link_mut(link) {
            Some(l) => l.push_bytes(&bytes),
            None => return,
        }
        loop {
            let Some(phase) = self.registry.link(link).map(|l| l.phase) else {
                return;
            };
            if phase == LinkPhase::Raw {
                let raw = self
                    .registry
                    .link_mut(link)
                    .map(|l| l.take_raw())
                    .unwrap_or_default();
                if !raw.is_empty() {
                    self.handle_raw(link, &raw);
                }
                return;
            }
            let frame = match self.registry.link_mut(link).map(|l| l.next_frame()) {
                Some(Ok(Some(frame))) => frame,
                Some(Ok(None)) => return,
                Some(Err(e)) => {
                    warn!(error = %e, "link framing failed, closing");
                    self.close_link(link);
                    return;
                }
                None => return,
            };
            self.handle_frame(link, frame).await;
        }
    }

    async fn handle_frame(&mut self, link: LinkId, mut frame: Packet) {
        let Some((phase, kind)) = self.registry.link(link).map(|l| (l.phase, l.kind)) else {
            return;
        };

        if phase == LinkPhase::HelloWait {
            let hello = match Hello::parse(&mut frame) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "peer hello failed, closing link");
                    self.close_link(link);
                    return;
                }
            };
            debug!(uin = hello.uin, version = hello.version, "peer hello");
            let flush = {
                let Some(l) = self.registry.link_mut(link) else {
                    return;
                };
                if l.remote_uin == 0 {
                    l.remote_uin = hello.uin;
                }
                l.remote_version = hello.version as u16;
                if l.phase.enter_framed().is_err() {
                    return;
                }
                l.flush_queue()
            };
            match flush {
                Ok(ids) => {
                    for id in ids {
                        self.emit_request(id, RequestStage::Connected);
                        self.emit_request(id, RequestStage::Sent);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "queue flush failed");
                    self.close_link(link);
                    return;
                }
            }
            self.after_hello(link, kind, &hello);
            return;
        }

        match kind {
            LinkKind::Message => match PeerEvent::parse(&mut frame) {
                Ok(event) => self.handle_peer_event(link, event).await,
                Err(e) => warn!(error = %e, "undecodable peer event dropped"),
            },
            LinkKind::Chat => self.handle_chat_frame(link, frame),
            LinkKind::File => self.handle_file_frame(link, frame).await,
        }
    }

    /// Kind-specific startup once the hello exchange completes.
    fn after_hello(&mut self, link: LinkId, kind: LinkKind, hello: &Hello) {
        match kind {
            LinkKind::Message => {}
            LinkKind::Chat => {
                self.adopt_session(link, hello.uin);
                let Some(sid) = self.registry.link(link).and_then(|l| l.session) else {
                    warn!("chat link with no session, closing");
                    self.close_link(link);
                    return;
                };
                if let Some(Session::Chat(cs)) = self.registry.session_mut(sid) {
                    cs.status = ChatStatus::WaitInfo;
                }
                let init = ChatInit {
                    uin: self.config.uin,
                    handle: self.config.nick.clone(),
                    foreground: 0x00FF_FFFF,
                    background: 0,
                };
                match init.build() {
                    Ok(p) => self.send_framed(link, p),
                    Err(e) => warn!(error = %e, "chat init build failed"),
                }
            }
            LinkKind::File => {
                self.adopt_session(link, hello.uin);
                let Some(sid) = self.registry.link(link).and_then(|l| l.session) else {
                    warn!("file link with no session, closing");
                    self.close_link(link);
                    return;
                };
                let init = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) if fs.direction == TransferDirection::Sending => {
                        fs.status = FileStatus::Initializing;
                        Some(FilePacket::Init {
                            count: fs.total_files,
                            total_bytes: fs.total_bytes as u32,
                            speed: fs.speed,
                            nick: self.config.nick.clone(),
                        })
                    }
                    Some(Session::File(fs)) => {
                        fs.status = FileStatus::Initializing;
                        None
                    }
                    _ => None,
                };
                // the sender speaks first: the init negotiation packet
                // is the first framed traffic after the hello
                if let Some(init) = init {
                    self.send_file_packet(link, &init);
                }
            }
        }
    }

    /// Bind an accepted chat/file link to the session that was waiting
    /// for this peer. Outbound links are attached at creation instead.
    fn adopt_session(&mut self, link: LinkId, uin: u32) {
        let Some(l) = self.registry.link(link) else {
            return;
        };
        if l.session.is_some() {
            return;
        }
        let kind = l.kind;
        if let Some(sid) = self.find_waiting_session(uin, kind) {
            self.registry.attach(link, sid);
        }
    }

    /// An inserted-but-unattached session matching peer and link kind.
    fn find_waiting_session(&self, uin: u32, kind: LinkKind) -> Option<SessionId> {
        self.registry
            .session_ids()
            .into_iter()
            .find(|&sid| match self.registry.session(sid) {
                Some(Session::Chat(cs)) => {
                    kind == LinkKind::Chat && cs.remote_uin == uin && cs.link.is_none()
                }
                Some(Session::File(fs)) => {
                    kind == LinkKind::File && fs.remote_uin == uin && fs.link.is_none()
                }
                None => false,
            })
    }

    // ── Peer events ──────────────────────────────────────────────

    fn our_event(&self, kind: EventKind, body: EventBody, status: DeliveryStatus, seq: u32) -> PeerEvent {
        PeerEvent {
            uin: self.config.uin,
            kind,
            body,
            status,
            ip: self.channel.our_ip,
            port: self.message_port() as u32,
            flags: 0x04,
            seq,
        }
    }

    /// Send an event on the peer's message link, creating the link (and
    /// its connect) if needed. `announce` controls request-stage
    /// notifications — acks and cancels are not caller requests.
    fn send_peer_event(&mut self, uin: u32, event: PeerEvent, announce: bool) {
        let id = event.seq;
        let link = match self.open_peer_link(uin, LinkKind::Message, None) {
            Ok(l) => l,
            Err(e) => {
                warn!(uin, error = %e, "no path to peer");
                if announce {
                    self.emit_request(id, RequestStage::Failed);
                }
                return;
            }
        };
        let packet = match event.build() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "event build failed");
                if announce {
                    self.emit_request(id, RequestStage::Failed);
                }
                return;
            }
        };
        let outcome = self
            .registry
            .link_mut(link)
            .map(|l| l.send_seq(packet, id));
        match outcome {
            Some(Ok(SendOutcome::Sent)) => {
                if announce {
                    self.emit_request(id, RequestStage::Sent);
                }
            }
            Some(Ok(SendOutcome::Queued)) => {
                if announce {
                    self.emit_request(id, RequestStage::Connecting);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "event send failed");
                if announce {
                    self.emit_request(id, RequestStage::Failed);
                }
                self.close_link(link);
            }
            None => {}
        }
    }

    fn send_direct_event(&mut self, id: u32, uin: u32, body: EventBody) {
        let event = self.our_event(EventKind::Message, body, DeliveryStatus::ACCEPT, id);
        self.send_peer_event(uin, event, true);
    }

    /// A chat or file request: direct event plus a pending entry that
    /// the peer's ack resolves.
    fn send_peer_request(&mut self, id: u32, uin: u32, body: EventBody, files: Vec<PathBuf>) {
        let event = self.our_event(EventKind::Message, body, DeliveryStatus::ACCEPT, id);
        self.registry.add_outbound(uin, id, event.clone(), files);
        self.send_peer_event(uin, event, true);
    }

    fn send_refusal(&mut self, uin: u32, seq: u32, body: EventBody) {
        let event = self.our_event(EventKind::Ack, body, DeliveryStatus::REFUSE, seq);
        self.send_peer_event(uin, event, false);
    }

    fn cancel_request(&mut self, uin: u32, seq: u32) {
        let body = match self.registry.take_outbound(uin, seq) {
            Some(pending) => pending.event.body,
            None => EventBody::ChatRequest {
                reason: String::new(),
                listen_port: 0,
            },
        };
        let event = self.our_event(EventKind::Cancel, body, DeliveryStatus::ACCEPT, seq);
        self.send_peer_event(uin, event, false);
        if let Some(sid) = self.registry.find_session(uin, seq) {
            self.close_session(sid);
        }
    }

    async fn handle_peer_event(&mut self, link: LinkId, event: PeerEvent) {
        match event.kind {
            EventKind::Message => match &event.body {
                EventBody::Message { text } => {
                    self.emit(Notification::MessageReceived {
                        uin: event.uin,
                        text: text.clone(),
                        stamp: None,
                    });
                    self.ack_peer_event(link, &event);
                }
                EventBody::Url { description, url } => {
                    self.emit(Notification::UrlReceived {
                        uin: event.uin,
                        url: url.clone(),
                        description: description.clone(),
                        stamp: None,
                    });
                    self.ack_peer_event(link, &event);
                }
                EventBody::ChatRequest { reason, .. } => {
                    // surfaced without auto-ack; the caller decides
                    self.registry.add_inbound(event.uin, event.seq, event.clone());
                    self.emit(Notification::ChatRequested {
                        uin: event.uin,
                        reason: reason.clone(),
                        seq: event.seq,
                    });
                }
                EventBody::FileRequest {
                    reason,
                    filename,
                    size,
                    ..
                } => {
                    self.registry.add_inbound(event.uin, event.seq, event.clone());
                    self.emit(Notification::FileRequested {
                        uin: event.uin,
                        reason: reason.clone(),
                        filename: filename.clone(),
                        size: *size,
                        seq: event.seq,
                    });
                }
            },
            EventKind::Ack => self.handle_peer_ack(event),
            EventKind::Cancel => {
                self.registry.take_inbound(event.uin, event.seq);
                self.emit(Notification::RequestCancelled {
                    uin: event.uin,
                    seq: event.seq,
                });
                if let Some(sid) = self.registry.find_session(event.uin, event.seq) {
                    self.close_session(sid);
                }
            }
        }
    }

    fn ack_peer_event(&mut self, link: LinkId, event: &PeerEvent) {
        let ack = self.our_event(
            EventKind::Ack,
            event.body.clone(),
            DeliveryStatus::ACCEPT,
            event.seq,
        );
        let packet = match ack.build() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "ack build failed");
                return;
            }
        };
        if let Some(l) = self.registry.link_mut(link) {
            if let Err(e) = l.send_seq(packet, event.seq) {
                debug!(error = %e, "peer ack send failed");
            }
        }
    }

    fn handle_peer_ack(&mut self, event: PeerEvent) {
        let pending = self.registry.take_outbound(event.uin, event.seq);

        if event.status.is_refusal() {
            let reason = match &event.body {
                EventBody::Message { text } => text.clone(),
                EventBody::Url { description, .. } => description.clone(),
                EventBody::ChatRequest { reason, .. } => reason.clone(),
                EventBody::FileRequest { reason, .. } => reason.clone(),
            };
            self.emit(Notification::Refused {
                id: event.seq,
                reason,
            });
            return;
        }

        self.emit_request(event.seq, RequestStage::Acked);
        match &event.body {
            EventBody::Message { .. } | EventBody::Url { .. } => {
                self.emit_request(event.seq, RequestStage::Succeeded);
            }
            EventBody::ChatRequest { listen_port, .. } => {
                // peer accepted: dial the advertised chat port
                let sid = self
                    .registry
                    .insert_session(Session::Chat(ChatSession::outgoing(event.uin, event.seq)));
                match self.open_peer_link(event.uin, LinkKind::Chat, Some(*listen_port as u16)) {
                    Ok(link) => self.registry.attach(link, sid),
                    Err(e) => {
                        warn!(error = %e, "chat connect-back failed");
                        self.close_session(sid);
                    }
                }
            }
            EventBody::FileRequest { listen_port, size, .. } => {
                let files = pending.map(|p| p.files).unwrap_or_default();
                if files.is_empty() {
                    warn!(seq = event.seq, "file ack without pending offer");
                    return;
                }
                let mut session = FileSession::outgoing(event.uin, event.seq, files);
                session.total_bytes = *size as u64;
                let sid = self.registry.insert_session(Session::File(session));
                match self.open_peer_link(event.uin, LinkKind::File, Some(*listen_port as u16)) {
                    Ok(link) => self.registry.attach(link, sid),
                    Err(e) => {
                        warn!(error = %e, "file connect-back failed");
                        self.close_session(sid);
                    }
                }
            }
        }
    }

    // ── Accept / refuse flows ────────────────────────────────────

    async fn accept_chat(&mut self, uin: u32, seq: u32) {
        let Some(_pending) = self.registry.take_inbound(uin, seq) else {
            warn!(uin, seq, "accept for unknown chat request");
            return;
        };
        let port = match self.open_listener(LinkKind::Chat).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "chat listener failed");
                return;
            }
        };
        self.registry
            .insert_session(Session::Chat(ChatSession::listening(uin, seq)));
        let ack = self.our_event(
            EventKind::Ack,
            EventBody::ChatRequest {
                reason: String::new(),
                listen_port: port as u32,
            },
            DeliveryStatus::ACCEPT,
            seq,
        );
        self.send_peer_event(uin, ack, false);
    }

    async fn accept_file(&mut self, uin: u32, seq: u32) {
        let Some(pending) = self.registry.take_inbound(uin, seq) else {
            warn!(uin, seq, "accept for unknown file request");
            return;
        };
        let (filename, size) = match pending.event.body {
            EventBody::FileRequest { filename, size, .. } => (filename, size),
            _ => {
                warn!(uin, seq, "pending request is not a file offer");
                return;
            }
        };
        let port = match self.open_listener(LinkKind::File).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "file listener failed");
                return;
            }
        };
        self.registry.insert_session(Session::File(FileSession::listening(
            uin,
            seq,
            filename.clone(),
            size,
        )));
        let ack = self.our_event(
            EventKind::Ack,
            EventBody::FileRequest {
                reason: String::new(),
                filename,
                size,
                listen_port: port as u32,
            },
            DeliveryStatus::ACCEPT,
            seq,
        );
        self.send_peer_event(uin, ack, false);
    }

    // ── Chat traffic ─────────────────────────────────────────────

    fn send_framed(&mut self, link: LinkId, packet: Packet) {
        if let Some(l) = self.registry.link_mut(link) {
            if let Err(e) = l.send(packet) {
                warn!(error = %e, "framed send failed");
                self.close_link(link);
            }
        }
    }

    fn chat_write(&mut self, session: SessionId, bytes: Vec<u8>) {
        let link = match self.registry.session(session) {
            Some(Session::Chat(cs)) if cs.is_ready() => cs.link,
            _ => {
                warn!("chat write on a session that is not ready");
                return;
            }
        };
        if let Some(link) = link {
            if let Some(l) = self.registry.link_mut(link) {
                if let Err(e) = l.send_raw(bytes) {
                    warn!(error = %e, "chat write failed");
                    self.close_link(link);
                }
            }
        }
    }

    fn handle_chat_frame(&mut self, link: LinkId, mut frame: Packet) {
        let Some(sid) = self.registry.link(link).and_then(|l| l.session) else {
            warn!("chat frame on a link with no session");
            return;
        };
        let status = match self.registry.session(sid) {
            Some(Session::Chat(cs)) => cs.status,
            _ => return,
        };
        match status {
            ChatStatus::WaitInfo => {
                let init = match ChatInit::parse(&mut frame) {
                    Ok(i) => i,
                    Err(e) => {
                        warn!(error = %e, "bad chat init, closing");
                        self.close_link(link);
                        return;
                    }
                };
                if let Some(Session::Chat(cs)) = self.registry.session_mut(sid) {
                    cs.record_init(&init);
                    cs.status = ChatStatus::WaitFont;
                }
                let font = ChatFont {
                    size: 12,
                    style: StyleFlags::empty(),
                    name: "Helvetica".into(),
                };
                match font.build() {
                    Ok(p) => self.send_framed(link, p),
                    Err(e) => warn!(error = %e, "chat font build failed"),
                }
            }
            ChatStatus::WaitFont => {
                let font = match ChatFont::parse(&mut frame) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "bad chat font, closing");
                        self.close_link(link);
                        return;
                    }
                };
                let uin = match self.registry.session_mut(sid) {
                    Some(Session::Chat(cs)) => {
                        cs.record_font(font);
                        cs.status = ChatStatus::Ready;
                        cs.remote_uin
                    }
                    _ => return,
                };
                // everything framed has been said: switch to the raw
                // byte stream, draining any bytes that followed the
                // font packet in the same read
                let leftover = match self.registry.link_mut(link) {
                    Some(l) => {
                        if l.phase.enter_raw().is_err() {
                            return;
                        }
                        l.take_raw()
                    }
                    None => return,
                };
                self.emit(Notification::ChatSessionUp { session: sid, uin });
                if !leftover.is_empty() {
                    self.handle_raw(link, &leftover);
                }
            }
            other => {
                debug!(?other, "unexpected chat frame, dropped");
            }
        }
    }

    fn handle_raw(&mut self, link: LinkId, bytes: &[u8]) {
        let Some(sid) = self.registry.link(link).and_then(|l| l.session) else {
            return;
        };
        let outputs = match self.registry.session_mut(sid) {
            Some(Session::Chat(cs)) => cs.transcode(bytes),
            _ => return,
        };
        for output in outputs {
            match output {
                ChatOutput::Text(text) => self.emit(Notification::ChatData { session: sid, text }),
                ChatOutput::Control(change) => {
                    self.emit(Notification::ChatStyle {
                        session: sid,
                        change,
                    });
                }
            }
        }
    }

    // ── File traffic ─────────────────────────────────────────────

    fn send_file_packet(&mut self, link: LinkId, packet: &FilePacket) {
        match packet.build() {
            Ok(p) => self.send_framed(link, p),
            Err(e) => warn!(error = %e, "file packet build failed"),
        }
    }

    async fn handle_file_frame(&mut self, link: LinkId, mut frame: Packet) {
        let Some(sid) = self.registry.link(link).and_then(|l| l.session) else {
            warn!("file frame on a link with no session");
            return;
        };
        let packet = match FilePacket::parse(&mut frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "bad file packet dropped");
                return;
            }
        };
        let direction = match self.registry.session(sid) {
            Some(Session::File(fs)) => fs.direction,
            _ => return,
        };

        match (direction, packet) {
            (TransferDirection::Receiving, FilePacket::Init { count, total_bytes, speed, nick }) => {
                let (reply, uin) = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => {
                        fs.total_files = count;
                        fs.total_bytes = total_bytes as u64;
                        fs.speed = speed;
                        fs.remote_handle = nick;
                        fs.status = FileStatus::NextFile;
                        (
                            FilePacket::InitAck {
                                speed: fs.speed,
                                nick: self.config.nick.clone(),
                            },
                            fs.remote_uin,
                        )
                    }
                    _ => return,
                };
                self.emit(Notification::FileSessionUp { session: sid, uin });
                self.send_file_packet(link, &reply);
            }
            (TransferDirection::Sending, FilePacket::InitAck { speed, nick }) => {
                let uin = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => {
                        fs.speed = speed;
                        fs.remote_handle = nick;
                        fs.status = FileStatus::NextFile;
                        fs.remote_uin
                    }
                    _ => return,
                };
                self.emit(Notification::FileSessionUp { session: sid, uin });
                self.announce_current_file(sid, link).await;
            }
            (TransferDirection::Receiving, FilePacket::Header { filename, size, speed }) => {
                let reply = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => {
                        fs.speed = speed;
                        fs.begin_file(filename, size)
                    }
                    _ => return,
                };
                let sink = match &self.config.download_dir {
                    Some(dir) => {
                        let name = match self.registry.session(sid) {
                            Some(Session::File(fs)) => fs.current_file.clone(),
                            _ => return,
                        };
                        match FileSink::create(dir, &name).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "sink create failed, closing");
                                self.close_session(sid);
                                return;
                            }
                        }
                    }
                    None => FileSink::Memory(Vec::new()),
                };
                if let Some(Session::File(fs)) = self.registry.session_mut(sid) {
                    fs.sink = Some(sink);
                }
                self.send_file_packet(link, &reply);
            }
            (TransferDirection::Sending, FilePacket::Position { offset, .. }) => {
                let seek = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => match fs.source.as_mut() {
                        Some(source) => {
                            fs.current_progress = offset as u64;
                            fs.status = FileStatus::Transferring;
                            Some(source.seek(offset as u64).await)
                        }
                        None => None,
                    },
                    _ => return,
                };
                match seek {
                    Some(Ok(())) => self.drive_send(sid, link).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "seek failed, closing");
                        self.close_session(sid);
                    }
                    None => warn!("position before header, dropped"),
                }
            }
            (_, FilePacket::Speed { speed }) => {
                if let Some(Session::File(fs)) = self.registry.session_mut(sid) {
                    fs.speed = speed;
                }
            }
            (TransferDirection::Sending, FilePacket::Stop { .. }) => {
                let more = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => fs.advance_file(),
                    _ => return,
                };
                if more {
                    self.announce_current_file(sid, link).await;
                } else {
                    self.emit(Notification::FileDone { session: sid });
                    self.close_session(sid);
                }
            }
            (TransferDirection::Receiving, FilePacket::Data { bytes }) => {
                let result = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => {
                        let done = fs.write_chunk(&bytes).await;
                        done.map(|d| {
                            (d, fs.current_file.clone(), fs.transferred, fs.total_bytes, fs.status)
                        })
                    }
                    _ => return,
                };
                match result {
                    Ok((file_done, filename, transferred, total, status)) => {
                        self.emit(Notification::FileProgress {
                            session: sid,
                            filename,
                            transferred,
                            total,
                        });
                        if file_done && status == FileStatus::Done {
                            self.emit(Notification::FileDone { session: sid });
                            self.close_session(sid);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "chunk write failed, closing");
                        self.close_session(sid);
                    }
                }
            }
            (direction, packet) => {
                debug!(?direction, kind = packet.kind(), "unexpected file packet");
            }
        }
    }

    /// Sender: open the current file and announce its header.
    async fn announce_current_file(&mut self, sid: SessionId, link: LinkId) {
        let path = match self.registry.session(sid) {
            Some(Session::File(fs)) => fs.files.get(fs.current_index as usize).cloned(),
            _ => None,
        };
        let Some(path) = path else {
            self.emit(Notification::FileDone { session: sid });
            self.close_session(sid);
            return;
        };
        match FileSource::open(&path).await {
            Ok((source, size)) => {
                let header = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => {
                        fs.source = Some(source);
                        fs.current_size = size;
                        fs.current_progress = 0;
                        fs.current_file = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        fs.current_header()
                    }
                    _ => return,
                };
                if let Some(header) = header {
                    self.send_file_packet(link, &header);
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file open failed, closing");
                self.close_session(sid);
            }
        }
    }

    /// Sender: stream the current file's chunks.
    async fn drive_send(&mut self, sid: SessionId, link: LinkId) {
        loop {
            let chunk = match self.registry.session_mut(sid) {
                Some(Session::File(fs)) => fs.read_chunk().await,
                _ => return,
            };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "file read failed, closing");
                    self.close_session(sid);
                    return;
                }
            };
            if chunk.is_empty() {
                let more = match self.registry.session_mut(sid) {
                    Some(Session::File(fs)) => fs.advance_file(),
                    _ => return,
                };
                if more {
                    self.announce_current_file(sid, link).await;
                } else {
                    self.emit(Notification::FileDone { session: sid });
                    self.close_session(sid);
                }
                return;
            }
            let progress = match self.registry.session(sid) {
                Some(Session::File(fs)) => {
                    (fs.current_file.clone(), fs.transferred, fs.total_bytes)
                }
                _ => return,
            };
            self.send_file_packet(link, &FilePacket::Data { bytes: chunk });
            if self.registry.link(link).is_none() {
                return;
            }
            self.emit(Notification::FileProgress {
                session: sid,
                filename: progress.0,
                transferred: progress.1,
                total: progress.2,
            });
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Remove a link, resolve every packet still queued on it exactly
    /// once, and cascade to any attached session. Re-entrant: a second
    /// close of the same id is a no-op.
    fn close_link(&mut self, id: LinkId) {
        let Some(mut link) = self.registry.remove_link(id) else {
            return;
        };
        debug!(?id, uin = link.remote_uin, "closing link");
        for packet_id in link.fail_queue() {
            self.emit_request(packet_id, RequestStage::Failed);
        }
        if let Some(sid) = link.session {
            self.close_session(sid);
        }
    }

    /// Remove a session and cascade to its link. The mutual teardown
    /// terminates because each side removes itself before crossing.
    fn close_session(&mut self, sid: SessionId) {
        let Some(session) = self.registry.remove_session(sid) else {
            return;
        };
        if let Some(link) = session.link() {
            self.close_link(link);
        }
        match session {
            Session::Chat(_) => self.emit(Notification::ChatClosed { session: sid }),
            Session::File(_) => self.emit(Notification::FileClosed { session: sid }),
        }
    }
}
