//! End-to-end scenarios over localhost: two engines talking directly,
//! a scripted SOCKS5 proxy in the middle, file transfer accept flows,
//! and the UDP server channel against a fake server socket.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use tern_core::cipher;
use tern_core::config::{EngineConfig, ProxyAuth, ProxyConfig};
use tern_core::engine::{Engine, EngineHandle, Route};
use tern_core::link::LinkKind;
use tern_core::notify::{DisconnectReason, Notification, RequestStage};
use tern_core::resolver::SystemResolver;
use tern_core::udp::{ServerCommand, UdpHeader, UDP_VERSION};

const LOCALHOST_U32: u32 = 0x7F00_0001;

// ── Helpers ──────────────────────────────────────────────────────

struct TestEngine {
    handle: EngineHandle,
    rx: mpsc::UnboundedReceiver<Notification>,
    msg_port: u16,
    /// The fake central server's datagram socket.
    server: UdpSocket,
}

/// Spin up an engine, point its UDP channel at a fake server socket,
/// and wait for the message listener to come up.
async fn spawn_engine(
    uin: u32,
    nick: &str,
    proxy: Option<ProxyConfig>,
    download_dir: Option<PathBuf>,
) -> TestEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();

    let mut config = EngineConfig::new(uin, "hunter2", nick);
    config.proxy = proxy;
    config.download_dir = download_dir;
    config.udp_expire_secs = 0;

    let (engine, handle, mut rx) = Engine::new(config, Box::new(SystemResolver));
    tokio::spawn(engine.run());

    handle.connect("127.0.0.1", server_port);
    let msg_port = loop {
        match next(&mut rx).await {
            Notification::ListenerReady {
                kind: LinkKind::Message,
                port,
            } => break port,
            _ => {}
        }
    };

    TestEngine {
        handle,
        rx,
        msg_port,
        server,
    }
}

/// Next notification, guarded by a timeout.
async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("engine stopped")
}

/// Skip notifications until the predicate matches.
async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Notification>, pred: F) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    loop {
        let n = next(rx).await;
        if pred(&n) {
            return n;
        }
    }
}

/// Assert that nothing matching the predicate arrives for a while.
async fn assert_quiet<F>(rx: &mut mpsc::UnboundedReceiver<Notification>, pred: F)
where
    F: Fn(&Notification) -> bool,
{
    let deadline = tokio::time::sleep(Duration::from_millis(300));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return,
            n = rx.recv() => {
                if let Some(n) = n {
                    assert!(!pred(&n), "unexpected notification: {n:?}");
                } else {
                    return;
                }
            }
        }
    }
}

fn introduce(a: &TestEngine, b: &TestEngine, b_uin: u32) {
    a.handle
        .set_contact_endpoint(b_uin, LOCALHOST_U32, b.msg_port, true);
}

// ── Direct connect ───────────────────────────────────────────────

#[tokio::test]
async fn clean_connect_fires_one_connected_per_request() {
    let mut a = spawn_engine(1001, "alice", None, None).await;
    let mut b = spawn_engine(1002, "bob", None, None).await;
    introduce(&a, &b, 1002);
    b.handle.set_contact_endpoint(1001, LOCALHOST_U32, a.msg_port, true);

    let id = a.handle.send_message(1002, "hello bob", Route::Direct);

    // stages arrive in order: Connecting, Connected, Sent, Acked
    let mut stages = Vec::new();
    while stages.last() != Some(&RequestStage::Succeeded) {
        if let Notification::Request { id: got, stage } = next(&mut a.rx).await {
            assert_eq!(got, id);
            stages.push(stage);
        }
    }
    assert_eq!(
        stages,
        vec![
            RequestStage::Connecting,
            RequestStage::Connected,
            RequestStage::Sent,
            RequestStage::Acked,
            RequestStage::Succeeded,
        ]
    );

    let n = wait_for(&mut b.rx, |n| matches!(n, Notification::MessageReceived { .. })).await;
    match n {
        Notification::MessageReceived { uin, text, stamp } => {
            assert_eq!(uin, 1001);
            assert_eq!(text, "hello bob");
            assert!(stamp.is_none());
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn direct_send_without_address_fails() {
    let mut a = spawn_engine(1011, "alice", None, None).await;
    let id = a.handle.send_message(9999, "to nowhere", Route::Direct);
    let n = wait_for(&mut a.rx, |n| matches!(n, Notification::Request { .. })).await;
    assert_eq!(
        n,
        Notification::Request {
            id,
            stage: RequestStage::Failed
        }
    );
}

// ── Sends queued while connecting ────────────────────────────────

#[tokio::test]
async fn queued_sends_flush_in_order_once_connected() {
    let mut a = spawn_engine(1021, "alice", None, None).await;
    let mut b = spawn_engine(1022, "bob", None, None).await;
    introduce(&a, &b, 1022);

    let ids = [
        a.handle.send_message(1022, "first", Route::Direct),
        a.handle.send_message(1022, "second", Route::Direct),
        a.handle.send_message(1022, "third", Route::Direct),
    ];

    let mut texts = Vec::new();
    while texts.len() < 3 {
        if let Notification::MessageReceived { text, .. } = next(&mut b.rx).await {
            texts.push(text);
        }
    }
    assert_eq!(texts, vec!["first", "second", "third"]);

    // every request resolves with an ack from the peer
    for id in ids {
        wait_for(&mut a.rx, |n| {
            matches!(n, Notification::Request { id: got, stage: RequestStage::Succeeded } if *got == id)
        })
        .await;
    }
}

// ── SOCKS5 tunnel ────────────────────────────────────────────────

/// A scripted SOCKS5 proxy requiring username/password; relays the
/// tunneled connection byte-for-byte after the CONNECT.
async fn run_password_proxy(listener: TcpListener) {
    let (mut client, _) = listener.accept().await.unwrap();

    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [5, 1, 2]);
    client.write_all(&[5, 2]).await.unwrap();

    let mut head = [0u8; 2];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 1);
    let mut user = vec![0u8; head[1] as usize];
    client.read_exact(&mut user).await.unwrap();
    let mut plen = [0u8; 1];
    client.read_exact(&mut plen).await.unwrap();
    let mut pass = vec![0u8; plen[0] as usize];
    client.read_exact(&mut pass).await.unwrap();
    client.write_all(&[1, 0]).await.unwrap();

    let mut req = [0u8; 10];
    client.read_exact(&mut req).await.unwrap();
    assert_eq!(&req[..4], &[5, 1, 0, 1]);
    let dest_ip = std::net::Ipv4Addr::new(req[4], req[5], req[6], req[7]);
    let dest_port = u16::from_be_bytes([req[8], req[9]]);

    let mut upstream = tokio::net::TcpStream::connect((dest_ip, dest_port))
        .await
        .unwrap();
    client
        .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

#[tokio::test]
async fn message_delivery_through_socks5_proxy() {
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy_listener.local_addr().unwrap().port();
    tokio::spawn(run_password_proxy(proxy_listener));

    let proxy = ProxyConfig {
        host: "127.0.0.1".into(),
        port: proxy_port,
        auth: ProxyAuth::Password {
            username: "alice".into(),
            password: "sekrit".into(),
        },
    };
    let mut a = spawn_engine(1031, "alice", Some(proxy), None).await;
    let mut b = spawn_engine(1032, "bob", None, None).await;
    introduce(&a, &b, 1032);

    let id = a.handle.send_message(1032, "via proxy", Route::Direct);

    let n = wait_for(&mut b.rx, |n| matches!(n, Notification::MessageReceived { .. })).await;
    assert!(matches!(
        n,
        Notification::MessageReceived { uin: 1031, .. }
    ));
    wait_for(&mut a.rx, |n| {
        matches!(n, Notification::Request { id: got, stage: RequestStage::Succeeded } if *got == id)
    })
    .await;
}

// ── Chat sessions ────────────────────────────────────────────────

#[tokio::test]
async fn chat_request_accept_data_and_mutual_teardown() {
    let mut a = spawn_engine(1041, "alice", None, None).await;
    let mut b = spawn_engine(1042, "bob", None, None).await;
    introduce(&a, &b, 1042);
    b.handle.set_contact_endpoint(1041, LOCALHOST_U32, a.msg_port, true);

    let req_id = a.handle.send_chat_request(1042, "let's talk");

    let (uin, seq) = match wait_for(&mut b.rx, |n| matches!(n, Notification::ChatRequested { .. }))
        .await
    {
        Notification::ChatRequested { uin, reason, seq } => {
            assert_eq!(uin, 1041);
            assert_eq!(reason, "let's talk");
            (uin, seq)
        }
        _ => unreachable!(),
    };
    assert_eq!(seq, req_id);

    b.handle.accept_chat_request(uin, seq);

    let a_session = match wait_for(&mut a.rx, |n| matches!(n, Notification::ChatSessionUp { .. }))
        .await
    {
        Notification::ChatSessionUp { session, uin } => {
            assert_eq!(uin, 1042);
            session
        }
        _ => unreachable!(),
    };
    let b_session = match wait_for(&mut b.rx, |n| matches!(n, Notification::ChatSessionUp { .. }))
        .await
    {
        Notification::ChatSessionUp { session, uin } => {
            assert_eq!(uin, 1041);
            session
        }
        _ => unreachable!(),
    };

    a.handle.chat_send(a_session, "hi from alice");
    let n = wait_for(&mut b.rx, |n| matches!(n, Notification::ChatData { .. })).await;
    match n {
        Notification::ChatData { session, text } => {
            assert_eq!(session, b_session);
            assert_eq!(text, "hi from alice");
        }
        _ => unreachable!(),
    }

    b.handle.chat_send(b_session, "hi back");
    let n = wait_for(&mut a.rx, |n| matches!(n, Notification::ChatData { .. })).await;
    assert!(matches!(n, Notification::ChatData { text, .. } if text == "hi back"));

    // closing one side tears down both sessions exactly once
    a.handle.chat_close(a_session);
    wait_for(&mut a.rx, |n| {
        matches!(n, Notification::ChatClosed { session } if *session == a_session)
    })
    .await;
    wait_for(&mut b.rx, |n| {
        matches!(n, Notification::ChatClosed { session } if *session == b_session)
    })
    .await;

    assert_quiet(&mut a.rx, |n| matches!(n, Notification::ChatClosed { .. })).await;
    assert_quiet(&mut b.rx, |n| matches!(n, Notification::ChatClosed { .. })).await;
}

#[tokio::test]
async fn refused_chat_request_carries_reason() {
    let mut a = spawn_engine(1051, "alice", None, None).await;
    let mut b = spawn_engine(1052, "bob", None, None).await;
    introduce(&a, &b, 1052);
    b.handle.set_contact_endpoint(1051, LOCALHOST_U32, a.msg_port, true);

    let id = a.handle.send_chat_request(1052, "chat?");

    let seq = match wait_for(&mut b.rx, |n| matches!(n, Notification::ChatRequested { .. })).await {
        Notification::ChatRequested { seq, .. } => seq,
        _ => unreachable!(),
    };
    b.handle.refuse_chat_request(1051, seq, "busy right now");

    let n = wait_for(&mut a.rx, |n| matches!(n, Notification::Refused { .. })).await;
    assert_eq!(
        n,
        Notification::Refused {
            id,
            reason: "busy right now".into()
        }
    );
}

// ── File transfer ────────────────────────────────────────────────

#[tokio::test]
async fn accepted_file_request_connects_back_and_transfers() {
    let dir = std::env::temp_dir().join(format!("tern-it-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();

    // source file on the offering side
    let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let source_path = dir.join("offer.bin");
    tokio::fs::write(&source_path, &payload).await.unwrap();

    let download_dir = dir.join("downloads");
    tokio::fs::create_dir_all(&download_dir).await.unwrap();

    let mut a = spawn_engine(1061, "alice", None, None).await;
    let mut b = spawn_engine(1062, "bob", None, Some(download_dir.clone())).await;
    introduce(&a, &b, 1062);
    b.handle.set_contact_endpoint(1061, LOCALHOST_U32, a.msg_port, true);

    a.handle
        .send_file_request(1062, "here you go", vec![source_path.clone()]);

    let seq = match wait_for(&mut b.rx, |n| matches!(n, Notification::FileRequested { .. })).await {
        Notification::FileRequested {
            uin,
            filename,
            size,
            seq,
            ..
        } => {
            assert_eq!(uin, 1061);
            assert_eq!(filename, "offer.bin");
            assert_eq!(size as usize, payload.len());
            seq
        }
        _ => unreachable!(),
    };

    b.handle.accept_file_request(1061, seq);

    // the accept drives the offerer's outbound connect to the
    // advertised port; the init negotiation runs, then data flows
    wait_for(&mut a.rx, |n| matches!(n, Notification::FileSessionUp { .. })).await;
    wait_for(&mut b.rx, |n| matches!(n, Notification::FileSessionUp { .. })).await;

    wait_for(&mut b.rx, |n| matches!(n, Notification::FileDone { .. })).await;
    wait_for(&mut a.rx, |n| matches!(n, Notification::FileDone { .. })).await;

    let received = tokio::fs::read(download_dir.join("offer.bin")).await.unwrap();
    assert_eq!(received, payload);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn file_progress_reports_monotonic_counts() {
    let dir = std::env::temp_dir().join(format!("tern-prog-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let payload = vec![0x5Au8; 10_000];
    let source_path = dir.join("data.bin");
    tokio::fs::write(&source_path, &payload).await.unwrap();

    let mut a = spawn_engine(1071, "alice", None, None).await;
    let mut b = spawn_engine(1072, "bob", None, None).await;
    introduce(&a, &b, 1072);
    b.handle.set_contact_endpoint(1071, LOCALHOST_U32, a.msg_port, true);

    a.handle.send_file_request(1072, "", vec![source_path]);
    let seq = match wait_for(&mut b.rx, |n| matches!(n, Notification::FileRequested { .. })).await {
        Notification::FileRequested { seq, .. } => seq,
        _ => unreachable!(),
    };
    b.handle.accept_file_request(1071, seq);

    let mut last = 0u64;
    loop {
        match next(&mut b.rx).await {
            Notification::FileProgress {
                transferred, total, ..
            } => {
                assert!(transferred >= last);
                assert_eq!(total, payload.len() as u64);
                last = transferred;
            }
            Notification::FileDone { .. } => break,
            _ => {}
        }
    }
    assert_eq!(last, payload.len() as u64);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// ── UDP server channel ───────────────────────────────────────────

fn build_server_packet(command: ServerCommand, seq: u16, payload: &[u8]) -> Vec<u8> {
    let header = UdpHeader {
        version: UDP_VERSION,
        uin: 0,
        session: 0,
        command: command as u16,
        seq1: seq,
        seq2: 0,
    };
    let mut p = header.build().unwrap();
    p.append_bytes(payload).unwrap();
    let mut data = p.into_bytes();
    let mut rng = cipher::PacketRng::seeded(0xFEED);
    cipher::encode(&mut data, &mut rng).unwrap();
    data
}

#[tokio::test]
async fn corrupted_datagram_is_dropped_and_login_still_completes() {
    let mut a = spawn_engine(1081, "alice", None, None).await;

    a.handle.login(0);

    // the fake server receives the (scrambled) login request
    let mut buf = vec![0u8; 2048];
    let (n, engine_addr) = a.server.recv_from(&mut buf).await.unwrap();
    let mut login = buf[..n].to_vec();
    cipher::decode(&mut login).unwrap();

    // garbage first: must be dropped without an ack and without a crash
    a.server.send_to(&[0xA5; 64], engine_addr).await.unwrap();
    let no_ack = tokio::time::timeout(
        Duration::from_millis(400),
        a.server.recv_from(&mut buf),
    )
    .await;
    // anything that did arrive would be a retransmitted login, never an
    // ack of the garbage — acks reuse the garbage's sequence number
    if let Ok(Ok((n, _))) = no_ack {
        let mut data = buf[..n].to_vec();
        cipher::decode(&mut data).unwrap();
        let mut p = tern_core::packet::Packet::from_bytes(&data).unwrap();
        let header = UdpHeader::parse(&mut p).unwrap();
        assert_ne!(header.command, tern_core::udp::UdpCommand::Ack as u16);
    }

    // then a proper login reply: external address 10.0.0.9
    let reply = build_server_packet(
        ServerCommand::LoginReply,
        7,
        &0x0A00_0009u32.to_be_bytes(),
    );
    a.server.send_to(&reply, engine_addr).await.unwrap();

    wait_for(&mut a.rx, |n| matches!(n, Notification::LoggedIn)).await;
}

#[tokio::test]
async fn unacked_login_exhausts_retries_with_one_disconnect() {
    // udp_expire_secs = 0: every sweep tick retransmits, so the six
    // retries and the exhaustion land within a few seconds
    let mut a = spawn_engine(1091, "alice", None, None).await;

    a.handle.login(0);

    // count login datagrams arriving at the silent server
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let server = a.server;
    let seen = counter.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while server.recv_from(&mut buf).await.is_ok() {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let n = tokio::time::timeout(Duration::from_secs(15), async {
        wait_for(&mut a.rx, |n| matches!(n, Notification::Disconnected(_))).await
    })
    .await
    .expect("no disconnect within the retry window");
    assert_eq!(
        n,
        Notification::Disconnected(DisconnectReason::RetryExhausted)
    );

    // 1 initial + 6 retransmissions
    assert_eq!(
        counter.load(std::sync::atomic::Ordering::SeqCst),
        7,
        "login transmission count"
    );

    assert_quiet(&mut a.rx, |n| matches!(n, Notification::Disconnected(_))).await;
}

#[tokio::test]
async fn presence_updates_feed_the_contact_directory() {
    let mut a = spawn_engine(1101, "alice", None, None).await;
    a.handle.login(0);

    let mut buf = vec![0u8; 2048];
    let (_, engine_addr) = a.server.recv_from(&mut buf).await.unwrap();

    // peer 555 comes online: uin, ip(n), port, real_ip(n), flag, status
    let mut payload = Vec::new();
    payload.extend_from_slice(&555u32.to_le_bytes());
    payload.extend_from_slice(&0x0A00_0005u32.to_be_bytes());
    payload.extend_from_slice(&4321u32.to_le_bytes());
    payload.extend_from_slice(&0xC0A8_0105u32.to_be_bytes());
    payload.push(0x04);
    payload.extend_from_slice(&0u32.to_le_bytes());

    let packet = build_server_packet(ServerCommand::UserOnline, 21, &payload);
    a.server.send_to(&packet, engine_addr).await.unwrap();

    let n = wait_for(&mut a.rx, |n| matches!(n, Notification::ContactOnline { .. })).await;
    assert_eq!(
        n,
        Notification::ContactOnline {
            uin: 555,
            status: 0
        }
    );

    let packet = build_server_packet(ServerCommand::UserOffline, 22, &555u32.to_le_bytes());
    a.server.send_to(&packet, engine_addr).await.unwrap();
    let n = wait_for(&mut a.rx, |n| matches!(n, Notification::ContactOffline { .. })).await;
    assert_eq!(n, Notification::ContactOffline { uin: 555 });
}
