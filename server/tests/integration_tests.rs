//! Integration tests driving the server through its real TCP surface.

use std::net::SocketAddr;
use std::time::Duration;

use server::server::{MazeServer, ShutdownHandle, DEFAULT_TEMPLATE};
use shared::{send_packet, FrameReader, Packet, PacketHeader, PacketType};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A single-file north-south corridor with three free cells. Geometry used
/// by the movement and laser tests: both occupants share one column, so
/// every clear line of sight runs along the initial (north) gaze axis.
const CORRIDOR_TEMPLATE: [&str; 5] = [
    "***", //
    "* *",
    "* *",
    "* *",
    "***",
];

async fn start_server<S: AsRef<str>>(
    template: &[S],
) -> (SocketAddr, ShutdownHandle, JoinHandle<()>) {
    let server = MazeServer::bind("127.0.0.1:0", template)
        .await
        .expect("server should bind");
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let join = tokio::spawn(server.run());
    (addr, handle, join)
}

async fn stop_server(handle: ShutdownHandle, join: JoinHandle<()>) {
    handle.shutdown();
    timeout(Duration::from_secs(10), join)
        .await
        .expect("server should stop after shutdown")
        .unwrap();
}

struct TestClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        TestClient {
            reader: FrameReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, ty: PacketType, sign: i8, payload: Option<&[u8]>) {
        let mut header = PacketHeader {
            param1: sign as u8,
            size: payload.map_or(0, |p| p.len() as u16),
            ..PacketHeader::new(ty)
        };
        send_packet(&mut self.writer, &mut header, payload)
            .await
            .expect("send");
    }

    async fn login(&mut self, avatar: u8, name: &str) {
        let mut header = PacketHeader {
            param1: avatar,
            size: name.len() as u16,
            ..PacketHeader::new(PacketType::Login)
        };
        send_packet(&mut self.writer, &mut header, Some(name.as_bytes()))
            .await
            .expect("send login");
    }

    async fn recv(&mut self) -> Packet {
        timeout(RECV_TIMEOUT, self.reader.read_packet())
            .await
            .expect("timed out waiting for a frame")
            .expect("receive")
    }

    /// Reads frames until one of the given type arrives.
    async fn recv_type(&mut self, ty: PacketType) -> Packet {
        loop {
            let packet = self.recv().await;
            if packet.header.ty == ty as u8 {
                return packet;
            }
        }
    }

    /// Collects every frame that arrives within the window.
    async fn collect_for(&mut self, window: Duration) -> Vec<Packet> {
        let mut frames = Vec::new();
        let deadline = std::time::Instant::now() + window;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return frames;
            }
            match timeout(deadline - now, self.reader.read_packet()).await {
                Ok(Ok(packet)) => frames.push(packet),
                Ok(Err(_)) | Err(_) => return frames,
            }
        }
    }

    /// Reads and discards frames until the connection stays quiet.
    async fn drain(&mut self, quiet: Duration) {
        while let Ok(Ok(_)) = timeout(quiet, self.reader.read_packet()).await {}
    }
}

fn frames_of(frames: &[Packet], ty: PacketType) -> usize {
    frames.iter().filter(|p| p.header.ty == ty as u8).count()
}

fn scores_for(frames: &[Packet], avatar: u8) -> Vec<i8> {
    frames
        .iter()
        .filter(|p| p.header.ty == PacketType::Score as u8 && p.header.param1 == avatar)
        .map(|p| p.header.param2 as i8)
        .collect()
}

#[tokio::test]
async fn connect_and_disconnect_leaves_server_accepting() {
    let (addr, handle, join) = start_server(&DEFAULT_TEMPLATE).await;

    // Connect, read nothing, hang up immediately.
    drop(TcpStream::connect(addr).await.expect("first connect"));

    // The server keeps accepting.
    drop(TcpStream::connect(addr).await.expect("second connect"));

    // With every client gone the registry drains and shutdown completes
    // promptly.
    sleep(Duration::from_millis(200)).await;
    stop_server(handle, join).await;
}

#[tokio::test]
async fn login_collision_gets_inuse_and_connection_survives() {
    let (addr, handle, join) = start_server(&DEFAULT_TEMPLATE).await;

    let mut alice = TestClient::connect(addr).await;
    alice.login(b'A', "alice").await;
    alice.recv_type(PacketType::Ready).await;

    let mut bob = TestClient::connect(addr).await;
    bob.login(b'A', "bob").await;
    bob.recv_type(PacketType::InUse).await;

    // Still connected; retrying with a free avatar works.
    bob.login(b'B', "bob").await;
    bob.recv_type(PacketType::Ready).await;

    drop(alice);
    drop(bob);
    stop_server(handle, join).await;
}

#[tokio::test]
async fn moves_are_reflected_in_peer_views() {
    let (addr, handle, join) = start_server(&CORRIDOR_TEMPLATE).await;

    let mut alice = TestClient::connect(addr).await;
    alice.login(b'A', "alice").await;
    alice.recv_type(PacketType::Ready).await;

    let mut bob = TestClient::connect(addr).await;
    bob.login(b'B', "bob").await;
    bob.recv_type(PacketType::Ready).await;

    // Let the login redraws settle.
    alice.drain(Duration::from_millis(300)).await;
    bob.drain(Duration::from_millis(300)).await;

    // Shuffle both players up and down the corridor, pausing so the
    // commands apply in send order. Whatever the random starting
    // arrangement, somebody moves every round, and over three rounds each
    // connection observes grid changes: as a mover (its own view shifts)
    // or as the southernmost onlooker (the corridor runs north, so the
    // bottom cell sees everything above it).
    let step = Duration::from_millis(30);
    for _ in 0..3 {
        alice.send(PacketType::Move, 1, None).await;
        sleep(step).await;
        alice.send(PacketType::Move, -1, None).await;
        sleep(step).await;
        bob.send(PacketType::Move, 1, None).await;
        sleep(step).await;
        bob.send(PacketType::Move, -1, None).await;
        sleep(step).await;
    }

    let alice_frames = alice.collect_for(Duration::from_secs(1)).await;
    let bob_frames = bob.collect_for(Duration::from_secs(1)).await;
    for frames in [&alice_frames, &bob_frames] {
        assert!(
            frames_of(frames, PacketType::Show) > 0,
            "moves should surface as SHOW frames"
        );
        assert_eq!(
            frames_of(frames, PacketType::Clear),
            0,
            "a move needs no CLEAR"
        );
    }

    drop(alice);
    drop(bob);
    stop_server(handle, join).await;
}

#[tokio::test]
async fn laser_hit_round_trip() {
    let (addr, handle, join) = start_server(&CORRIDOR_TEMPLATE).await;

    let mut alice = TestClient::connect(addr).await;
    alice.login(b'A', "alice").await;
    alice.recv_type(PacketType::Ready).await;

    let mut bob = TestClient::connect(addr).await;
    bob.login(b'B', "bob").await;
    bob.recv_type(PacketType::Ready).await;

    alice.drain(Duration::from_millis(300)).await;
    bob.drain(Duration::from_millis(300)).await;

    // Alice sweeps both corridor directions: fire north, about-face, fire
    // south. Exactly one of the shots has a clear line to Bob, and by the
    // time of the second shot a hit Bob is still in purgatory, off the
    // grid, so he cannot be hit twice.
    alice.send(PacketType::Fire, 0, None).await;
    alice.send(PacketType::Turn, 1, None).await;
    alice.send(PacketType::Turn, 1, None).await;
    alice.send(PacketType::Fire, 0, None).await;

    // 6 s window: covers the 3 s purgatory plus respawn traffic.
    let alice_frames = alice.collect_for(Duration::from_secs(6)).await;
    let bob_frames = bob.collect_for(Duration::from_secs(6)).await;

    assert_eq!(frames_of(&alice_frames, PacketType::Alert), 0);
    assert_eq!(
        frames_of(&bob_frames, PacketType::Alert),
        1,
        "bob should be hit exactly once"
    );

    for frames in [&alice_frames, &bob_frames] {
        assert!(
            scores_for(frames, b'A').contains(&1),
            "everyone sees the shooter's score reach 1"
        );
        assert!(
            scores_for(frames, b'B').contains(&0),
            "everyone sees the victim reset to 0"
        );
    }

    // The victim's respawn repaints their view after the ALERT.
    let alert_at = bob_frames
        .iter()
        .position(|p| p.header.ty == PacketType::Alert as u8)
        .unwrap();
    assert!(
        frames_of(&bob_frames[alert_at..], PacketType::Show) > 0,
        "respawn should produce SHOW frames"
    );

    drop(alice);
    drop(bob);
    stop_server(handle, join).await;
}

#[tokio::test]
async fn chat_reaches_every_player_including_sender() {
    let (addr, handle, join) = start_server(&DEFAULT_TEMPLATE).await;

    let mut alice = TestClient::connect(addr).await;
    alice.login(b'A', "alice").await;
    alice.recv_type(PacketType::Ready).await;

    let mut bob = TestClient::connect(addr).await;
    bob.login(b'B', "bob").await;
    bob.recv_type(PacketType::Ready).await;

    let mut carol = TestClient::connect(addr).await;
    carol.login(b'C', "carol").await;
    carol.recv_type(PacketType::Ready).await;

    alice.send(PacketType::Send, 0, Some(&b"hi"[..])).await;

    for client in [&mut alice, &mut bob, &mut carol] {
        let chat = client.recv_type(PacketType::Chat).await;
        let text = String::from_utf8_lossy(chat.payload_bytes()).into_owned();
        assert!(
            text.starts_with("alice[A] hi"),
            "unexpected chat line {:?}",
            text
        );
    }

    drop(alice);
    drop(bob);
    drop(carol);
    stop_server(handle, join).await;
}

#[tokio::test]
async fn graceful_shutdown_drains_every_client() {
    let (addr, handle, join) = start_server(&DEFAULT_TEMPLATE).await;

    let mut clients = Vec::new();
    for i in 0..10u8 {
        let mut client = TestClient::connect(addr).await;
        client.login(b'A' + i, &format!("player{}", i)).await;
        client.recv_type(PacketType::Ready).await;
        clients.push(client);
    }

    // The server must close the listener, unblock all ten service tasks,
    // and drain the registry without any client hanging up first.
    stop_server(handle, join).await;

    // Every client's stream ends shortly after.
    for client in &mut clients {
        let result = timeout(Duration::from_secs(5), async {
            loop {
                if client.reader.read_packet().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "client should reach EOF after shutdown");
    }

    // And new connections are refused: the listening socket is gone.
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "listener should be closed"
    );

    drop(clients);
}
