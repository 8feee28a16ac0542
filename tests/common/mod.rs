//! Simulated NatNet server on the loopback interface.

#![allow(dead_code)]

use natnet::protocol::{self, Message};
use natnet::{ClientConfig, FrameFlags, NatNetVersion, RigidBody, ServerInfo, Snapshot};
use std::f64::consts::FRAC_1_SQRT_2;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short timeouts so failing tests fail fast.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        discovery_timeout: Duration::from_millis(300),
        handshake_timeout: Duration::from_millis(300),
        handshake_resend: Duration::from_millis(50),
        receive_timeout: Duration::from_millis(10),
        stale_after: Duration::from_millis(150),
        lost_after_timeouts: None,
        keepalive_interval: None,
        ..ClientConfig::default()
    }
}

pub fn server_info(version: NatNetVersion) -> ServerInfo {
    ServerInfo {
        app_name: "FakeMotive".into(),
        app_version: NatNetVersion::new(3, 1, 0, 0),
        natnet_version: version,
        clock_frequency: 10_000_000,
        data_port: protocol::DEFAULT_DATA_PORT,
        multicast: false,
        multicast_group: Ipv4Addr::UNSPECIFIED,
    }
}

/// Server info announcing multicast streaming on `data_port`.
pub fn multicast_info(version: NatNetVersion, data_port: u16) -> ServerInfo {
    ServerInfo {
        data_port,
        multicast: true,
        multicast_group: protocol::DEFAULT_MULTICAST_GROUP,
        ..server_info(version)
    }
}

/// A loopback UDP port that was free a moment ago.
pub fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn body(id: i32) -> RigidBody {
    RigidBody {
        id,
        position: [id as f64, -0.5, 1.25],
        orientation: [0.0, FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2],
    }
}

pub fn snapshot(frame_number: u32, ids: &[i32]) -> Snapshot {
    Snapshot {
        frame_number,
        timestamp: frame_number as f64 / 120.0,
        flags: FrameFlags::LIVE,
        bodies: ids.iter().copied().map(body).collect(),
    }
}

/// Poll `cond` for up to two seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[derive(Default)]
struct Peer {
    command: Option<SocketAddr>,
    data: Option<SocketAddr>,
}

/// Answers connect requests with a server-info reply and streams frames on demand.
pub struct FakeServer {
    socket: Arc<UdpSocket>,
    peer: Arc<Mutex<Peer>>,
    received: Arc<Mutex<Vec<Message>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeServer {
    pub fn start(version: NatNetVersion) -> Self {
        Self::start_with(server_info(version))
    }

    /// Frames go to the announced data port when `info` is multicast, so a
    /// single client on loopback still receives them.
    pub fn start_with(info: ServerInfo) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let peer = Arc::new(Mutex::new(Peer::default()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let socket = socket.clone();
            let peer = peer.clone();
            let received = received.clone();
            let stop = stop.clone();
            let reply = protocol::encode_server_info(&info);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; protocol::MAX_MESSAGE_SIZE];
                while !stop.load(Ordering::Relaxed) {
                    let (n, src) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let Ok(msg) = protocol::decode_message(&buf[..n]) else {
                        continue;
                    };
                    if let Message::Connect { data_port, .. } = &msg {
                        let mut peer = peer.lock().unwrap();
                        peer.command = Some(src);
                        let port = if info.multicast { info.data_port } else { *data_port };
                        peer.data = Some(SocketAddr::new(src.ip(), port));
                        let _ = socket.send_to(&reply, src);
                    }
                    received.lock().unwrap().push(msg);
                }
            })
        };

        Self {
            socket,
            peer,
            received,
            stop,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Send raw bytes to the client's data port.
    pub fn send_raw(&self, bytes: &[u8]) {
        let data = self.peer.lock().unwrap().data.expect("no client connected");
        self.socket.send_to(bytes, data).unwrap();
    }

    pub fn send_frame(&self, snapshot: &Snapshot) {
        self.send_raw(&protocol::encode_frame(snapshot).unwrap());
    }

    /// Send a disconnect message on the command channel.
    pub fn send_disconnect(&self) {
        let command = self.peer.lock().unwrap().command.expect("no client connected");
        let bytes = protocol::encode_request(&protocol::Request::Disconnect);
        self.socket.send_to(&bytes, command).unwrap();
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn has_received(&self, pred: impl Fn(&Message) -> bool) -> bool {
        self.received.lock().unwrap().iter().any(pred)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
