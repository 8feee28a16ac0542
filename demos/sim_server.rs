//! Minimal simulated NatNet server for trying the client without hardware.
//!
//! Usage: cargo run --example sim_server -- [bind_addr]
//! Default bind address is 0.0.0.0:1510. Streams two rigid bodies at 120 Hz
//! to the most recent client.

use natnet::protocol::{self, Message};
use natnet::{FrameFlags, NatNetVersion, RigidBody, ServerInfo, Snapshot};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

const FRAME_PERIOD: Duration = Duration::from_micros(8333);

fn main() {
    env_logger::init();

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("0.0.0.0:{}", protocol::DEFAULT_COMMAND_PORT));
    let socket = UdpSocket::bind(&bind).unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", bind, e);
        std::process::exit(1);
    });
    socket
        .set_read_timeout(Some(Duration::from_millis(1)))
        .expect("set_read_timeout");

    let reply = protocol::encode_server_info(&ServerInfo {
        app_name: "natnet sim_server".into(),
        app_version: NatNetVersion::new(1, 0, 0, 0),
        natnet_version: protocol::CLIENT_VERSION,
        clock_frequency: 1_000_000,
        data_port: protocol::DEFAULT_DATA_PORT,
        multicast: false,
        multicast_group: Ipv4Addr::UNSPECIFIED,
    });

    eprintln!("sim_server listening on {}", bind);

    let start = Instant::now();
    let mut client: Option<SocketAddr> = None;
    let mut frame_number: u32 = 0;
    let mut next_frame = Instant::now();
    let mut buf = vec![0u8; protocol::MAX_MESSAGE_SIZE];

    loop {
        if let Ok((n, src)) = socket.recv_from(&mut buf) {
            match protocol::decode_message(&buf[..n]) {
                Ok(Message::Connect {
                    name, data_port, ..
                }) => {
                    eprintln!("client '{}' at {} (data port {})", name, src, data_port);
                    let _ = socket.send_to(&reply, src);
                    client = Some(SocketAddr::new(src.ip(), data_port));
                }
                Ok(Message::Disconnect) => {
                    eprintln!("client at {} disconnected", src);
                    client = None;
                }
                Ok(_) => {}
                Err(e) => log::debug!("bad datagram from {}: {}", src, e),
            }
        }

        if Instant::now() < next_frame {
            continue;
        }
        next_frame += FRAME_PERIOD;

        let Some(target) = client else {
            continue;
        };
        frame_number += 1;
        let t = start.elapsed().as_secs_f64();
        let half = t * 0.5;
        let snapshot = Snapshot {
            frame_number,
            timestamp: t,
            flags: FrameFlags::LIVE,
            bodies: vec![
                RigidBody {
                    id: 1,
                    position: [t.cos(), 1.0, t.sin()],
                    orientation: [0.0, half.sin(), 0.0, half.cos()],
                },
                RigidBody {
                    id: 42,
                    position: [0.0, 0.5 + 0.1 * t.sin(), 0.0],
                    orientation: [0.0, 0.0, 0.0, 1.0],
                },
            ],
        };
        match protocol::encode_frame(&snapshot) {
            Ok(bytes) => {
                let _ = socket.send_to(&bytes, target);
            }
            Err(e) => eprintln!("encode failed: {}", e),
        }
    }
}
