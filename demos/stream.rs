//! Print rigid-body poses streamed from a NatNet server.
//!
//! Usage: cargo run --example stream -- [server_ip] [local_ip]
//! With no server address the server is discovered by broadcast.
//! Runs until the connection is lost; Ctrl+C to stop.

use natnet::{Client, ConnectionState};
use std::time::Duration;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let server = args.next();
    let local = args.next();

    let mut client = Client::from_env();
    if let Err(e) = client.connect(server.as_deref(), local.as_deref()) {
        eprintln!("natnet connect failed, code {}: {}", e.status_code(), e);
        std::process::exit(1);
    }

    if let Some(info) = client.server_info() {
        println!(
            "connected to {} (NatNet {})",
            info.app_name, info.natnet_version
        );
    }

    while client.state() == ConnectionState::Streaming {
        let bodies = client.get_rigid_bodies();
        if bodies.is_empty() {
            println!("no rigid bodies");
        }
        for b in &bodies {
            println!(
                "RB {:<4} pos [{:+.4}, {:+.4}, {:+.4}]  quat [{:+.3}, {:+.3}, {:+.3}, {:+.3}]{}",
                b.id,
                b.position[0], b.position[1], b.position[2],
                b.orientation[0], b.orientation[1], b.orientation[2], b.orientation[3],
                if client.is_stale() { "  (stale)" } else { "" },
            );
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let stats = client.stats();
    client.disconnect();
    println!(
        "disconnected: {} frames, {} dropped, {} out of order",
        stats.frames_published, stats.decode_errors, stats.out_of_order
    );
}
