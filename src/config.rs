use crate::protocol::DEFAULT_COMMAND_PORT;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Tunables for discovery, handshake and the receiver loop.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name announced to the server in the connect request.
    pub client_name: String,
    /// Server command port used when the server address carries no port.
    pub command_port: u16,
    /// Where the discovery probe is sent when no server address is given.
    pub discovery_address: SocketAddr,
    pub discovery_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Connect requests are re-sent at this interval until a reply arrives.
    pub handshake_resend: Duration,
    /// Upper bound on one blocking receive; also bounds `disconnect`.
    pub receive_timeout: Duration,
    /// Data older than this is flagged stale.
    pub stale_after: Duration,
    /// Consecutive receive timeouts before the session counts as lost.
    /// `None` keeps waiting forever.
    pub lost_after_timeouts: Option<u32>,
    /// Keep-alive period on the command channel (unicast only).
    pub keepalive_interval: Option<Duration>,
    /// Capacity of the frame subscription channel.
    pub subscriber_capacity: usize,
    /// Local command socket port (0 = ephemeral).
    pub local_command_port: u16,
    /// Local unicast data socket port (0 = ephemeral).
    pub local_data_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "natnet-rs".into(),
            command_port: DEFAULT_COMMAND_PORT,
            discovery_address: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                DEFAULT_COMMAND_PORT,
            )),
            discovery_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            handshake_resend: Duration::from_millis(250),
            receive_timeout: Duration::from_millis(100),
            stale_after: Duration::from_millis(500),
            lost_after_timeouts: Some(50),
            keepalive_interval: Some(Duration::from_secs(1)),
            subscriber_capacity: 256,
            local_command_port: 0,
            local_data_port: 0,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `NATNET_*` environment variables.
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            client_name: read_env_string("NATNET_CLIENT_NAME", &d.client_name),
            command_port: read_env_u16("NATNET_COMMAND_PORT", d.command_port),
            discovery_address: read_env_addr("NATNET_DISCOVERY_ADDRESS", d.discovery_address),
            discovery_timeout: read_env_ms("NATNET_DISCOVERY_TIMEOUT_MS", d.discovery_timeout),
            handshake_timeout: read_env_ms("NATNET_HANDSHAKE_TIMEOUT_MS", d.handshake_timeout),
            handshake_resend: read_env_ms("NATNET_HANDSHAKE_RESEND_MS", d.handshake_resend),
            receive_timeout: read_env_ms("NATNET_RECEIVE_TIMEOUT_MS", d.receive_timeout),
            stale_after: read_env_ms("NATNET_STALE_AFTER_MS", d.stale_after),
            lost_after_timeouts: match std::env::var("NATNET_LOST_AFTER_TIMEOUTS") {
                Ok(v) if v.trim() == "0" || v.trim().eq_ignore_ascii_case("never") => None,
                Ok(v) => v.trim().parse().ok().or(d.lost_after_timeouts),
                Err(_) => d.lost_after_timeouts,
            },
            keepalive_interval: if read_env_bool("NATNET_KEEPALIVE", true) {
                d.keepalive_interval
                    .map(|i| read_env_ms("NATNET_KEEPALIVE_INTERVAL_MS", i))
            } else {
                None
            },
            subscriber_capacity: std::env::var("NATNET_SUBSCRIBER_CAPACITY")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|&c: &usize| c > 0)
                .unwrap_or(d.subscriber_capacity),
            local_command_port: read_env_u16("NATNET_LOCAL_COMMAND_PORT", d.local_command_port),
            local_data_port: read_env_u16("NATNET_LOCAL_DATA_PORT", d.local_data_port),
        }
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn read_env_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn read_env_addr(name: &str, default: SocketAddr) -> SocketAddr {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<SocketAddr>().ok())
        .unwrap_or(default)
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
