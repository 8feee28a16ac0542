use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// 6DOF pose of one tracked rigid body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidBody {
    /// Server-assigned id. Not necessarily contiguous or zero-based.
    pub id: i32,
    /// Position in meters [x, y, z], server coordinate frame.
    pub position: [f64; 3],
    /// Unit quaternion [qx, qy, qz, qw].
    pub orientation: [f64; 4],
}

impl RigidBody {
    /// Check that the orientation is a unit quaternion within `tolerance`.
    pub fn is_normalized(&self, tolerance: f64) -> bool {
        let [x, y, z, w] = self.orientation;
        ((x * x + y * y + z * z + w * w).sqrt() - 1.0).abs() <= tolerance
    }
}

bitflags::bitflags! {
    /// Per-frame flag word reported by the server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        const RECORDING      = 1 << 0;
        const MODELS_CHANGED = 1 << 1;
        const LIVE           = 1 << 2;
    }
}

/// All rigid bodies decoded from one server frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Monotonically increasing frame number.
    pub frame_number: u32,
    /// Server timestamp in seconds.
    pub timestamp: f64,
    pub flags: FrameFlags,
    /// Bodies in encoding order.
    pub bodies: Vec<RigidBody>,
}

impl Snapshot {
    /// Find a body by its server id.
    pub fn body(&self, id: i32) -> Option<&RigidBody> {
        self.bodies.iter().find(|b| b.id == id)
    }
}

/// NatNet protocol version [major, minor, build, revision].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NatNetVersion(pub [u8; 4]);

impl NatNetVersion {
    pub const fn new(major: u8, minor: u8, build: u8, revision: u8) -> Self {
        Self([major, minor, build, revision])
    }

    pub fn major(&self) -> u8 {
        self.0[0]
    }

    pub fn minor(&self) -> u8 {
        self.0[1]
    }
}

impl fmt::Display for NatNetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Server description returned by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub app_name: String,
    pub app_version: NatNetVersion,
    pub natnet_version: NatNetVersion,
    /// High-resolution clock frequency in ticks per second.
    pub clock_frequency: u64,
    /// Port the server streams frames from (multicast) or to (unicast default).
    pub data_port: u16,
    pub multicast: bool,
    pub multicast_group: Ipv4Addr,
}

/// Connection parameters of an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub server: SocketAddr,
    pub local: SocketAddr,
    pub data: SocketAddr,
    pub version: NatNetVersion,
    pub server_info: ServerInfo,
}

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
}

impl ConnectionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Streaming,
            _ => ConnectionState::Disconnected,
        }
    }
}
