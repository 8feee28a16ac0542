use crate::error::{DecodeError, EncodeError};
use crate::types::{FrameFlags, NatNetVersion, RigidBody, ServerInfo, Snapshot};
use std::net::Ipv4Addr;

// -- Well-known ports and addresses --
pub const DEFAULT_COMMAND_PORT: u16 = 1510;
pub const DEFAULT_DATA_PORT: u16 = 1511;
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

// -- Message ids --
pub const MSG_CONNECT: u16 = 0;
pub const MSG_SERVER_INFO: u16 = 1;
pub const MSG_FRAME_OF_DATA: u16 = 7;
pub const MSG_DISCONNECT: u16 = 9;
pub const MSG_KEEP_ALIVE: u16 = 10;

// -- Frame sections --
pub const SECTION_MARKER_SETS: u16 = 0;
pub const SECTION_RIGID_BODIES: u16 = 1;
pub const SECTION_SKELETONS: u16 = 2;
pub const SECTION_LABELED_MARKERS: u16 = 3;
pub const SECTION_FORCE_PLATES: u16 = 4;

// -- Geometry --
pub const HEADER_SIZE: usize = 4;
pub const NAME_SIZE: usize = 256;
/// id (i32) + position (3x f64) + orientation (4x f64).
pub const RIGID_BODY_SIZE: usize = 4 + 3 * 8 + 4 * 8;
pub const CONNECT_PAYLOAD_SIZE: usize = NAME_SIZE + 4 + 2;
pub const SERVER_INFO_PAYLOAD_SIZE: usize = NAME_SIZE + 4 + 4 + 8 + 2 + 1 + 4;
/// frame number + timestamp + flags + section count.
const FRAME_PREFIX_SIZE: usize = 4 + 8 + 2 + 2;
const SECTION_HEADER_SIZE: usize = 2 + 4;
/// Largest datagram the protocol can produce.
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + u16::MAX as usize;

/// Version this client speaks.
pub const CLIENT_VERSION: NatNetVersion = NatNetVersion::new(4, 1, 0, 0);
/// Protocol major versions this client can decode.
pub const SUPPORTED_MAJOR_VERSIONS: &[u8] = &[3, 4];

/// Requests sent by the client on the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Handshake and discovery probe. `data_port` is where the client
    /// listens for unicast frames (0 lets the server pick its default).
    Connect {
        name: String,
        version: NatNetVersion,
        data_port: u16,
    },
    KeepAlive,
    Disconnect,
}

/// Any decoded NatNet message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect {
        name: String,
        version: NatNetVersion,
        data_port: u16,
    },
    ServerInfo(ServerInfo),
    FrameOfData(Snapshot),
    KeepAlive,
    Disconnect,
}

/// One section of a data frame, as written on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: u16,
    pub body: Vec<u8>,
}

/// Little-endian cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

/// Prepend the `[id, payload length]` header.
fn frame_message(id: u16, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let len = u16::try_from(payload.len()).map_err(|_| EncodeError::PayloadTooLarge(payload.len()))?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write `name` as a fixed 256-byte NUL-padded field.
fn put_name(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; NAME_SIZE];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    buf.extend_from_slice(&field);
}

/// Extract a null-terminated string from a byte slice.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Encode a client request.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let (id, payload) = match request {
        Request::Connect {
            name,
            version,
            data_port,
        } => {
            let mut payload = Vec::with_capacity(CONNECT_PAYLOAD_SIZE);
            put_name(&mut payload, name);
            payload.extend_from_slice(&version.0);
            payload.extend_from_slice(&data_port.to_le_bytes());
            (MSG_CONNECT, payload)
        }
        Request::KeepAlive => (MSG_KEEP_ALIVE, Vec::new()),
        Request::Disconnect => (MSG_DISCONNECT, Vec::new()),
    };
    // Request payloads are fixed and far below the u16 limit.
    frame_message(id, &payload).unwrap_or_default()
}

/// Encode a server-info reply (server side of the handshake).
pub fn encode_server_info(info: &ServerInfo) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SERVER_INFO_PAYLOAD_SIZE);
    put_name(&mut payload, &info.app_name);
    payload.extend_from_slice(&info.app_version.0);
    payload.extend_from_slice(&info.natnet_version.0);
    payload.extend_from_slice(&info.clock_frequency.to_le_bytes());
    payload.extend_from_slice(&info.data_port.to_le_bytes());
    payload.push(info.multicast as u8);
    payload.extend_from_slice(&info.multicast_group.octets());
    frame_message(MSG_SERVER_INFO, &payload).unwrap_or_default()
}

/// Build the rigid-body section for `bodies`.
pub fn rigid_body_section(bodies: &[RigidBody]) -> Section {
    let mut body = Vec::with_capacity(4 + bodies.len() * RIGID_BODY_SIZE);
    body.extend_from_slice(&(bodies.len() as u32).to_le_bytes());
    for rb in bodies {
        body.extend_from_slice(&rb.id.to_le_bytes());
        for v in rb.position.iter().chain(rb.orientation.iter()) {
            body.extend_from_slice(&v.to_le_bytes());
        }
    }
    Section {
        kind: SECTION_RIGID_BODIES,
        body,
    }
}

/// Encode a data frame from explicit sections.
pub fn encode_frame_sections(
    frame_number: u32,
    timestamp: f64,
    flags: FrameFlags,
    sections: &[Section],
) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&frame_number.to_le_bytes());
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(&flags.bits().to_le_bytes());
    let count = u16::try_from(sections.len()).map_err(|_| EncodeError::PayloadTooLarge(sections.len()))?;
    payload.extend_from_slice(&count.to_le_bytes());
    for section in sections {
        let len = u32::try_from(section.body.len())
            .map_err(|_| EncodeError::PayloadTooLarge(section.body.len()))?;
        payload.extend_from_slice(&section.kind.to_le_bytes());
        payload.extend_from_slice(&len.to_le_bytes());
        payload.extend_from_slice(&section.body);
    }
    frame_message(MSG_FRAME_OF_DATA, &payload)
}

/// Encode a snapshot as a data frame with a single rigid-body section.
pub fn encode_frame(snapshot: &Snapshot) -> Result<Vec<u8>, EncodeError> {
    encode_frame_sections(
        snapshot.frame_number,
        snapshot.timestamp,
        snapshot.flags,
        &[rigid_body_section(&snapshot.bodies)],
    )
}

/// Split a datagram into message id and payload.
///
/// Bytes after the declared payload are ignored.
pub fn decode_header(data: &[u8]) -> Result<(u16, &[u8]), DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::MalformedHeader(format!(
            "{} bytes is shorter than the {}-byte header",
            data.len(),
            HEADER_SIZE
        )));
    }
    let id = u16::from_le_bytes([data[0], data[1]]);
    let len = u16::from_le_bytes([data[2], data[3]]) as usize;
    let available = data.len() - HEADER_SIZE;
    if available < len {
        return Err(DecodeError::Truncated {
            needed: len,
            available,
        });
    }
    Ok((id, &data[HEADER_SIZE..HEADER_SIZE + len]))
}

/// Decode any message.
pub fn decode_message(data: &[u8]) -> Result<Message, DecodeError> {
    let (id, payload) = decode_header(data)?;
    match id {
        MSG_CONNECT => {
            let mut r = Reader::new(payload);
            let name = extract_string(r.take(NAME_SIZE)?);
            let version = NatNetVersion(r.array()?);
            let data_port = r.u16()?;
            Ok(Message::Connect {
                name,
                version,
                data_port,
            })
        }
        MSG_SERVER_INFO => decode_server_info(payload).map(Message::ServerInfo),
        MSG_FRAME_OF_DATA => decode_frame_payload(payload).map(Message::FrameOfData),
        MSG_KEEP_ALIVE => Ok(Message::KeepAlive),
        MSG_DISCONNECT => Ok(Message::Disconnect),
        other => Err(DecodeError::MalformedHeader(format!(
            "unknown message id {}",
            other
        ))),
    }
}

/// Decode a data-frame datagram into a snapshot.
pub fn decode_frame(data: &[u8]) -> Result<Snapshot, DecodeError> {
    let (id, payload) = decode_header(data)?;
    if id != MSG_FRAME_OF_DATA {
        return Err(DecodeError::MalformedHeader(format!(
            "expected frame of data (id {}), got id {}",
            MSG_FRAME_OF_DATA, id
        )));
    }
    decode_frame_payload(payload)
}

/// Decode a server-info payload and check its protocol version.
pub fn decode_server_info(payload: &[u8]) -> Result<ServerInfo, DecodeError> {
    let mut r = Reader::new(payload);
    let app_name = extract_string(r.take(NAME_SIZE)?);
    let app_version = NatNetVersion(r.array()?);
    let natnet_version = NatNetVersion(r.array()?);
    let clock_frequency = r.u64()?;
    let data_port = r.u16()?;
    let multicast = r.u8()? != 0;
    let multicast_group = Ipv4Addr::from(r.array::<4>()?);

    check_version(natnet_version)?;

    Ok(ServerInfo {
        app_name,
        app_version,
        natnet_version,
        clock_frequency,
        data_port,
        multicast,
        multicast_group,
    })
}

/// Reject protocol majors outside [`SUPPORTED_MAJOR_VERSIONS`].
pub fn check_version(version: NatNetVersion) -> Result<(), DecodeError> {
    if SUPPORTED_MAJOR_VERSIONS.contains(&version.major()) {
        Ok(())
    } else {
        Err(DecodeError::UnsupportedVersion {
            major: version.major(),
            minor: version.minor(),
        })
    }
}

/// Version both sides speak: the lower of the two.
pub fn negotiate_version(server: NatNetVersion) -> Result<NatNetVersion, DecodeError> {
    check_version(server)?;
    Ok(server.min(CLIENT_VERSION))
}

/// Walk the frame prefix and its sections.
///
/// Only the rigid-body section is interpreted; every other section is
/// skipped by its length field. Several rigid-body sections are concatenated
/// in order.
fn decode_frame_payload(payload: &[u8]) -> Result<Snapshot, DecodeError> {
    if payload.len() < FRAME_PREFIX_SIZE {
        return Err(DecodeError::Truncated {
            needed: FRAME_PREFIX_SIZE,
            available: payload.len(),
        });
    }
    let mut r = Reader::new(payload);
    let frame_number = r.u32()?;
    let timestamp = r.f64()?;
    let flags = FrameFlags::from_bits_truncate(r.u16()?);
    let section_count = r.u16()?;

    let mut bodies = Vec::new();
    for _ in 0..section_count {
        if r.remaining() < SECTION_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: SECTION_HEADER_SIZE,
                available: r.remaining(),
            });
        }
        let kind = r.u16()?;
        let len = r.u32()? as usize;
        let body = r.take(len)?;
        match kind {
            SECTION_RIGID_BODIES => decode_rigid_bodies(body, &mut bodies)?,
            SECTION_MARKER_SETS | SECTION_SKELETONS | SECTION_LABELED_MARKERS
            | SECTION_FORCE_PLATES => {
                log::trace!("Skipping section {} ({} bytes)", kind, len);
            }
            other => {
                log::trace!("Skipping unknown section {} ({} bytes)", other, len);
            }
        }
    }

    Ok(Snapshot {
        frame_number,
        timestamp,
        flags,
        bodies,
    })
}

fn decode_rigid_bodies(body: &[u8], out: &mut Vec<RigidBody>) -> Result<(), DecodeError> {
    let mut r = Reader::new(body);
    let count = r.u32()? as usize;
    let needed = count
        .checked_mul(RIGID_BODY_SIZE)
        .ok_or_else(|| DecodeError::MalformedHeader(format!("rigid body count {} overflows", count)))?;
    if r.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: r.remaining(),
        });
    }

    out.reserve(count);
    for _ in 0..count {
        let id = r.i32()?;
        let position = [r.f64()?, r.f64()?, r.f64()?];
        let orientation = [r.f64()?, r.f64()?, r.f64()?, r.f64()?];
        out.push(RigidBody {
            id,
            position,
            orientation,
        });
    }
    Ok(())
}
