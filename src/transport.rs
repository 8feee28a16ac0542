use crate::config::ClientConfig;
use crate::error::{ConnectError, DecodeError, RecvError};
use crate::protocol::{self, Message, Request, MAX_MESSAGE_SIZE};
use crate::types::{ServerInfo, SessionInfo};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

/// Byte source driven by the frame receiver.
///
/// Implemented by [`Session`] over UDP, and by scripted fakes in tests.
pub trait Transport: Send {
    /// Wait up to `timeout` for the next datagram from either channel.
    fn receive(&mut self, timeout: Duration) -> Result<&[u8], RecvError>;

    /// Send a request on the command channel.
    fn send_command(&mut self, request: &Request) -> io::Result<()>;

    /// Tell the server goodbye and release the sockets. Idempotent.
    fn close(&mut self);
}

/// A live connection: command channel plus data channel.
pub struct Session {
    info: SessionInfo,
    command: UdpSocket,
    data: UdpSocket,
    /// Multicast group joined on the data socket, with the interface used.
    joined: Option<(Ipv4Addr, Ipv4Addr)>,
    read_timeout: Option<Duration>,
    buf: Vec<u8>,
    closed: bool,
}

/// Open a session.
///
/// With no `server`, a connect probe goes to `config.discovery_address` and
/// the first server-info reply names the server. With no `local`, sockets
/// bind to all interfaces. Empty strings count as absent.
pub fn open(
    config: &ClientConfig,
    server: Option<&str>,
    local: Option<&str>,
) -> Result<Session, ConnectError> {
    let local_ip = match non_empty(local) {
        Some(s) => s
            .parse::<IpAddr>()
            .map_err(|_| ConnectError::InvalidAddress(s.to_string()))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let server = non_empty(server)
        .map(|s| resolve_server(s, config.command_port))
        .transpose()?;

    let command = UdpSocket::bind((local_ip, config.local_command_port))
        .map_err(ConnectError::from_bind)?;
    let unicast_data = UdpSocket::bind((local_ip, config.local_data_port))
        .map_err(ConnectError::from_bind)?;
    let data_port = unicast_data.local_addr()?.port();

    let request = protocol::encode_request(&Request::Connect {
        name: config.client_name.clone(),
        version: protocol::CLIENT_VERSION,
        data_port,
    });

    let (server_addr, server_info) = match server {
        Some(addr) => {
            log::info!("Connecting to NatNet server at {}", addr);
            handshake(&command, addr, true, &request, config.handshake_timeout, config.handshake_resend)?
                .ok_or(ConnectError::HandshakeTimeout(
                    config.handshake_timeout.as_millis() as u64,
                ))?
        }
        None => {
            log::info!("Discovering NatNet server via {}", config.discovery_address);
            command.set_broadcast(true)?;
            handshake(
                &command,
                config.discovery_address,
                false,
                &request,
                config.discovery_timeout,
                config.handshake_resend,
            )?
            .ok_or(ConnectError::NoServerFound(
                config.discovery_timeout.as_millis() as u64,
            ))?
        }
    };

    let (data, joined, info) =
        match establish(&command, unicast_data, local_ip, server_addr, server_info) {
            Ok(parts) => parts,
            Err(e) => {
                // The server already counts us as a client.
                log::warn!("Session setup with {} failed: {}", server_addr, e);
                send_disconnect(&command, server_addr);
                return Err(e);
            }
        };

    log::info!(
        "Connected: server={} app='{}' natnet={} negotiated={} data={} multicast={}",
        info.server,
        info.server_info.app_name,
        info.server_info.natnet_version,
        info.version,
        info.data,
        info.server_info.multicast
    );

    Ok(Session {
        info,
        command,
        data,
        joined,
        read_timeout: None,
        buf: vec![0u8; MAX_MESSAGE_SIZE],
        closed: false,
    })
}

impl Session {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Send the disconnect message and release the sockets.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        send_disconnect(&self.command, self.info.server);
        if let Some((group, iface)) = self.joined.take() {
            let _ = self.data.leave_multicast_v4(&group, &iface);
        }
        log::info!("Session with {} closed", self.info.server);
    }
}

impl Transport for Session {
    fn receive(&mut self, timeout: Duration) -> Result<&[u8], RecvError> {
        if self.closed {
            return Err(RecvError::ConnectionLost("session closed".into()));
        }

        // Command channel first: non-blocking, only the server is listened to.
        match self.command.recv_from(&mut self.buf) {
            Ok((n, src)) if src == self.info.server => return Ok(&self.buf[..n]),
            Ok((_, src)) => log::trace!("Ignoring command datagram from {}", src),
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(RecvError::ConnectionLost(e.to_string())),
        }

        // set_read_timeout rejects a zero duration
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout != Some(timeout) {
            self.data
                .set_read_timeout(Some(timeout))
                .map_err(|e| RecvError::ConnectionLost(e.to_string()))?;
            self.read_timeout = Some(timeout);
        }

        match self.data.recv_from(&mut self.buf) {
            Ok((n, _)) => Ok(&self.buf[..n]),
            Err(e) if is_transient(&e) => Err(RecvError::Timeout),
            Err(e) => Err(RecvError::ConnectionLost(e.to_string())),
        }
    }

    fn send_command(&mut self, request: &Request) -> io::Result<()> {
        let bytes = protocol::encode_request(request);
        self.command.send_to(&bytes, self.info.server).map(|_| ())
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Send `request` to `target` every `resend` until a server-info reply
/// arrives or `timeout` elapses (`Ok(None)`).
///
/// With `exact`, replies must come from `target` itself.
fn handshake(
    socket: &UdpSocket,
    target: SocketAddr,
    exact: bool,
    request: &[u8],
    timeout: Duration,
    resend: Duration,
) -> Result<Option<(SocketAddr, ServerInfo)>, ConnectError> {
    let resend = resend.max(Duration::from_millis(1));
    let deadline = Instant::now() + timeout;
    let mut next_send = Instant::now();
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        if now >= next_send {
            match socket.send_to(request, target) {
                Ok(_) => {}
                Err(e) if is_transient(&e) => {}
                Err(e) if !exact && is_unroutable(&e) => {
                    log::debug!("Discovery probe to {} not sent: {}", target, e);
                }
                Err(e) => return Err(ConnectError::Io(e)),
            }
            next_send = now + resend;
        }

        let wait = next_send.min(deadline).saturating_duration_since(Instant::now());
        socket.set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;

        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(ConnectError::Io(e)),
        };
        if exact && src != target {
            log::debug!("Ignoring handshake reply from {} (expected {})", src, target);
            continue;
        }

        match protocol::decode_message(&buf[..n]) {
            Ok(Message::ServerInfo(info)) => {
                log::debug!("Server info from {}: {:?}", src, info);
                return Ok(Some((src, info)));
            }
            Err(DecodeError::UnsupportedVersion { major, minor }) => {
                log::warn!("Server {} speaks unsupported NatNet {}.{}", src, major, minor);
                return Err(ConnectError::UnsupportedVersion { major, minor });
            }
            Ok(other) => log::trace!("Ignoring {:?} during handshake", other),
            Err(e) => log::debug!("Undecodable handshake datagram from {}: {}", src, e),
        }
    }
}

/// Everything after the handshake: version check, data channel, session info.
fn establish(
    command: &UdpSocket,
    unicast_data: UdpSocket,
    local_ip: IpAddr,
    server: SocketAddr,
    server_info: ServerInfo,
) -> Result<(UdpSocket, Option<(Ipv4Addr, Ipv4Addr)>, SessionInfo), ConnectError> {
    let version = protocol::negotiate_version(server_info.natnet_version)
        .map_err(|_| unsupported(&server_info))?;

    let (data, joined) = if server_info.multicast {
        drop(unicast_data);
        let iface = match local_ip {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let group = server_info.multicast_group;
        let socket = bind_multicast(server_info.data_port, group, iface)?;
        (socket, Some((group, iface)))
    } else {
        (unicast_data, None)
    };

    command.set_nonblocking(true)?;

    let info = SessionInfo {
        server,
        local: command.local_addr()?,
        data: data.local_addr()?,
        version,
        server_info,
    };
    Ok((data, joined, info))
}

/// Bind the shared multicast data port and join `group`.
///
/// Other NatNet consumers on the host bind the same port, so address (and on
/// unix, port) reuse is set before binding.
fn bind_multicast(port: u16, group: Ipv4Addr, iface: Ipv4Addr) -> Result<UdpSocket, ConnectError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).map_err(ConnectError::from_bind)?;
    socket.join_multicast_v4(&group, &iface)?;
    log::debug!("Joined {} on port {} via {}", group, port, iface);
    Ok(socket.into())
}

fn send_disconnect(command: &UdpSocket, server: SocketAddr) {
    let bytes = protocol::encode_request(&Request::Disconnect);
    if let Err(e) = command.send_to(&bytes, server) {
        log::debug!("Failed to send disconnect to {}: {}", server, e);
    }
}

fn unsupported(info: &ServerInfo) -> ConnectError {
    ConnectError::UnsupportedVersion {
        major: info.natnet_version.major(),
        minor: info.natnet_version.minor(),
    }
}

/// Errors that only mean "nothing yet".
///
/// ICMP port-unreachable surfaces as a refused/reset error on some platforms
/// and is not a reason to give up on a datagram socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

/// Send errors that mean the probe cannot leave this host, e.g. no route for
/// the broadcast address. During discovery that is the same as no reply.
fn is_unroutable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable
    )
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `ip`, `ip:port` or `host[:port]`, defaulting to `default_port`.
pub(crate) fn resolve_server(addr: &str, default_port: u16) -> Result<SocketAddr, ConnectError> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let resolved = match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port).to_socket_addrs(),
            Err(_) => return Err(ConnectError::InvalidAddress(addr.to_string())),
        },
        None => (addr, default_port).to_socket_addrs(),
    };
    resolved
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| ConnectError::InvalidAddress(addr.to_string()))
}
