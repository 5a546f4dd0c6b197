//! Minimal SOCKS5 server (RFC 1928 / RFC 1929) used as the protocol engine
//! behind every rule instance.
//!
//! The lifecycle manager only relies on [`Socks5Server::serve`]: it runs an
//! accept loop over any [`Accept`] source until that source reports
//! [`AcceptError::Closed`]. Sessions are generic over the stream type.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::instrumented::{Accept, AcceptError};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long a BIND waits for the remote side to connect
const BIND_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_UDP_PACKET: usize = 65_535;

/// Error type for SOCKS5 sessions
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0}")]
    InvalidVersion(u8),

    #[error("no acceptable authentication method offered")]
    NoAcceptableAuth,

    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),

    #[error("command {0:#04x} not supported")]
    CommandNotSupported(u8),

    #[error("address type {0:#04x} not supported")]
    AddressTypeNotSupported(u8),

    #[error("malformed UDP datagram: {0}")]
    MalformedDatagram(&'static str),

    #[error("cannot reach {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Reply codes sent back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            _ => Reply::HostUnreachable,
        }
    }
}

/// Which request commands the server accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitCommand {
    pub enable_connect: bool,
    pub enable_bind: bool,
    pub enable_associate: bool,
}

impl PermitCommand {
    fn allows(&self, cmd: u8) -> bool {
        match cmd {
            CMD_CONNECT => self.enable_connect,
            CMD_BIND => self.enable_bind,
            CMD_ASSOCIATE => self.enable_associate,
            _ => false,
        }
    }
}

impl Default for PermitCommand {
    fn default() -> Self {
        Self {
            enable_connect: true,
            enable_bind: true,
            enable_associate: false,
        }
    }
}

/// Username to password map checked during RFC 1929 authentication
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    pub fn single(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut map = HashMap::with_capacity(1);
        map.insert(username.into(), password.into());
        Self(map)
    }

    pub fn valid(&self, username: &str, password: &str) -> bool {
        self.0.get(username).is_some_and(|p| p == password)
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Address used for BIND listeners and UDP relay sockets
    pub bind_ip: IpAddr,
    pub permit: PermitCommand,
    /// `None` means open access
    pub credentials: Option<StaticCredentials>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            permit: PermitCommand::default(),
            credentials: None,
        }
    }
}

/// Request destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
                }),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// SOCKS5 server instance
#[derive(Debug)]
pub struct Socks5Server {
    options: ServerOptions,
}

impl Socks5Server {
    pub fn new(options: ServerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Accept and serve connections until the listener is closed.
    ///
    /// Each session runs on its own task and is left to finish on its own
    /// when the listener goes away.
    pub async fn serve<L: Accept>(self: Arc<Self>, listener: L) {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(conn, peer).await {
                            debug!("SOCKS5 session from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(AcceptError::Closed) => {
                    debug!("Accept loop finished");
                    return;
                }
                Err(AcceptError::Io(e)) => {
                    warn!("Accept error: {} (continuing)", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle<S>(&self, mut stream: S, peer: SocketAddr) -> SocksResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let method = self.negotiate(&mut stream).await?;
        if method == METHOD_USER_PASS {
            self.authenticate(&mut stream).await?;
        }

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(SocksError::InvalidVersion(header[0]));
        }
        let cmd = header[1];
        let target = match read_target(&mut stream, header[3]).await {
            Ok(target) => target,
            Err(e @ SocksError::AddressTypeNotSupported(_)) => {
                send_reply(&mut stream, Reply::AddressTypeNotSupported, None).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if !self.options.permit.allows(cmd) {
            send_reply(&mut stream, Reply::CommandNotSupported, None).await?;
            return Err(SocksError::CommandNotSupported(cmd));
        }

        match cmd {
            CMD_CONNECT => self.connect(stream, peer, target).await,
            CMD_BIND => self.bind(stream, peer, target).await,
            _ => self.associate(stream, peer).await,
        }
    }

    async fn negotiate<S>(&self, stream: &mut S) -> SocksResult<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(SocksError::InvalidVersion(header[0]));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;

        let wanted = if self.options.credentials.is_some() {
            METHOD_USER_PASS
        } else {
            METHOD_NO_AUTH
        };
        let selected = if methods.contains(&wanted) {
            wanted
        } else {
            METHOD_NO_ACCEPTABLE
        };

        stream.write_all(&[SOCKS_VERSION, selected]).await?;
        if selected == METHOD_NO_ACCEPTABLE {
            return Err(SocksError::NoAcceptableAuth);
        }
        Ok(selected)
    }

    async fn authenticate<S>(&self, stream: &mut S) -> SocksResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut version = [0u8; 2];
        stream.read_exact(&mut version).await?;
        if version[0] != AUTH_VERSION {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(SocksError::InvalidVersion(version[0]));
        }
        let mut username = vec![0u8; version[1] as usize];
        stream.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password);
        let ok = self
            .options
            .credentials
            .as_ref()
            .is_some_and(|creds| creds.valid(&username, &password));

        if ok {
            stream.write_all(&[AUTH_VERSION, 0x00]).await?;
            Ok(())
        } else {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            Err(SocksError::AuthFailed(username))
        }
    }

    async fn connect<S>(&self, mut stream: S, peer: SocketAddr, target: TargetAddr) -> SocksResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let outbound = match target.resolve().await {
            Ok(addr) => TcpStream::connect(addr).await,
            Err(e) => Err(e),
        };
        let mut outbound = match outbound {
            Ok(s) => s,
            Err(e) => {
                send_reply(&mut stream, Reply::from_io(&e), None).await?;
                return Err(SocksError::Unreachable {
                    target: target.to_string(),
                    source: e,
                });
            }
        };

        send_reply(&mut stream, Reply::Succeeded, outbound.local_addr().ok()).await?;
        debug!("SOCKS5 tunnel: {} -> {}", peer, target);

        let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await?;
        debug!(
            "Tunnel closed: {} -> {} (sent: {}, received: {})",
            peer, target, sent, received
        );
        Ok(())
    }

    async fn bind<S>(&self, mut stream: S, peer: SocketAddr, target: TargetAddr) -> SocksResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let listener = match TcpListener::bind((self.options.bind_ip, 0)).await {
            Ok(l) => l,
            Err(e) => {
                send_reply(&mut stream, Reply::GeneralFailure, None).await?;
                return Err(e.into());
            }
        };
        send_reply(&mut stream, Reply::Succeeded, listener.local_addr().ok()).await?;
        debug!("SOCKS5 bind for {} (expecting {}) on {:?}", peer, target, listener.local_addr());

        let accepted = tokio::time::timeout(BIND_ACCEPT_TIMEOUT, listener.accept()).await;
        let (mut inbound, remote) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                send_reply(&mut stream, Reply::GeneralFailure, None).await?;
                return Err(e.into());
            }
            Err(_) => {
                send_reply(&mut stream, Reply::TtlExpired, None).await?;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no inbound connection").into());
            }
        };
        drop(listener);

        send_reply(&mut stream, Reply::Succeeded, Some(remote)).await?;
        tokio::io::copy_bidirectional(&mut stream, &mut inbound).await?;
        Ok(())
    }

    async fn associate<S>(&self, mut stream: S, peer: SocketAddr) -> SocksResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let relay = match UdpSocket::bind((self.options.bind_ip, 0)).await {
            Ok(s) => s,
            Err(e) => {
                send_reply(&mut stream, Reply::GeneralFailure, None).await?;
                return Err(e.into());
            }
        };
        let relay_addr = relay.local_addr()?;
        send_reply(&mut stream, Reply::Succeeded, Some(relay_addr)).await?;
        info!("UDP relay for {} on {}", peer, relay_addr);

        let mut client: Option<SocketAddr> = None;
        let mut control = [0u8; 64];
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        // The association lives as long as the control connection
        loop {
            tokio::select! {
                res = stream.read(&mut control) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
                res = relay.recv_from(&mut buf) => {
                    let (n, src) = res?;
                    if client.is_none() || client == Some(src) {
                        client = Some(src);
                        let (target, payload) = match parse_udp_request(&buf[..n]) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!("Dropping datagram from {}: {}", src, e);
                                continue;
                            }
                        };
                        match target.resolve().await {
                            Ok(dst) => {
                                if let Err(e) = relay.send_to(payload, dst).await {
                                    debug!("UDP send to {} failed: {}", dst, e);
                                }
                            }
                            Err(e) => debug!("UDP target {} unresolved: {}", target, e),
                        }
                    } else if let Some(client_addr) = client {
                        let packet = encode_udp_reply(src, &buf[..n]);
                        if let Err(e) = relay.send_to(&packet, client_addr).await {
                            debug!("UDP reply to {} failed: {}", client_addr, e);
                        }
                    }
                }
            }
        }

        debug!("UDP relay for {} closed", peer);
        Ok(())
    }
}

async fn read_target<S>(stream: &mut S, atyp: u8) -> SocksResult<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let target = match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            TargetAddr::Ip(SocketAddr::new(ip.into(), u16::from_be_bytes([raw[4], raw[5]])))
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let ip = Ipv6Addr::from(octets);
            TargetAddr::Ip(SocketAddr::new(ip.into(), u16::from_be_bytes([raw[16], raw[17]])))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut raw = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut raw).await?;
            let port = u16::from_be_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
            raw.truncate(raw.len() - 2);
            TargetAddr::Domain(String::from_utf8_lossy(&raw).into_owned(), port)
        }
        other => return Err(SocksError::AddressTypeNotSupported(other)),
    };
    Ok(target)
}

async fn send_reply<S>(stream: &mut S, reply: Reply, bound: Option<SocketAddr>) -> SocksResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = BytesMut::with_capacity(22);
    response.put_u8(SOCKS_VERSION);
    response.put_u8(reply as u8);
    response.put_u8(0x00);
    put_addr(
        &mut response,
        bound.unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)),
    );
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

fn put_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(a) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&a.ip().octets());
        }
    }
    buf.put_u16(addr.port());
}

/// Split a client datagram into destination and payload.
///
/// Layout: RSV(2) FRAG(1) ATYP(1) DST.ADDR DST.PORT(2) DATA. Fragments are
/// not supported.
pub fn parse_udp_request(packet: &[u8]) -> SocksResult<(TargetAddr, &[u8])> {
    if packet.len() < 4 {
        return Err(SocksError::MalformedDatagram("short header"));
    }
    if packet[2] != 0 {
        return Err(SocksError::MalformedDatagram("fragmented datagram"));
    }
    let rest = &packet[4..];
    let (target, used) = match packet[3] {
        ATYP_IPV4 if rest.len() >= 6 => {
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            (TargetAddr::Ip(SocketAddr::new(ip.into(), port)), 6)
        }
        ATYP_IPV6 if rest.len() >= 18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            (TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port)), 18)
        }
        ATYP_DOMAIN if !rest.is_empty() && rest.len() >= 1 + rest[0] as usize + 2 => {
            let len = rest[0] as usize;
            let host = String::from_utf8_lossy(&rest[1..1 + len]).into_owned();
            let port = u16::from_be_bytes([rest[1 + len], rest[2 + len]]);
            (TargetAddr::Domain(host, port), 1 + len + 2)
        }
        ATYP_IPV4 | ATYP_IPV6 | ATYP_DOMAIN => {
            return Err(SocksError::MalformedDatagram("truncated address"))
        }
        other => return Err(SocksError::AddressTypeNotSupported(other)),
    };
    Ok((target, &rest[used..]))
}

/// Wrap a datagram received from `src` for delivery to the client
pub fn encode_udp_reply(src: SocketAddr, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(22 + payload.len());
    packet.put_slice(&[0, 0, 0]);
    put_addr(&mut packet, src);
    packet.put_slice(payload);
    packet.freeze()
}
