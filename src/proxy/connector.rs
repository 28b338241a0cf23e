use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::SocksError;
use crate::proxy::descriptor::{ProxyDescriptor, SocksProtocol};

/// Hard upper bound on the whole upstream handshake: TCP connect plus the
/// SOCKS exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5A;

/// Destination address as it will go on the wire.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

/// Open a TCP tunnel to `dest_host:dest_port` through the given upstream.
///
/// Success records the handshake duration into the descriptor's health
/// stats; any failure (including the 10 s deadline) counts against it.
pub async fn connect(
    proxy: &ProxyDescriptor,
    dest_host: &str,
    dest_port: u16,
) -> Result<TcpStream, SocksError> {
    let started = Instant::now();
    match timeout(HANDSHAKE_TIMEOUT, open_tunnel(proxy, dest_host, dest_port)).await {
        Ok(Ok(stream)) => {
            let elapsed = started.elapsed().as_secs_f64();
            debug!(proxy = %proxy, "connected to {dest_host}:{dest_port} in {elapsed:.3}s");
            proxy.mark_successful();
            proxy.update_latency(elapsed);
            Ok(stream)
        }
        Ok(Err(e)) => {
            proxy.mark_failed();
            Err(e)
        }
        Err(_) => {
            proxy.mark_failed();
            Err(SocksError::HandshakeTimeout)
        }
    }
}

/// Complete the SOCKS exchange without touching health stats or applying a
/// deadline. The prober drives this directly so it can own both.
pub async fn open_tunnel(
    proxy: &ProxyDescriptor,
    dest_host: &str,
    dest_port: u16,
) -> Result<TcpStream, SocksError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
    match proxy.protocol.version() {
        4 => handshake_v4(proxy, &mut stream, dest_host, dest_port).await?,
        _ => handshake_v5(proxy, &mut stream, dest_host, dest_port).await?,
    }
    Ok(stream)
}

async fn handshake_v5(
    proxy: &ProxyDescriptor,
    stream: &mut TcpStream,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), SocksError> {
    // Method selection: we only ever offer no-auth.
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_NONE])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(SocksError::MalformedReply);
    }
    if choice[1] != AUTH_NONE {
        return Err(SocksError::AuthMethodRejected(choice[1]));
    }

    let target = resolve_v5_target(proxy.protocol, dest_host, dest_port).await?;
    let request = encode_socks5_request(&target, dest_port)?;
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(SocksError::MalformedReply);
    }
    if head[1] != 0x00 {
        return Err(SocksError::RequestRejected(head[1]));
    }

    // Drain the bound address so the tunnel starts at the payload.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        _ => return Err(SocksError::MalformedReply),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn handshake_v4(
    proxy: &ProxyDescriptor,
    stream: &mut TcpStream,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), SocksError> {
    let userid = proxy.username.as_deref().unwrap_or("");
    let request = match proxy.protocol {
        SocksProtocol::Socks4a => encode_socks4a_request(dest_host, dest_port, userid)?,
        _ => {
            let ip = resolve_ipv4(dest_host, dest_port).await?;
            encode_socks4_request(ip, dest_port, userid)
        }
    };
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(SocksError::MalformedReply);
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(SocksError::RequestRejected(reply[1]));
    }
    Ok(())
}

/// Pick the wire form of the destination. `socks5h` delegates resolution to
/// the upstream, so hostnames travel as DOMAIN; plain `socks5` resolves
/// locally. IP literals always go as themselves.
async fn resolve_v5_target(
    protocol: SocksProtocol,
    dest_host: &str,
    dest_port: u16,
) -> Result<Target, SocksError> {
    if let Ok(ip) = dest_host.parse::<IpAddr>() {
        return Ok(match ip {
            IpAddr::V4(v4) => Target::V4(v4),
            IpAddr::V6(v6) => Target::V6(v6),
        });
    }
    if protocol.remote_dns() {
        return Ok(Target::Domain(dest_host.to_string()));
    }
    let addr = lookup_host((dest_host, dest_port))
        .await
        .map_err(|_| SocksError::ResolveFailed(dest_host.to_string()))?
        .next()
        .ok_or_else(|| SocksError::ResolveFailed(dest_host.to_string()))?;
    Ok(match addr.ip() {
        IpAddr::V4(v4) => Target::V4(v4),
        IpAddr::V6(v6) => Target::V6(v6),
    })
}

async fn resolve_ipv4(dest_host: &str, dest_port: u16) -> Result<Ipv4Addr, SocksError> {
    if let Ok(v4) = dest_host.parse::<Ipv4Addr>() {
        return Ok(v4);
    }
    let mut addrs = lookup_host((dest_host, dest_port))
        .await
        .map_err(|_| SocksError::ResolveFailed(dest_host.to_string()))?;
    addrs
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| SocksError::NoIpv4Address(dest_host.to_string()))
}

fn encode_socks5_request(target: &Target, dest_port: u16) -> Result<Bytes, SocksError> {
    let mut buf = BytesMut::with_capacity(262);
    buf.put_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    match target {
        Target::V4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Target::V6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Target::Domain(host) => {
            if host.len() > 255 {
                return Err(SocksError::HostnameTooLong(host.len()));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_u16(dest_port);
    Ok(buf.freeze())
}

fn encode_socks4_request(ip: Ipv4Addr, dest_port: u16, userid: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + userid.len());
    buf.put_slice(&[SOCKS4_VERSION, CMD_CONNECT]);
    buf.put_u16(dest_port);
    buf.put_slice(&ip.octets());
    buf.put_slice(userid.as_bytes());
    buf.put_u8(0x00);
    buf.freeze()
}

/// SOCKS4A: the IP field carries the 0.0.0.x sentinel and the hostname
/// follows the userid, both NUL-terminated.
fn encode_socks4a_request(
    dest_host: &str,
    dest_port: u16,
    userid: &str,
) -> Result<Bytes, SocksError> {
    if dest_host.len() > 255 {
        return Err(SocksError::HostnameTooLong(dest_host.len()));
    }
    let mut buf = BytesMut::with_capacity(10 + userid.len() + dest_host.len());
    buf.put_slice(&[SOCKS4_VERSION, CMD_CONNECT]);
    buf.put_u16(dest_port);
    buf.put_slice(&[0, 0, 0, 1]);
    buf.put_slice(userid.as_bytes());
    buf.put_u8(0x00);
    buf.put_slice(dest_host.as_bytes());
    buf.put_u8(0x00);
    Ok(buf.freeze())
}
