use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SocksError;
use crate::proxy::connector;
use crate::proxy::pool::ProxyPool;

// SOCKS protocol constants
const SOCKS_VERSION_5: u8 = 0x05;
const SOCKS_VERSION_4: u8 = 0x04;

const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const SOCKS5_REPLY_SUCCESS: u8 = 0x00;
const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const SOCKS5_REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

const PIPE_BUF_SIZE: usize = 8192;

/// Client-facing SOCKS server. Accepts SOCKS4/4a/5/5h clients and tunnels
/// each CONNECT through an upstream picked from the pool.
pub struct SocksServer {
    pool: Arc<ProxyPool>,
}

impl SocksServer {
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        Self { pool }
    }

    /// Accept clients until the shutdown signal fires. Every connection gets
    /// its own task, so a slow client never blocks accept.
    pub async fn run(&self, listener: TcpListener, mut shutdown: watch::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let pool = self.pool.clone();
                        tokio::spawn(handle_client(stream, peer, pool));
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                },
                _ = shutdown.changed() => {
                    info!("SOCKS server stopping");
                    break;
                }
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, peer: SocketAddr, pool: Arc<ProxyPool>) {
    debug!("new connection from {peer}");

    let version = match stream.read_u8().await {
        Ok(version) => version,
        Err(e) => {
            debug!("client {peer} disconnected during handshake: {e}");
            return;
        }
    };

    let result = match version {
        SOCKS_VERSION_5 => handle_socks5(stream, peer, pool).await,
        SOCKS_VERSION_4 => handle_socks4(stream, peer, pool).await,
        other => {
            warn!("unsupported SOCKS version {other:#04x} from {peer}");
            return;
        }
    };

    if let Err(e) = result {
        debug!("connection from {peer} ended: {e}");
    }
    debug!("connection from {peer} closed");
}

async fn handle_socks5(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<ProxyPool>,
) -> io::Result<()> {
    // Method negotiation; only no-auth is on offer.
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS5_AUTH_NONE) {
        warn!("client {peer} offered no supported auth method");
        stream
            .write_all(&[SOCKS_VERSION_5, SOCKS5_AUTH_NO_ACCEPTABLE])
            .await?;
        return Ok(());
    }
    stream
        .write_all(&[SOCKS_VERSION_5, SOCKS5_AUTH_NONE])
        .await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let cmd = head[1];
    let atyp = head[3];

    if cmd != CMD_CONNECT {
        warn!("unsupported SOCKS5 command {cmd:#04x} from {peer}");
        write_socks5_reply(&mut stream, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }

    let dest_host = match read_socks5_address(&mut stream, atyp).await? {
        Some(host) => host,
        None => {
            warn!("unsupported SOCKS5 address type {atyp:#04x} from {peer}");
            write_socks5_reply(&mut stream, SOCKS5_REPLY_ATYP_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };
    let dest_port = stream.read_u16().await?;

    info!("SOCKS5 connect request from {peer} to {dest_host}:{dest_port}");

    match dispatch(&pool, &dest_host, dest_port).await {
        Ok(upstream) => {
            write_socks5_reply(&mut stream, SOCKS5_REPLY_SUCCESS).await?;
            pipe(stream, upstream).await;
            Ok(())
        }
        Err(e) => {
            warn!("failed to reach {dest_host}:{dest_port} for {peer}: {e}");
            write_socks5_reply(&mut stream, SOCKS5_REPLY_GENERAL_FAILURE).await
        }
    }
}

async fn handle_socks4(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<ProxyPool>,
) -> io::Result<()> {
    // cmd, port, ip follow the version byte already consumed.
    let mut head = [0u8; 7];
    stream.read_exact(&mut head).await?;
    let cmd = head[0];
    let dest_port = u16::from_be_bytes([head[1], head[2]]);
    let ip = [head[3], head[4], head[5], head[6]];

    // The userid is not used for anything.
    read_null_terminated(&mut stream).await?;

    let dest_host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        // SOCKS4A sentinel address; the real hostname follows.
        let name = read_null_terminated(&mut stream).await?;
        String::from_utf8_lossy(&name).into_owned()
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    if cmd != CMD_CONNECT {
        warn!("unsupported SOCKS4 command {cmd:#04x} from {peer}");
        write_socks4_reply(&mut stream, SOCKS4_REJECTED, dest_port).await?;
        return Ok(());
    }

    info!("SOCKS4 connect request from {peer} to {dest_host}:{dest_port}");

    match dispatch(&pool, &dest_host, dest_port).await {
        Ok(upstream) => {
            write_socks4_reply(&mut stream, SOCKS4_GRANTED, dest_port).await?;
            pipe(stream, upstream).await;
            Ok(())
        }
        Err(e) => {
            warn!("failed to reach {dest_host}:{dest_port} for {peer}: {e}");
            write_socks4_reply(&mut stream, SOCKS4_REJECTED, dest_port).await
        }
    }
}

/// Pick an upstream and tunnel through it. No retry through another proxy:
/// the client re-initiates on failure.
async fn dispatch(
    pool: &ProxyPool,
    dest_host: &str,
    dest_port: u16,
) -> Result<TcpStream, SocksError> {
    let proxy = pool.select(dest_host, dest_port).await?;
    debug!(proxy = %proxy, "tunneling {dest_host}:{dest_port}");
    connector::connect(&proxy, dest_host, dest_port).await
}

async fn read_socks5_address<R>(reader: &mut R, atyp: u8) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Ok(Some(Ipv4Addr::from(octets).to_string()))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            reader.read_exact(&mut name).await?;
            Ok(Some(String::from_utf8_lossy(&name).into_owned()))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Ok(Some(Ipv6Addr::from(octets).to_string()))
        }
        _ => Ok(None),
    }
}

async fn read_null_terminated<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == 0 {
            return Ok(bytes);
        }
        bytes.push(byte);
    }
}

/// SOCKS5 replies always carry a fixed 0.0.0.0:0 bind address.
async fn write_socks5_reply<W>(writer: &mut W, code: u8) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&[
            SOCKS_VERSION_5,
            code,
            0x00,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await
}

async fn write_socks4_reply<W>(writer: &mut W, code: u8, dest_port: u16) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let port = dest_port.to_be_bytes();
    writer
        .write_all(&[0x00, code, port[0], port[1], 0, 0, 0, 0])
        .await
}

/// Run both directions concurrently; the first to finish ends the session
/// and cancels its sibling.
async fn pipe(client: TcpStream, upstream: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut client_to_upstream = tokio::spawn(pipe_half(client_read, upstream_write));
    let mut upstream_to_client = tokio::spawn(pipe_half(upstream_read, client_write));

    tokio::select! {
        _ = &mut client_to_upstream => upstream_to_client.abort(),
        _ = &mut upstream_to_client => client_to_upstream.abort(),
    }
}

async fn pipe_half<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = write_chunk(&mut writer, &buf[..n]).await {
                    if !is_disconnect(&e) {
                        error!("pipe error: {e}");
                    }
                    break;
                }
            }
            Err(e) => {
                if !is_disconnect(&e) {
                    error!("pipe error: {e}");
                }
                break;
            }
        }
    }
    // Half-close toward the peer, which may already be gone.
    let _ = writer.shutdown().await;
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
