use std::path::PathBuf;

use thiserror::Error;

/// Startup-time configuration problems. All of these are reported to stderr
/// and terminate the process with exit code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid proxy format: {0}")]
    InvalidProxy(String),

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid port number in proxy specification: {0}")]
    InvalidPort(String),

    #[error("weight must be a positive integer: {0}")]
    InvalidWeight(String),

    #[error("at least one proxy must be provided")]
    NoProxies,

    #[error("supply proxies inline or via a proxy file, not both")]
    ConflictingProxySources,

    #[error("failed to read proxy file {path}: {source}")]
    ProxyFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failures while establishing a tunnel through an upstream proxy.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("no proxies available")]
    NoProxies,

    #[error("upstream handshake timed out")]
    HandshakeTimeout,

    #[error("upstream requires auth method {0:#04x}, only no-auth is supported")]
    AuthMethodRejected(u8),

    #[error("upstream rejected connect request (code {0:#04x})")]
    RequestRejected(u8),

    #[error("malformed reply from upstream")]
    MalformedReply,

    #[error("no IPv4 address found for {0}")]
    NoIpv4Address(String),

    #[error("could not resolve destination {0}")]
    ResolveFailed(String),

    #[error("destination hostname exceeds 255 bytes: {0}")]
    HostnameTooLong(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
