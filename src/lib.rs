//! A host-side client for the wire protocols Apple devices speak over USB.
//!
//! The crate is a stack of protocol adapters. [`usbmuxd`] talks to the local
//! device multiplexer daemon and opens per-device byte tunnels. [`lockdown`]
//! upgrades a tunnel to an authenticated, TLS-protected plist channel.
//! [`rsd`] reads the device's Remote Service Discovery catalog over a minimal
//! HTTP/2 client and resolves named services to ports. [`services`] dials
//! those ports, performs the RSD check-in and exposes request/response,
//! notification-stream and heartbeat interaction patterns. [`tunnel`] caches
//! live tunnels and publishes them to sibling processes over a small HTTP
//! API. [`pairing`] holds the cryptographic primitives used during Apple TV
//! pair-setup and pair-verify.
//!
//! Everything on the wire is a property list; [`plist`] is the codec the
//! whole stack shares.

#![warn(missing_debug_implementations)]

pub mod http2;
pub mod lockdown;
pub mod pair_record;
pub mod pairing;
pub mod plist;
pub mod rsd;
pub mod services;
pub mod tunnel;
pub mod usbmuxd;

pub use pair_record::PairRecord;
pub use plist::{parse_plist, Dictionary, PlistValue};

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A trait combining all required characteristics for a device communication
/// socket.
///
/// Tokio's `TcpStream` and `UnixStream` implement this trait, as does the
/// TLS stream a lockdown session upgrades to.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RemoteXpcError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS error")]
    Tls(#[from] openssl::ssl::Error),
    #[error("TLS context build failed")]
    TlsBuilder(#[from] openssl::error::ErrorStack),
    #[error("plist error: {0}")]
    Plist(#[from] plist::PlistError),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error("cannot parse string as IpAddr")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("expected field `{0}` is missing")]
    MissingField(&'static str),
    #[error("device returned error: {0}")]
    DeviceError(String),
    #[error("Timed out waiting for plist response after {0} ms")]
    Timeout(u128),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no established connection")]
    NoEstablishedConnection,

    #[error("device not found")]
    DeviceNotFound,
    #[error("mux connect refused: {0}")]
    MuxConnectRefused(u64),

    #[error("not found")]
    NotFound,
    #[error("service not found")]
    ServiceNotFound,

    #[error("unknown http frame type {0}")]
    UnknownFrame(u8),
    #[error("unknown http setting {0}")]
    UnknownHttpSetting(u16),
    #[error("http frame of {0} bytes exceeds the advertised maximum of {1}")]
    FrameTooLarge(usize, usize),

    #[error("malformed TLV buffer")]
    MalformedTlv,
    #[error("unsupported OPACK value")]
    UnsupportedOpackValue,
    #[error("{0}")]
    Cryptography(String),
    #[error("{0}")]
    InvalidState(String),

    #[error("device went to sleep")]
    HeartbeatSleepyTime,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize),
}
