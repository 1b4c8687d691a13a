//! Client for the local device multiplexer daemon.
//!
//! The muxer owns every USB (and Wi-Fi paired) device attached to the host
//! and exposes them over a local socket: a Unix socket on macOS and Linux, a
//! TCP loopback port on Windows. This module enumerates devices, fetches
//! pair records and dials TCP ports on a device, after which the same socket
//! becomes a raw byte pipe.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::pair_record::PairRecord;
use crate::plist::{parse_plist, Dictionary, PlistValue};
use crate::{ReadWrite, RemoteXpcError};

mod raw_packet;

use raw_packet::RawPacket;

/// How a device is attached to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Network,
    Unknown(String),
}

impl ConnectionType {
    fn from_str(s: &str) -> Self {
        match s {
            "USB" => ConnectionType::Usb,
            "Network" => ConnectionType::Network,
            other => ConnectionType::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Usb => write!(f, "USB"),
            ConnectionType::Network => write!(f, "Network"),
            ConnectionType::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// A device as reported by the muxer.
///
/// `device_id` is only unique within one muxer session and is reused across
/// reboots; the UDID (serial number) is the globally stable key.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: u32,
    pub udid: String,
    pub connection_type: ConnectionType,
    pub product_id: Option<u64>,
    pub connection_speed: Option<u64>,
    pub location_id: Option<u64>,
}

/// Where to find the muxer socket.
#[derive(Debug, Clone)]
pub enum UsbmuxdAddr {
    UnixSocket(std::path::PathBuf),
    Tcp(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// The platform's conventional muxer endpoint.
    pub fn default() -> Self {
        if cfg!(target_os = "windows") {
            Self::Tcp(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                Self::DEFAULT_PORT,
            )))
        } else {
            Self::UnixSocket(Self::SOCKET_FILE.into())
        }
    }

    pub async fn connect(&self) -> Result<UsbmuxdConnection, RemoteXpcError> {
        let socket: Box<dyn ReadWrite> = match self {
            UsbmuxdAddr::Tcp(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
            #[cfg(unix)]
            UsbmuxdAddr::UnixSocket(path) => {
                Box::new(tokio::net::UnixStream::connect(path).await?)
            }
            #[cfg(not(unix))]
            UsbmuxdAddr::UnixSocket(_) => {
                return Err(RemoteXpcError::Socket(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
        };
        Ok(UsbmuxdConnection::new(socket))
    }
}

/// One connection to the muxer daemon.
///
/// Tags increase monotonically per connection; responses echo the tag of the
/// request they answer.
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: Option<Box<dyn ReadWrite>>,
    tag: u32,
}

impl UsbmuxdConnection {
    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(socket: Box<dyn ReadWrite>) -> Self {
        Self {
            socket: Some(socket),
            tag: 0,
        }
    }

    /// Enumerates attached devices.
    ///
    /// A muxer that does not answer within `timeout` surfaces as a timeout
    /// error carrying the requested duration.
    pub async fn list_devices(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<Device>, RemoteXpcError> {
        let res = tokio::time::timeout(timeout, self.request_devices())
            .await
            .map_err(|_| RemoteXpcError::Timeout(timeout.as_millis()))??;
        Ok(res)
    }

    async fn request_devices(&mut self) -> Result<Vec<Device>, RemoteXpcError> {
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), "remotexpc".into());
        req.insert("kLibUSBMuxVersion".into(), 3i64.into());
        self.write_plist(PlistValue::Dictionary(req)).await?;
        let res = self.read_plist().await?;

        let list = res
            .get("DeviceList")
            .and_then(|v| v.as_array())
            .ok_or(RemoteXpcError::MissingField("DeviceList"))?;

        let mut devices = Vec::with_capacity(list.len());
        for entry in list {
            let entry = entry
                .as_dictionary()
                .ok_or(RemoteXpcError::UnexpectedResponse)?;
            let device_id = entry
                .get("DeviceID")
                .and_then(|v| v.as_unsigned())
                .ok_or(RemoteXpcError::MissingField("DeviceID"))? as u32;
            let props = entry
                .get("Properties")
                .and_then(|v| v.as_dictionary())
                .ok_or(RemoteXpcError::MissingField("Properties"))?;
            let udid = props
                .get("SerialNumber")
                .and_then(|v| v.as_string())
                .ok_or(RemoteXpcError::MissingField("SerialNumber"))?
                .to_string();
            let connection_type = props
                .get("ConnectionType")
                .and_then(|v| v.as_string())
                .map(ConnectionType::from_str)
                .ok_or(RemoteXpcError::MissingField("ConnectionType"))?;
            devices.push(Device {
                device_id,
                udid,
                connection_type,
                product_id: props.get("ProductID").and_then(|v| v.as_unsigned()),
                connection_speed: props.get("ConnectionSpeed").and_then(|v| v.as_unsigned()),
                location_id: props.get("LocationID").and_then(|v| v.as_unsigned()),
            });
        }
        Ok(devices)
    }

    /// Fetches the pair record for a device by UDID.
    ///
    /// The response body carries the record as an inner plist blob in
    /// `PairRecordData`, decoded recursively.
    pub async fn read_pair_record(&mut self, udid: &str) -> Result<PairRecord, RemoteXpcError> {
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(PlistValue::Dictionary(req)).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(PlistValue::Data(inner)) => PairRecord::from_bytes(inner),
            _ => Err(RemoteXpcError::MissingField("PairRecordData")),
        }
    }

    /// Reads the muxer's SystemBUID.
    pub async fn read_buid(&mut self) -> Result<String, RemoteXpcError> {
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(PlistValue::Dictionary(req)).await?;
        let mut res = self.read_plist().await?;

        match res.shift_remove("BUID") {
            Some(PlistValue::String(buid)) => Ok(buid),
            _ => Err(RemoteXpcError::MissingField("BUID")),
        }
    }

    /// Dials a TCP port on a device.
    ///
    /// On success the muxer protocol is abandoned on this socket and the
    /// returned stream is a raw pipe to the device port.
    pub async fn connect(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, RemoteXpcError> {
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), (device_id as u64).into());
        // the muxer expects the port in network byte order
        req.insert("PortNumber".into(), port.swap_bytes().into());
        self.write_plist(PlistValue::Dictionary(req)).await?;
        let res = self.read_plist().await?;

        match res.get("Number").and_then(|v| v.as_unsigned()) {
            Some(0) => self
                .socket
                .take()
                .ok_or(RemoteXpcError::NoEstablishedConnection),
            Some(n) => Err(RemoteXpcError::MuxConnectRefused(n)),
            None => Err(RemoteXpcError::MissingField("Number")),
        }
    }

    /// Closes the connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.socket = None;
    }

    async fn write_plist(&mut self, payload: PlistValue) -> Result<(), RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::NoEstablishedConnection)?;
        self.tag += 1;
        let packet = RawPacket::new(
            payload,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );
        let bytes: Vec<u8> = packet.into();
        socket.write_all(&bytes).await?;
        socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<Dictionary, RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::NoEstablishedConnection)?;
        let mut header = [0u8; raw_packet::HEADER_LEN];
        socket.read_exact(&mut header).await?;

        let size = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let body_len = (size as usize)
            .checked_sub(raw_packet::HEADER_LEN)
            .ok_or(RemoteXpcError::UnexpectedResponse)?;
        debug!("Reading {body_len} bytes from muxer");

        let mut body = vec![0u8; body_len];
        socket.read_exact(&mut body).await?;

        parse_plist(&body)?
            .into_dictionary()
            .ok_or(RemoteXpcError::UnexpectedResponse)
    }
}
