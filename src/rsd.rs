//! Remote Service Discovery client.
//!
//! Given the tunnel-side (IPv6 address, RSD port), this opens a TCP
//! connection, runs the minimal HTTP/2 handshake and reads the device's
//! service catalog. The catalog payload interleaves binary framing with
//! free text; service names (`com.apple.…`) are extracted together with the
//! decimal port that follows each one's `Port` key.

use std::collections::HashSet;
use std::net::Ipv6Addr;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::http2::{
    setting, write_frame, DataFrame, Frame, HeadersFrame, SettingsFrame, WindowUpdateFrame,
    CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE,
};
use crate::plist::Dictionary;
use crate::{ReadWrite, RemoteXpcError};

/// One entry from the RSD catalog.
///
/// Ports arrive as decimal strings and are kept that way; names are unique
/// within a single catalog snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    pub port: String,
    pub properties: Option<Dictionary>,
}

impl ServiceEntry {
    /// The port as a number, when it parses.
    pub fn port_number(&self) -> Option<u16> {
        self.port.parse().ok()
    }
}

/// A connected RSD catalog reader.
#[derive(Debug)]
pub struct RsdClient {
    socket: Option<Box<dyn ReadWrite>>,
    services: Vec<ServiceEntry>,
    max_frame_size: u32,
}

impl RsdClient {
    /// The single request stream the handshake uses.
    pub const HANDSHAKE_STREAM_ID: u32 = 1;

    /// Dials the RSD port inside the tunnel and reads the catalog.
    pub async fn connect(address: Ipv6Addr, port: u16) -> Result<Self, RemoteXpcError> {
        let stream = tokio::net::TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(Box::new(stream)).await
    }

    /// Runs the handshake over an already-established stream.
    pub async fn from_stream(socket: Box<dyn ReadWrite>) -> Result<Self, RemoteXpcError> {
        let mut client = Self {
            socket: Some(socket),
            services: Vec::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<(), RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::ConnectionClosed)?;

        socket.write_all(CONNECTION_PREFACE).await?;
        write_frame(
            socket,
            &SettingsFrame::new(vec![
                (setting::ENABLE_CONNECT_PROTOCOL, 1),
                (setting::MAX_CONCURRENT_STREAMS, 100),
            ]),
        )
        .await?;
        write_frame(socket, &HeadersFrame::open_stream(Self::HANDSHAKE_STREAM_ID)).await?;

        let mut catalog = Vec::new();
        loop {
            let frame = match Frame::read(socket, self.max_frame_size).await {
                Ok(frame) => frame,
                Err(RemoteXpcError::Socket(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof && !catalog.is_empty() =>
                {
                    // the peer hung up after streaming the catalog
                    break;
                }
                Err(e) => return Err(e),
            };
            match frame {
                Frame::Settings(settings) => {
                    if settings.is_ack() {
                        continue;
                    }
                    if let Some(max) = settings.get(setting::MAX_FRAME_SIZE) {
                        self.max_frame_size = max;
                    }
                    write_frame(socket, &SettingsFrame::ack()).await?;
                }
                Frame::Headers(headers) => {
                    debug!("RSD response headers on stream {}", headers.stream_id);
                }
                Frame::Data(data) => {
                    let consumed = data.payload.len() as u32;
                    catalog.extend_from_slice(&data.payload);
                    if consumed > 0 {
                        // keep the receive window open or the server stalls
                        write_frame(
                            socket,
                            &WindowUpdateFrame {
                                stream_id: 0,
                                increment: consumed,
                            },
                        )
                        .await?;
                        write_frame(
                            socket,
                            &WindowUpdateFrame {
                                stream_id: data.stream_id,
                                increment: consumed,
                            },
                        )
                        .await?;
                    }
                    if data.end_stream() {
                        break;
                    }
                }
                Frame::WindowUpdate(update) => {
                    debug!(
                        "peer window update: stream {} += {}",
                        update.stream_id, update.increment
                    );
                }
            }
        }

        self.services = extract_services(&catalog);
        if self.services.is_empty() {
            warn!("RSD catalog contained no services");
        }
        Ok(())
    }

    /// Every service the catalog advertised, in catalog order.
    pub fn list_all_services(&self) -> &[ServiceEntry] {
        &self.services
    }

    /// Looks up a service by its full reverse-DNS name.
    pub fn find_service(&self, name: &str) -> Result<&ServiceEntry, RemoteXpcError> {
        self.services
            .iter()
            .find(|service| service.name == name)
            .ok_or(RemoteXpcError::ServiceNotFound)
    }

    /// Closes the connection, best effort. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
    }
}

/// Pulls (service name, port) pairs out of the catalog payload text.
///
/// When two service names appear without an intervening port, the first is
/// discarded.
fn extract_services(payload: &[u8]) -> Vec<ServiceEntry> {
    let mut services = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut pending: Option<String> = None;
    let mut awaiting_port = false;

    for token in tokenize(payload) {
        if token.starts_with("com.apple.") {
            pending = Some(token);
            awaiting_port = false;
        } else if token == "Port" {
            awaiting_port = pending.is_some();
        } else if awaiting_port && is_port(&token) {
            if let Some(name) = pending.take() {
                if seen.insert(name.clone()) {
                    services.push(ServiceEntry {
                        name,
                        port: token,
                        properties: None,
                    });
                }
            }
            awaiting_port = false;
        }
    }
    services
}

/// Printable-ASCII runs embedded among the binary framing.
fn tokenize(payload: &[u8]) -> impl Iterator<Item = String> + '_ {
    payload
        .split(|b| !(0x21..=0x7E).contains(b))
        .filter(|run| !run.is_empty())
        .map(|run| String::from_utf8_lossy(run).to_string())
}

fn is_port(token: &str) -> bool {
    !token.is_empty() && token.len() <= 5 && token.parse::<u16>().is_ok()
}
