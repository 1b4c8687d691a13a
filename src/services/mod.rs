//! The service call fabric.
//!
//! Every domain service resolves to a (host, port) pair inside the tunnel
//! via the RSD catalog. A [`ServiceConnection`] dials that port, performs
//! the RSD check-in and then exchanges length-framed plists; inbound bytes
//! run through the stream splitter so XML bodies with unreliable prefixes
//! still frame correctly. On top of the same connection three interaction
//! patterns exist: one-shot request/response, notification streams and the
//! heartbeat keep-alive loop; the modules in this directory wrap them per
//! service.

pub mod diagnostics;
pub mod heartbeat;
pub mod mounter;
pub mod notification_proxy;
pub mod syslog;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::plist::{parse_plist, xml, Dictionary, PlistSplitter, PlistValue};
use crate::{ReadWrite, RemoteXpcError};

const READ_CHUNK: usize = 8192;

/// Label sent with every check-in and request.
pub const SERVICE_LABEL: &str = "appium-internal";

/// Default deadline for establishing the TCP connection.
pub const CREATE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// One connection to a service resolved from the RSD catalog.
///
/// Callers must serialize requests; one request is in flight at a time.
#[derive(Debug)]
pub struct ServiceConnection {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
    splitter: PlistSplitter,
    pending: VecDeque<Vec<u8>>,
}

impl ServiceConnection {
    /// Dials (host, port) with the default connection timeout.
    pub async fn connect(host: IpAddr, port: u16) -> Result<Self, RemoteXpcError> {
        Self::connect_with_timeout(host, port, CREATE_CONNECTION_TIMEOUT).await
    }

    /// Dials (host, port), failing once `timeout` elapses.
    pub async fn connect_with_timeout(
        host: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, RemoteXpcError> {
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port)))
            .await
            .map_err(|_| RemoteXpcError::Timeout(timeout.as_millis()))??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(Box::new(stream)))
    }

    /// Wraps an already-established stream.
    pub fn from_stream(socket: Box<dyn ReadWrite>) -> Self {
        Self {
            socket: Some(socket),
            label: SERVICE_LABEL.to_string(),
            splitter: PlistSplitter::new(),
            pending: VecDeque::new(),
        }
    }

    /// Performs the RSD check-in that every per-service connection starts
    /// with.
    pub async fn check_in(&mut self) -> Result<(), RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Label".into(), self.label.clone().into());
        request.insert("ProtocolVersion".into(), "2".into());
        request.insert("Request".into(), "RSDCheckin".into());
        self.send_plist(PlistValue::Dictionary(request)).await?;

        let response = self.read_plist().await?;
        match response.get("Request").and_then(|v| v.as_string()) {
            Some("RSDCheckin") => Ok(()),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Writes one plist and returns the first complete plist received after
    /// the send.
    pub async fn send_plist_request(
        &mut self,
        request: Dictionary,
        timeout: Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.send_plist(PlistValue::Dictionary(request)).await?;
        self.read_plist_timeout(timeout).await
    }

    pub async fn send_plist(&mut self, message: PlistValue) -> Result<(), RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::ConnectionClosed)?;
        debug!("sending service plist");
        let body = xml::to_xml(&message).into_bytes();
        socket.write_all(&(body.len() as u32).to_be_bytes()).await?;
        socket.write_all(&body).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends raw bytes with no plist framing (image uploads).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::ConnectionClosed)?;
        socket.write_all(bytes).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Pulls the next whole message out of the splitter, reading more from
    /// the socket as needed.
    pub async fn read_plist(&mut self) -> Result<Dictionary, RemoteXpcError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return parse_plist(&message)?
                    .into_dictionary()
                    .ok_or(RemoteXpcError::UnexpectedResponse);
            }

            let socket = self
                .socket
                .as_mut()
                .ok_or(RemoteXpcError::ConnectionClosed)?;
            let mut chunk = [0u8; READ_CHUNK];
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Err(RemoteXpcError::Socket(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed while awaiting a plist",
                )));
            }
            self.pending.extend(self.splitter.feed(&chunk[..n]));
        }
    }

    /// Reads the next plist or fails once the deadline passes.
    ///
    /// A timeout leaves the connection usable for the next request.
    pub async fn read_plist_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        match tokio::time::timeout(timeout, self.read_plist()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteXpcError::Timeout(timeout.as_millis())),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Closes the connection. Safe to call more than once; pending reads
    /// fail with a stable "connection closed" error.
    pub fn close(&mut self) {
        self.socket = None;
        self.splitter = PlistSplitter::new();
        self.pending.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn check_in_exchanges_the_expected_message() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut connection = ServiceConnection::from_stream(Box::new(client_side));

        let server = tokio::spawn(async move {
            answer_checkin(&mut server_side).await;
        });

        connection.check_in().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn request_response_returns_the_first_reply() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut connection = ServiceConnection::from_stream(Box::new(client_side));

        let server = tokio::spawn(async move {
            let request = read_framed(&mut server_side).await;
            assert_eq!(
                request.get("Request").and_then(|v| v.as_string()),
                Some("GetValue")
            );
            let mut response = Dictionary::new();
            response.insert("Value".into(), "answer".into());
            write_framed(&mut server_side, response).await;
        });

        let mut request = Dictionary::new();
        request.insert("Request".into(), "GetValue".into());
        let response = connection
            .send_plist_request(request, Duration::from_secs(1))
            .await
            .unwrap();
        server.await.unwrap();
        assert_eq!(
            response.get("Value").and_then(|v| v.as_string()),
            Some("answer")
        );
    }

    #[tokio::test]
    async fn timeout_leaves_the_connection_usable() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut connection = ServiceConnection::from_stream(Box::new(client_side));

        let mut request = Dictionary::new();
        request.insert("Request".into(), "Slow".into());
        let err = connection
            .send_plist_request(request.clone(), Duration::from_millis(25))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::Timeout(25)));

        let server = tokio::spawn(async move {
            let _slow = read_framed(&mut server_side).await;
            let _retry = read_framed(&mut server_side).await;
            let mut response = Dictionary::new();
            response.insert("Status".into(), "Complete".into());
            write_framed(&mut server_side, response).await;
        });

        let response = connection
            .send_plist_request(request, Duration::from_secs(1))
            .await
            .unwrap();
        server.await.unwrap();
        assert_eq!(
            response.get("Status").and_then(|v| v.as_string()),
            Some("Complete")
        );
    }

    #[tokio::test]
    async fn reads_tolerate_unreliable_framing() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut connection = ServiceConnection::from_stream(Box::new(client_side));

        // a peer that frames a binary body with a little-endian prefix
        let mut body = Dictionary::new();
        body.insert("Status".into(), "Complete".into());
        let bin = crate::plist::binary::to_binary(&PlistValue::Dictionary(body));
        let server = tokio::spawn(async move {
            server_side
                .write_all(&(bin.len() as u32).to_le_bytes())
                .await
                .unwrap();
            server_side.write_all(&bin).await.unwrap();
        });

        let response = connection.read_plist().await.unwrap();
        server.await.unwrap();
        assert_eq!(
            response.get("Status").and_then(|v| v.as_string()),
            Some("Complete")
        );
    }

    #[tokio::test]
    async fn close_poisons_pending_use() {
        let (client_side, _server_side) = duplex(1024);
        let mut connection = ServiceConnection::from_stream(Box::new(client_side));
        connection.close();
        connection.close();
        let err = connection.read_plist().await.unwrap_err();
        assert!(matches!(err, RemoteXpcError::ConnectionClosed));
    }
}
