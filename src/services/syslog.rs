//! Streamed syslog over the tunnel's packet source.
//!
//! The control connection only starts the activity stream; the log payloads
//! themselves arrive as TCP packets through the tunnel, not over the control
//! socket. Packets that are mostly printable ASCII become message events;
//! when a payload embeds a plist, the parsed plist is emitted as well.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::ServiceConnection;
use crate::plist::{parse_plist, Dictionary, PlistValue};
use crate::tunnel::{ConsumerId, PacketProtocol, PacketSource};
use crate::RemoteXpcError;

/// RSD name of the trace relay inside the tunnel.
pub const SERVICE_NAME: &str = "com.apple.os_trace_relay.shim.remote";

const MESSAGE_FILTER: i64 = 65_535;
const STREAM_FLAGS: i64 = 60;

/// One event decoded from the packet stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SyslogEvent {
    /// A log line with non-printable bytes stripped.
    Message(String),
    /// A plist found embedded in a log packet.
    Plist(PlistValue),
}

/// A running syslog capture.
#[derive(Debug)]
pub struct SyslogService {
    control: Option<ServiceConnection>,
    packet_source: PacketSource,
    consumer: Option<ConsumerId>,
    forwarder: Option<JoinHandle<()>>,
}

impl SyslogService {
    /// Checks in, starts the activity stream and begins consuming packets.
    ///
    /// `pid` filters to one process; `None` captures everything.
    pub async fn start(
        mut control: ServiceConnection,
        packet_source: PacketSource,
        pid: Option<i64>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyslogEvent>), RemoteXpcError> {
        control.check_in().await?;

        let mut request = Dictionary::new();
        request.insert("Request".into(), "StartActivity".into());
        request.insert("MessageFilter".into(), MESSAGE_FILTER.into());
        request.insert("Pid".into(), pid.unwrap_or(-1).into());
        request.insert("StreamFlags".into(), STREAM_FLAGS.into());
        control.send_plist(PlistValue::Dictionary(request)).await?;

        let (consumer, mut packets) = packet_source.add_consumer();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(packet) = packets.recv().await {
                if packet.protocol != PacketProtocol::Tcp {
                    continue;
                }
                if !mostly_printable(&packet.payload) {
                    continue;
                }
                let message = strip_non_printable(&packet.payload);
                if events_tx.send(SyslogEvent::Message(message)).is_err() {
                    break;
                }
                if let Some(value) = extract_embedded_plist(&packet.payload) {
                    if events_tx.send(SyslogEvent::Plist(value)).is_err() {
                        break;
                    }
                }
            }
            debug!("syslog packet stream ended");
        });

        Ok((
            Self {
                control: Some(control),
                packet_source,
                consumer: Some(consumer),
                forwarder: Some(forwarder),
            },
            events_rx,
        ))
    }

    /// Tears down the packet listener and the control connection.
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            self.packet_source.remove_consumer(consumer);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut control) = self.control.take() {
            control.close();
        }
    }
}

impl Drop for SyslogService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// More than half the bytes must be printable ASCII to count as a log line.
fn mostly_printable(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let printable = bytes.iter().filter(|b| (0x20..=0x7E).contains(*b)).count();
    printable * 2 > bytes.len()
}

fn strip_non_printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|&b| b as char)
        .collect()
}

/// Looks for an embedded plist header and parses from there.
fn extract_embedded_plist(bytes: &[u8]) -> Option<PlistValue> {
    const MARKERS: [&[u8]; 3] = [b"bplist00", b"<?xml", b"<plist"];
    let position = MARKERS
        .iter()
        .filter_map(|marker| find(bytes, marker))
        .min()?;
    // trace packets sometimes carry an `I` length tag right before the magic
    parse_plist(&bytes[position..]).ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
