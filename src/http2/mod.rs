//! Minimal HTTP/2 framing, just enough to read the RSD service catalog.
//!
//! RemoteXPC rides on HTTP/2 framing; only the frame types the device
//! actually sends are implemented: DATA, HEADERS, SETTINGS and
//! WINDOW_UPDATE. HPACK is not needed to read the catalog, so header blocks
//! stay opaque bytes. The codec round-trips DATA padding and the HEADERS
//! priority field so a padded or prioritized peer does not desync the
//! stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{ReadWrite, RemoteXpcError};

/// The client connection preface, sent before any frame.
pub const CONNECTION_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame size every implementation must accept before SETTINGS arrive.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

const FRAME_HEADER_LEN: usize = 9;
const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// SETTINGS parameter identifiers.
pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x01;
    pub const ENABLE_PUSH: u16 = 0x02;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x03;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x04;
    pub const MAX_FRAME_SIZE: u16 = 0x05;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x06;
    pub const ENABLE_CONNECT_PROTOCOL: u16 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Settings,
    WindowUpdate,
}

impl FrameType {
    fn code(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Settings => 0x4,
            FrameType::WindowUpdate => 0x8,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = RemoteXpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(FrameType::Data),
            0x1 => Ok(FrameType::Headers),
            0x4 => Ok(FrameType::Settings),
            0x8 => Ok(FrameType::WindowUpdate),
            other => Err(RemoteXpcError::UnknownFrame(other)),
        }
    }
}

pub trait HttpFrame {
    fn serialize(&self) -> Vec<u8>;
}

/// A decoded frame from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Settings(SettingsFrame),
    WindowUpdate(WindowUpdateFrame),
}

impl Frame {
    /// Reads the next frame off the socket.
    ///
    /// `max_frame_size` is the value this endpoint advertised; bodies above
    /// it are a protocol violation.
    pub async fn read(
        socket: &mut (impl ReadWrite + ?Sized),
        max_frame_size: u32,
    ) -> Result<Self, RemoteXpcError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        socket.read_exact(&mut header).await?;

        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        if length > max_frame_size as usize {
            return Err(RemoteXpcError::FrameTooLarge(
                length,
                max_frame_size as usize,
            ));
        }
        let frame_type = FrameType::try_from(header[3])?;
        let flags = header[4];
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & STREAM_ID_MASK;

        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await?;
        Self::parse(frame_type, flags, stream_id, body)
    }

    fn parse(
        frame_type: FrameType,
        flags: u8,
        stream_id: u32,
        body: Vec<u8>,
    ) -> Result<Self, RemoteXpcError> {
        Ok(match frame_type {
            FrameType::Data => Frame::Data(DataFrame::parse(flags, stream_id, body)?),
            FrameType::Headers => Frame::Headers(HeadersFrame::parse(flags, stream_id, body)?),
            FrameType::Settings => Frame::Settings(SettingsFrame::parse(flags, stream_id, body)?),
            FrameType::WindowUpdate => {
                if body.len() != 4 {
                    return Err(RemoteXpcError::UnexpectedResponse);
                }
                Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    increment: u32::from_be_bytes(body.try_into().unwrap()) & STREAM_ID_MASK,
                })
            }
        })
    }
}

fn frame_header(frame_type: FrameType, flags: u8, stream_id: u32, length: usize) -> Vec<u8> {
    let len = (length as u32).to_be_bytes();
    let mut out = vec![len[1], len[2], len[3], frame_type.code(), flags];
    out.extend_from_slice(&(stream_id & STREAM_ID_MASK).to_be_bytes());
    out
}

/// DATA, the catalog payload carrier.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
    /// Pad bytes appended on the wire; round-tripped, not interpreted.
    pub pad_length: u8,
}

impl DataFrame {
    pub const END_STREAM: u8 = 0x01;
    pub const PADDED: u8 = 0x08;

    pub fn new(stream_id: u32, payload: Vec<u8>, flags: u8) -> Self {
        Self {
            stream_id,
            flags,
            payload,
            pad_length: 0,
        }
    }

    pub fn end_stream(&self) -> bool {
        self.flags & Self::END_STREAM != 0
    }

    fn parse(flags: u8, stream_id: u32, body: Vec<u8>) -> Result<Self, RemoteXpcError> {
        let (payload, pad_length) = strip_padding(&body, flags & Self::PADDED != 0)?;
        Ok(Self {
            stream_id,
            flags,
            payload,
            pad_length,
        })
    }
}

impl HttpFrame for DataFrame {
    fn serialize(&self) -> Vec<u8> {
        let padded = self.flags & Self::PADDED != 0;
        let length =
            self.payload.len() + if padded { 1 + self.pad_length as usize } else { 0 };
        let mut out = frame_header(FrameType::Data, self.flags, self.stream_id, length);
        if padded {
            out.push(self.pad_length);
        }
        out.extend_from_slice(&self.payload);
        if padded {
            out.extend(std::iter::repeat(0u8).take(self.pad_length as usize));
        }
        out
    }
}

/// Stream priority carried by a HEADERS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

/// HEADERS, used only to open streams; the header block stays opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub priority: Option<Priority>,
    pub header_block: Vec<u8>,
    pub pad_length: u8,
}

impl HeadersFrame {
    pub const END_STREAM: u8 = 0x01;
    pub const END_HEADERS: u8 = 0x04;
    pub const PADDED: u8 = 0x08;
    pub const PRIORITY: u8 = 0x20;

    /// An empty HEADERS frame that opens `stream_id`.
    pub fn open_stream(stream_id: u32) -> Self {
        Self {
            stream_id,
            flags: Self::END_HEADERS,
            priority: None,
            header_block: Vec::new(),
            pad_length: 0,
        }
    }

    fn parse(flags: u8, stream_id: u32, body: Vec<u8>) -> Result<Self, RemoteXpcError> {
        let (unpadded, pad_length) = strip_padding(&body, flags & Self::PADDED != 0)?;
        let mut rest = unpadded.as_slice();
        let priority = if flags & Self::PRIORITY != 0 {
            if rest.len() < 5 {
                return Err(RemoteXpcError::NotEnoughBytes(rest.len(), 5));
            }
            let dep = u32::from_be_bytes(rest[0..4].try_into().unwrap());
            let priority = Priority {
                exclusive: dep & 0x8000_0000 != 0,
                stream_dependency: dep & STREAM_ID_MASK,
                weight: rest[4],
            };
            rest = &rest[5..];
            Some(priority)
        } else {
            None
        };
        Ok(Self {
            stream_id,
            flags,
            priority,
            header_block: rest.to_vec(),
            pad_length,
        })
    }
}

impl HttpFrame for HeadersFrame {
    fn serialize(&self) -> Vec<u8> {
        let padded = self.flags & Self::PADDED != 0;
        let prioritized = self.flags & Self::PRIORITY != 0;
        let mut length = self.header_block.len();
        if padded {
            length += 1 + self.pad_length as usize;
        }
        if prioritized {
            length += 5;
        }

        let mut out = frame_header(FrameType::Headers, self.flags, self.stream_id, length);
        if padded {
            out.push(self.pad_length);
        }
        if prioritized {
            let priority = self.priority.unwrap_or(Priority {
                exclusive: false,
                stream_dependency: 0,
                weight: 0,
            });
            let mut dep = priority.stream_dependency & STREAM_ID_MASK;
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            out.extend_from_slice(&dep.to_be_bytes());
            out.push(priority.weight);
        }
        out.extend_from_slice(&self.header_block);
        if padded {
            out.extend(std::iter::repeat(0u8).take(self.pad_length as usize));
        }
        out
    }
}

/// SETTINGS, exchanged at connection start; order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub settings: Vec<(u16, u32)>,
    pub flags: u8,
}

impl SettingsFrame {
    pub const ACK: u8 = 0x01;

    pub fn new(settings: Vec<(u16, u32)>) -> Self {
        Self { settings, flags: 0 }
    }

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            flags: Self::ACK,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & Self::ACK != 0
    }

    /// The value of one parameter, if the peer sent it.
    pub fn get(&self, id: u16) -> Option<u32> {
        self.settings
            .iter()
            .rev()
            .find(|(key, _)| *key == id)
            .map(|(_, value)| *value)
    }

    fn parse(flags: u8, _stream_id: u32, body: Vec<u8>) -> Result<Self, RemoteXpcError> {
        if body.len() % 6 != 0 {
            return Err(RemoteXpcError::UnexpectedResponse);
        }
        let mut settings = Vec::with_capacity(body.len() / 6);
        for entry in body.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            match id {
                setting::HEADER_TABLE_SIZE
                | setting::ENABLE_PUSH
                | setting::MAX_CONCURRENT_STREAMS
                | setting::INITIAL_WINDOW_SIZE
                | setting::MAX_FRAME_SIZE
                | setting::MAX_HEADER_LIST_SIZE
                | setting::ENABLE_CONNECT_PROTOCOL => {}
                other => return Err(RemoteXpcError::UnknownHttpSetting(other)),
            }
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            settings.push((id, value));
        }
        Ok(Self { settings, flags })
    }
}

impl HttpFrame for SettingsFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut out = frame_header(FrameType::Settings, self.flags, 0, self.settings.len() * 6);
        for (id, value) in &self.settings {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }
}

/// WINDOW_UPDATE, our side of receive-window maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl HttpFrame for WindowUpdateFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut out = frame_header(FrameType::WindowUpdate, 0, self.stream_id, 4);
        out.extend_from_slice(&(self.increment & STREAM_ID_MASK).to_be_bytes());
        out
    }
}

fn strip_padding(body: &[u8], padded: bool) -> Result<(Vec<u8>, u8), RemoteXpcError> {
    if !padded {
        return Ok((body.to_vec(), 0));
    }
    if body.is_empty() {
        return Err(RemoteXpcError::NotEnoughBytes(0, 1));
    }
    let pad_length = body[0] as usize;
    let content = &body[1..];
    if pad_length > content.len() {
        return Err(RemoteXpcError::NotEnoughBytes(content.len(), pad_length));
    }
    Ok((content[..content.len() - pad_length].to_vec(), body[0]))
}

/// Writes a frame and flushes the socket.
pub async fn write_frame(
    socket: &mut (impl ReadWrite + ?Sized),
    frame: &impl HttpFrame,
) -> Result<(), RemoteXpcError> {
    socket.write_all(&frame.serialize()).await?;
    socket.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn round_trip(frame: &impl HttpFrame) -> Frame {
        let (mut a, mut b) = duplex(64 * 1024);
        write_frame(&mut a, frame).await.unwrap();
        Frame::read(&mut b, DEFAULT_MAX_FRAME_SIZE).await.unwrap()
    }

    #[tokio::test]
    async fn settings_round_trip_in_order() {
        let frame = SettingsFrame::new(vec![
            (setting::ENABLE_CONNECT_PROTOCOL, 1),
            (setting::MAX_CONCURRENT_STREAMS, 100),
            (setting::INITIAL_WINDOW_SIZE, 1_048_576),
        ]);
        match round_trip(&frame).await {
            Frame::Settings(parsed) => {
                assert_eq!(parsed.settings, frame.settings);
                assert!(!parsed.is_ack());
                assert_eq!(parsed.get(setting::MAX_CONCURRENT_STREAMS), Some(100));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_with_padding_round_trips() {
        let frame = DataFrame {
            stream_id: 1,
            flags: DataFrame::PADDED | DataFrame::END_STREAM,
            payload: b"catalog bytes".to_vec(),
            pad_length: 7,
        };
        match round_trip(&frame).await {
            Frame::Data(parsed) => {
                assert_eq!(parsed.payload, b"catalog bytes");
                assert_eq!(parsed.pad_length, 7);
                assert!(parsed.end_stream());
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn headers_with_priority_and_padding_round_trip() {
        let frame = HeadersFrame {
            stream_id: 3,
            flags: HeadersFrame::END_HEADERS | HeadersFrame::PRIORITY | HeadersFrame::PADDED,
            priority: Some(Priority {
                exclusive: true,
                stream_dependency: 1,
                weight: 42,
            }),
            header_block: vec![0x88, 0x76],
            pad_length: 3,
        };
        match round_trip(&frame).await {
            Frame::Headers(parsed) => {
                assert_eq!(parsed.priority, frame.priority);
                assert_eq!(parsed.header_block, frame.header_block);
                assert_eq!(parsed.pad_length, 3);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_update_round_trips() {
        let frame = WindowUpdateFrame {
            stream_id: 0,
            increment: 983_041,
        };
        match round_trip(&frame).await {
            Frame::WindowUpdate(parsed) => assert_eq!(parsed, frame),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_frame_types_are_rejected() {
        let (mut a, mut b) = duplex(1024);
        // a PING frame (type 0x6) with an 8-byte body
        let mut bytes = vec![0, 0, 8, 0x6, 0];
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        a.write_all(&bytes).await.unwrap();
        let err = Frame::read(&mut b, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::UnknownFrame(0x6)));
    }

    #[tokio::test]
    async fn oversize_frames_are_rejected() {
        let (mut a, mut b) = duplex(1024);
        let bytes = [0xFF, 0xFF, 0xFF, 0x0, 0, 0, 0, 0, 1];
        a.write_all(&bytes).await.unwrap();
        let err = Frame::read(&mut b, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::FrameTooLarge(_, 16384)));
    }
}
