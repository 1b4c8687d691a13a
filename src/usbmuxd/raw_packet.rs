//! The 16-byte little-endian header every usbmuxd message carries.

use crate::plist::{xml, PlistValue};

pub const HEADER_LEN: usize = 16;

/// One framed usbmuxd packet: header plus an XML plist body.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub size: u32,
    pub version: u32,
    pub message_type: u32,
    pub tag: u32,
    pub payload: PlistValue,
}

impl RawPacket {
    pub fn new(payload: PlistValue, version: u32, message_type: u32, tag: u32) -> Self {
        // size is computed at serialization time
        Self {
            size: 0,
            version,
            message_type,
            tag,
            payload,
        }
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(packet: RawPacket) -> Self {
        let body = xml::to_xml(&packet.payload).into_bytes();
        let size = (body.len() + HEADER_LEN) as u32;

        let mut out = Vec::with_capacity(size as usize);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&packet.version.to_le_bytes());
        out.extend_from_slice(&packet.message_type.to_le_bytes());
        out.extend_from_slice(&packet.tag.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plist::Dictionary;

    #[test]
    fn header_is_little_endian_and_counts_itself() {
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        let packet = RawPacket::new(PlistValue::Dictionary(dict), 1, 8, 7);
        let bytes: Vec<u8> = packet.into();

        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(size as usize, bytes.len());
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 7);
        assert!(bytes[HEADER_LEN..].starts_with(b"<?xml"));
    }
}
