//! Splits an incoming byte stream into whole plist messages.
//!
//! Device streams interleave two framings: a 4-byte length prefix for binary
//! plists and raw XML documents whose length prefix, when present, is not
//! reliable. The splitter runs a small two-mode state machine and never
//! emits a partial message; leading garbage may be dropped up to the first
//! recognizable start.

use bytes::BytesMut;

const XML_MARKERS: [&[u8]; 2] = [b"<?xml", b"<plist"];
const PEEK_WINDOW: usize = 16;

/// Framing parameters for the length-prefixed mode.
#[derive(Debug, Clone, Copy)]
pub struct SplitterConfig {
    /// Byte offset of the length field within the header.
    pub length_offset: usize,
    /// Width of the length field in bytes.
    pub length_size: usize,
    /// Whether the length field is big-endian.
    pub big_endian: bool,
    /// Added to the decoded length to obtain the payload size.
    pub length_adjustment: i64,
    /// Upper bound on a single frame. Defaults generously to accommodate
    /// large IORegistry snapshots.
    pub max_frame_len: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            length_offset: 0,
            length_size: 4,
            big_endian: true,
            length_adjustment: 0,
            max_frame_len: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Framed,
    Xml,
}

/// Re-entrant plist stream splitter.
#[derive(Debug)]
pub struct PlistSplitter {
    config: SplitterConfig,
    buf: BytesMut,
    mode: Mode,
}

impl Default for PlistSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlistSplitter {
    pub fn new() -> Self {
        Self::with_config(SplitterConfig::default())
    }

    pub fn with_config(config: SplitterConfig) -> Self {
        Self {
            config,
            buf: BytesMut::new(),
            mode: Mode::Framed,
        }
    }

    /// Number of bytes currently buffered and not yet emitted.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends a chunk and returns every message completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let progressed = match self.mode {
                Mode::Framed => self.advance_framed(&mut out),
                Mode::Xml => self.advance_xml(&mut out),
            };
            if !progressed {
                break;
            }
        }
        out
    }

    fn header_len(&self) -> usize {
        self.config.length_offset + self.config.length_size
    }

    fn decode_length(&self, big_endian: bool) -> i64 {
        let field =
            &self.buf[self.config.length_offset..self.config.length_offset + self.config.length_size];
        let mut value: u64 = 0;
        if big_endian {
            for &b in field {
                value = (value << 8) | b as u64;
            }
        } else {
            for &b in field.iter().rev() {
                value = (value << 8) | b as u64;
            }
        }
        value as i64 + self.config.length_adjustment
    }

    fn payload_has_xml_marker(&self) -> bool {
        let start = self.header_len();
        let end = (start + PEEK_WINDOW).min(self.buf.len());
        let window = &self.buf[start..end];
        XML_MARKERS.iter().any(|m| contains(window, m))
    }

    fn buffer_has_xml_marker(&self) -> bool {
        XML_MARKERS.iter().any(|m| contains(&self.buf, m))
    }

    fn advance_framed(&mut self, out: &mut Vec<Vec<u8>>) -> bool {
        if self.buf.is_empty() {
            return false;
        }

        // a bare binary plist with no prefix is a single whole message,
        // emitted only once its trailer arithmetic says it is all here
        if self.buf.starts_with(super::binary::BPLIST_MAGIC) {
            if super::binary::is_complete(&self.buf) {
                out.push(self.buf.split().to_vec());
            }
            return false;
        }

        let header_len = self.header_len();
        if self.buf.len() < header_len {
            return false;
        }

        let mut payload_len = self.decode_length(self.config.big_endian);
        let mut plausible = (0..=self.config.max_frame_len as i64).contains(&payload_len);
        if !plausible {
            // a mis-framed peer is more likely than a 64 MiB message
            payload_len = self.decode_length(!self.config.big_endian);
            plausible = (0..=self.config.max_frame_len as i64).contains(&payload_len);
        }

        if !plausible {
            if self.buffer_has_xml_marker() {
                self.mode = Mode::Xml;
                return true;
            }
            // re-synchronize one byte at a time
            let _ = self.buf.split_to(1);
            return !self.buf.is_empty();
        }

        // the length prefix is unreliable for XML payloads
        if self.buf.len() >= header_len + 5 && self.payload_has_xml_marker() {
            self.mode = Mode::Xml;
            return true;
        }

        let payload_len = payload_len as usize;
        if self.buf.len() < header_len + payload_len {
            return false;
        }
        let frame = self.buf.split_to(header_len + payload_len);
        out.push(frame[header_len..].to_vec());
        true
    }

    fn advance_xml(&mut self, out: &mut Vec<Vec<u8>>) -> bool {
        let start = match XML_MARKERS
            .iter()
            .filter_map(|m| find(&self.buf, m))
            .min()
        {
            Some(pos) => pos,
            None => {
                // the marker that brought us here is gone; fall back
                self.mode = Mode::Framed;
                return !self.buf.is_empty();
            }
        };

        let end = match find(&self.buf[start..], b"</plist>") {
            Some(rel) => start + rel + b"</plist>".len(),
            None => return false,
        };

        let consumed = self.buf.split_to(end);
        out.push(consumed[start..].to_vec());

        // whitespace between messages is framing noise, not a length prefix
        let tail_start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        let _ = self.buf.split_to(tail_start);

        // decide whether the tail is still XML or a new framed message
        if !XML_MARKERS.iter().any(|m| self.buf.starts_with(m)) {
            self.mode = Mode::Framed;
        }
        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plist::{binary, parse_plist, xml, Dictionary, PlistValue};

    fn framed_binary(value: &PlistValue) -> Vec<u8> {
        let body = binary::to_binary(value);
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    fn framed_xml(value: &PlistValue) -> Vec<u8> {
        let body = xml::to_xml(value);
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body.as_bytes());
        out
    }

    fn dict(key: &str, n: i64) -> PlistValue {
        let mut d = Dictionary::new();
        d.insert(key.into(), n.into());
        PlistValue::Dictionary(d)
    }

    #[test]
    fn arbitrary_chunking_preserves_messages() {
        let values = [dict("a", 1), dict("b", 2), dict("c", 3), dict("d", 4)];
        let mut stream = Vec::new();
        stream.extend(framed_binary(&values[0]));
        stream.extend(framed_xml(&values[1]));
        stream.extend(framed_binary(&values[2]));
        stream.extend(framed_xml(&values[3]));

        for chunk_size in [1usize, 3, 7, 64, stream.len()] {
            let mut splitter = PlistSplitter::new();
            let mut messages = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                messages.extend(splitter.feed(chunk));
            }
            assert_eq!(messages.len(), 4, "chunk size {chunk_size}");
            for (message, expected) in messages.iter().zip(&values) {
                assert_eq!(&parse_plist(message).unwrap(), expected);
            }
        }
    }

    #[test]
    fn leading_garbage_before_xml_is_dropped() {
        let value = dict("x", 42);
        let mut stream = b"GARBAGEGARBAGE".to_vec();
        stream.extend(xml::to_xml(&value).into_bytes());

        let mut splitter = PlistSplitter::new();
        let messages = splitter.feed(&stream);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), value);
    }

    #[test]
    fn implausible_length_with_xml_markers_switches_modes() {
        let value = dict("x", 1);
        let mut stream = 0xFFFF_FFFFu32.to_be_bytes().to_vec();
        stream.extend(xml::to_xml(&value).into_bytes());

        let mut splitter = PlistSplitter::new();
        let messages = splitter.feed(&stream);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), value);
    }

    #[test]
    fn opposite_endianness_is_tried() {
        let body = binary::to_binary(&dict("x", 9));
        let mut stream = (body.len() as u32).to_le_bytes().to_vec();
        stream.extend_from_slice(&body);

        let mut splitter = PlistSplitter::new(); // configured big-endian
        let messages = splitter.feed(&stream);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), dict("x", 9));
    }

    #[test]
    fn framing_parameters_are_configurable() {
        // a peer whose length field is little-endian and counts itself
        let body = binary::to_binary(&dict("cfg", 7));
        let mut stream = ((body.len() + 4) as u32).to_le_bytes().to_vec();
        stream.extend_from_slice(&body);

        let mut splitter = PlistSplitter::with_config(SplitterConfig {
            big_endian: false,
            length_adjustment: -4,
            ..SplitterConfig::default()
        });
        let messages = splitter.feed(&stream);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), dict("cfg", 7));
    }

    #[test]
    fn pure_garbage_is_discarded_without_emitting() {
        let mut splitter = PlistSplitter::new();
        let messages = splitter.feed(&[0xFFu8; 256]);
        assert!(messages.is_empty());
        // every byte was either consumed or held for resync
        assert!(splitter.buffered() < 256);
    }

    #[test]
    fn unprefixed_binary_plist_is_one_message() {
        let value = dict("solo", 5);
        let body = binary::to_binary(&value);

        let mut splitter = PlistSplitter::new();
        let messages = splitter.feed(&body);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), value);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn unprefixed_binary_plist_reassembles_across_chunks() {
        let value = dict("solo", 5);
        let body = binary::to_binary(&value);

        let mut splitter = PlistSplitter::new();
        // the magic alone is not a message
        let (magic, rest) = body.split_at(8);
        assert!(splitter.feed(magic).is_empty());
        let (mid, last) = rest.split_at(rest.len() / 2);
        assert!(splitter.feed(mid).is_empty());

        let messages = splitter.feed(last);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), value);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn xml_without_terminator_is_not_emitted() {
        let value = dict("x", 1);
        let text = xml::to_xml(&value);
        let (head, tail) = text.as_bytes().split_at(text.len() - 10);

        let mut splitter = PlistSplitter::new();
        assert!(splitter.feed(head).is_empty());
        let messages = splitter.feed(tail);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_plist(&messages[0]).unwrap(), value);
    }
}
