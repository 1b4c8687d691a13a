//! Property list values and codecs.
//!
//! Everything the device stack exchanges is a property list, either as an
//! XML document or as an Apple binary plist (`bplist00`). [`PlistValue`] is
//! the shared value type; [`xml`] and [`binary`] are the codecs and
//! [`PlistSplitter`] cuts a raw byte stream into whole plist messages.

pub mod binary;
pub mod splitter;
pub mod xml;

pub use splitter::{PlistSplitter, SplitterConfig};

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use thiserror::Error;

/// Ordered string-keyed mapping, the shape of nearly every device message.
pub type Dictionary = IndexMap<String, PlistValue>;

/// Seconds between the Unix epoch and Apple's 2001-01-01 UTC epoch.
pub(crate) const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// A parsed property list value.
///
/// Integers are carried as `i128` so unsigned 64-bit values from binary
/// plists survive the round trip without truncation.
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Null,
    Boolean(bool),
    Integer(i128),
    Real(f64),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
    String(String),
    Array(Vec<PlistValue>),
    Dictionary(Dictionary),
    Uid(u64),
}

impl PlistValue {
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PlistValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i128> {
        match self {
            PlistValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            PlistValue::Integer(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            PlistValue::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            PlistValue::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PlistValue]> {
        match self {
            PlistValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<PlistValue>> {
        match self {
            PlistValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            PlistValue::Data(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for PlistValue {
    fn from(value: bool) -> Self {
        PlistValue::Boolean(value)
    }
}

impl From<i64> for PlistValue {
    fn from(value: i64) -> Self {
        PlistValue::Integer(value as i128)
    }
}

impl From<i32> for PlistValue {
    fn from(value: i32) -> Self {
        PlistValue::Integer(value as i128)
    }
}

impl From<u64> for PlistValue {
    fn from(value: u64) -> Self {
        PlistValue::Integer(value as i128)
    }
}

impl From<u16> for PlistValue {
    fn from(value: u16) -> Self {
        PlistValue::Integer(value as i128)
    }
}

impl From<i128> for PlistValue {
    fn from(value: i128) -> Self {
        PlistValue::Integer(value)
    }
}

impl From<f64> for PlistValue {
    fn from(value: f64) -> Self {
        PlistValue::Real(value)
    }
}

impl From<&str> for PlistValue {
    fn from(value: &str) -> Self {
        PlistValue::String(value.to_string())
    }
}

impl From<String> for PlistValue {
    fn from(value: String) -> Self {
        PlistValue::String(value)
    }
}

impl From<Vec<u8>> for PlistValue {
    fn from(value: Vec<u8>) -> Self {
        PlistValue::Data(value)
    }
}

impl From<Vec<PlistValue>> for PlistValue {
    fn from(value: Vec<PlistValue>) -> Self {
        PlistValue::Array(value)
    }
}

impl From<Dictionary> for PlistValue {
    fn from(value: Dictionary) -> Self {
        PlistValue::Dictionary(value)
    }
}

impl From<DateTime<Utc>> for PlistValue {
    fn from(value: DateTime<Utc>) -> Self {
        PlistValue::Date(value)
    }
}

/// Errors raised while encoding or decoding property lists
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PlistError {
    #[error("input has no root element")]
    NoRootElement,
    #[error("root element is not <plist>")]
    RootNotPlist,
    #[error("opening tag <{0}> was never closed")]
    UnclosedTag(String),
    #[error("document is empty after cleanup")]
    EmptyDocument,
    #[error("unexpected tag <{0}>")]
    UnexpectedTag(String),
    #[error("invalid {0} content: {1}")]
    InvalidContent(&'static str, String),
    #[error("input is not valid utf8")]
    InvalidUtf8,
    #[error("missing bplist00 magic")]
    InvalidMagic,
    #[error("binary plist trailer is malformed")]
    BadTrailer,
    #[error("unknown binary object marker 0x{0:02x}")]
    UnknownMarker(u8),
    #[error("binary dictionary key is not a string")]
    NonStringDictKey,
    #[error("object reference {0} is out of range")]
    BadObjectRef(u64),
    #[error("cyclic object reference at index {0}")]
    CyclicReference(u64),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("object nesting exceeds supported depth")]
    TooDeep,
}

/// Parses a buffer as a property list, auto-detecting the format.
///
/// Buffers that begin with the `bplist00` magic decode as binary; anything
/// else is decoded as UTF-8 and parsed as an XML plist.
pub fn parse_plist(bytes: &[u8]) -> Result<PlistValue, PlistError> {
    if bytes.starts_with(binary::BPLIST_MAGIC) {
        binary::from_binary(bytes)
    } else {
        let text = std::str::from_utf8(bytes).map_err(|_| PlistError::InvalidUtf8)?;
        xml::from_xml(text)
    }
}

/// Converts seconds relative to the Apple epoch to an absolute instant.
pub(crate) fn date_from_apple_seconds(seconds: f64) -> DateTime<Utc> {
    let unix = seconds + APPLE_EPOCH_OFFSET as f64;
    let secs = unix.floor() as i64;
    let nanos = ((unix - unix.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Converts an absolute instant to seconds relative to the Apple epoch.
pub(crate) fn date_to_apple_seconds(date: &DateTime<Utc>) -> f64 {
    let unix = date.timestamp() as f64 + date.timestamp_subsec_nanos() as f64 / 1e9;
    unix - APPLE_EPOCH_OFFSET as f64
}
