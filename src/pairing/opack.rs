//! OPACK2, the compact type-tagged encoding Apple TV pairing messages use.
//!
//! Only the encoder is needed host-side. Integers that fit neither the
//! single-byte nor the i32 form, and every negative number, promote to an
//! f32. The promotion loses precision below -2^23, so callers should not
//! pass such values.

use crate::plist::PlistValue;
use crate::RemoteXpcError;

const TERMINATOR: u8 = 0x03;
const SHORT_LEN: usize = 0x20;
const SHORT_COLLECTION: usize = 14;

/// Serializes a value to OPACK2 bytes.
pub fn dumps(value: &PlistValue) -> Result<Vec<u8>, RemoteXpcError> {
    let mut out = Vec::new();
    encode_into(value, &mut out)?;
    Ok(out)
}

fn encode_into(value: &PlistValue, out: &mut Vec<u8>) -> Result<(), RemoteXpcError> {
    match value {
        PlistValue::Null => out.push(0x03),
        PlistValue::Boolean(true) => out.push(0x01),
        PlistValue::Boolean(false) => out.push(0x02),
        PlistValue::Integer(n) => encode_integer(*n, out),
        PlistValue::Real(r) => encode_real(*r, out),
        PlistValue::String(s) => {
            let bytes = s.as_bytes();
            match bytes.len() {
                len if len < SHORT_LEN => out.push(0x40 + len as u8),
                len if len <= 0xFF => {
                    out.push(0x61);
                    out.push(len as u8);
                }
                len if len <= 0xFFFF => {
                    out.push(0x62);
                    out.extend_from_slice(&(len as u16).to_le_bytes());
                }
                len if len <= 0xFFFF_FFFF => {
                    out.push(0x63);
                    out.extend_from_slice(&(len as u32).to_le_bytes());
                }
                len => {
                    out.push(0x64);
                    out.extend_from_slice(&(len as u64).to_le_bytes());
                }
            }
            out.extend_from_slice(bytes);
        }
        PlistValue::Data(data) => {
            match data.len() {
                len if len < SHORT_LEN => out.push(0x70 + len as u8),
                len if len <= 0xFF => {
                    out.push(0x91);
                    out.push(len as u8);
                }
                len if len <= 0xFFFF => {
                    out.push(0x92);
                    out.extend_from_slice(&(len as u16).to_le_bytes());
                }
                len if len <= 0xFFFF_FFFF => {
                    out.push(0x93);
                    out.extend_from_slice(&(len as u32).to_le_bytes());
                }
                len => {
                    out.push(0x94);
                    out.extend_from_slice(&(len as u64).to_le_bytes());
                }
            }
            out.extend_from_slice(data);
        }
        PlistValue::Array(items) => {
            if items.len() <= SHORT_COLLECTION {
                out.push(0xD0 + items.len() as u8);
                for item in items {
                    encode_into(item, out)?;
                }
            } else {
                out.push(0xDF);
                for item in items {
                    encode_into(item, out)?;
                }
                out.push(TERMINATOR);
            }
        }
        PlistValue::Dictionary(dict) => {
            if dict.len() <= SHORT_COLLECTION {
                out.push(0xE0 + dict.len() as u8);
                for (key, val) in dict {
                    encode_into(&PlistValue::String(key.clone()), out)?;
                    encode_into(val, out)?;
                }
            } else {
                out.push(0xEF);
                for (key, val) in dict {
                    encode_into(&PlistValue::String(key.clone()), out)?;
                    encode_into(val, out)?;
                }
                // one terminator for the list, one for the implicit
                // trailing key
                out.push(TERMINATOR);
                out.push(TERMINATOR);
            }
        }
        PlistValue::Date(_) | PlistValue::Uid(_) => {
            return Err(RemoteXpcError::UnsupportedOpackValue)
        }
    }
    Ok(())
}

fn encode_integer(n: i128, out: &mut Vec<u8>) {
    if (0..=39).contains(&n) {
        out.push(0x08 + n as u8);
    } else if (40..=255).contains(&n) {
        out.push(0x30);
        out.push(n as u8);
    } else if n >= 0 && n <= i32::MAX as i128 {
        out.push(0x32);
        out.extend_from_slice(&(n as i32).to_le_bytes());
    } else {
        // negatives and oversize integers promote to f32
        out.push(0x35);
        out.extend_from_slice(&(n as f32).to_le_bytes());
    }
}

fn encode_real(r: f64, out: &mut Vec<u8>) {
    let narrowed = r as f32;
    if narrowed as f64 == r {
        out.push(0x35);
        out.extend_from_slice(&narrowed.to_le_bytes());
    } else {
        out.push(0x36);
        out.extend_from_slice(&r.to_le_bytes());
    }
}
