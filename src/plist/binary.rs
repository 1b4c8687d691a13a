//! Binary property list (`bplist00`) reader and writer.
//!
//! The reader materializes arrays and dictionaries in two passes so that
//! forward and cross references in the object table resolve without deep
//! recursion into unparsed objects. True reference cycles cannot be
//! represented by an owned value tree and are rejected.

use super::{date_from_apple_seconds, date_to_apple_seconds, Dictionary, PlistError, PlistValue};

pub const BPLIST_MAGIC: &[u8; 8] = b"bplist00";

const TRAILER_LEN: usize = 32;
const MAX_RESOLVE_DEPTH: usize = 512;

/// Parses a complete binary plist buffer.
pub fn from_binary(bytes: &[u8]) -> Result<PlistValue, PlistError> {
    if !bytes.starts_with(BPLIST_MAGIC) {
        return Err(PlistError::InvalidMagic);
    }
    if bytes.len() < BPLIST_MAGIC.len() + TRAILER_LEN {
        return Err(PlistError::BadTrailer);
    }

    let trailer = &bytes[bytes.len() - TRAILER_LEN..];
    let offset_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().unwrap());
    let top_object = u64::from_be_bytes(trailer[16..24].try_into().unwrap());
    let offset_table_offset = u64::from_be_bytes(trailer[24..32].try_into().unwrap());

    if offset_size == 0 || offset_size > 8 || ref_size == 0 || ref_size > 8 {
        return Err(PlistError::BadTrailer);
    }
    let table_len = num_objects
        .checked_mul(offset_size as u64)
        .ok_or(PlistError::BadTrailer)?;
    let table_end = offset_table_offset
        .checked_add(table_len)
        .ok_or(PlistError::BadTrailer)?;
    if table_end > (bytes.len() - TRAILER_LEN) as u64 || top_object >= num_objects {
        return Err(PlistError::BadTrailer);
    }

    let mut offsets = Vec::with_capacity(num_objects as usize);
    for i in 0..num_objects as usize {
        let start = offset_table_offset as usize + i * offset_size;
        offsets.push(read_be_uint(&bytes[start..start + offset_size]));
    }

    // first pass: every object, children left as table references
    let mut raw = Vec::with_capacity(offsets.len());
    for &offset in &offsets {
        let mut reader = Reader {
            bytes,
            pos: offset as usize,
            ref_size,
        };
        raw.push(reader.read_object()?);
    }

    // second pass: resolve references into owned values
    let mut memo: Vec<Resolution> = vec![Resolution::Unresolved; raw.len()];
    resolve(top_object, &raw, &mut memo, 0)
}

/// Whether `bytes` holds exactly one complete binary plist.
///
/// A finished bplist ends with its trailer, so the trailer arithmetic must
/// land exactly on the buffer length: offset table offset + table size +
/// trailer = total. Used by the stream splitter to know when an unprefixed
/// bplist has fully arrived.
pub(crate) fn is_complete(bytes: &[u8]) -> bool {
    if !bytes.starts_with(BPLIST_MAGIC) || bytes.len() < BPLIST_MAGIC.len() + TRAILER_LEN {
        return false;
    }
    let trailer = &bytes[bytes.len() - TRAILER_LEN..];
    let offset_size = trailer[6] as u64;
    let ref_size = trailer[7] as u64;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().unwrap());
    let top_object = u64::from_be_bytes(trailer[16..24].try_into().unwrap());
    let offset_table_offset = u64::from_be_bytes(trailer[24..32].try_into().unwrap());

    if !(1..=8).contains(&offset_size)
        || !(1..=8).contains(&ref_size)
        || num_objects == 0
        || top_object >= num_objects
        || offset_table_offset < BPLIST_MAGIC.len() as u64
    {
        return false;
    }
    num_objects
        .checked_mul(offset_size)
        .and_then(|table_len| offset_table_offset.checked_add(table_len))
        .and_then(|table_end| table_end.checked_add(TRAILER_LEN as u64))
        .map(|total| total == bytes.len() as u64)
        .unwrap_or(false)
}

#[derive(Clone)]
enum RawObject {
    Value(PlistValue),
    Array(Vec<u64>),
    Dictionary(Vec<(u64, u64)>),
}

#[derive(Clone)]
enum Resolution {
    Unresolved,
    InProgress,
    Done(PlistValue),
}

fn resolve(
    index: u64,
    raw: &[RawObject],
    memo: &mut Vec<Resolution>,
    depth: usize,
) -> Result<PlistValue, PlistError> {
    if depth > MAX_RESOLVE_DEPTH {
        return Err(PlistError::TooDeep);
    }
    let i = index as usize;
    if i >= raw.len() {
        return Err(PlistError::BadObjectRef(index));
    }
    match &memo[i] {
        Resolution::Done(v) => return Ok(v.clone()),
        Resolution::InProgress => return Err(PlistError::CyclicReference(index)),
        Resolution::Unresolved => {}
    }
    memo[i] = Resolution::InProgress;

    let value = match &raw[i] {
        RawObject::Value(v) => v.clone(),
        RawObject::Array(refs) => {
            let mut items = Vec::with_capacity(refs.len());
            for &r in refs {
                items.push(resolve(r, raw, memo, depth + 1)?);
            }
            PlistValue::Array(items)
        }
        RawObject::Dictionary(pairs) => {
            let mut dict = Dictionary::with_capacity(pairs.len());
            for &(key_ref, value_ref) in pairs {
                let key = match resolve(key_ref, raw, memo, depth + 1)? {
                    PlistValue::String(s) => s,
                    _ => return Err(PlistError::NonStringDictKey),
                };
                let value = resolve(value_ref, raw, memo, depth + 1)?;
                dict.insert(key, value);
            }
            PlistValue::Dictionary(dict)
        }
    };

    memo[i] = Resolution::Done(value.clone());
    Ok(value)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    ref_size: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PlistError> {
        if self.pos + n > self.bytes.len() {
            return Err(PlistError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_ref(&mut self) -> Result<u64, PlistError> {
        Ok(read_be_uint(self.take(self.ref_size)?))
    }

    /// Reads a marker's length nibble, following the 0x0F extended-length
    /// convention where an integer object holds the real count.
    fn read_length(&mut self, nibble: u8) -> Result<usize, PlistError> {
        if nibble != 0x0F {
            return Ok(nibble as usize);
        }
        let marker = self.take(1)?[0];
        if marker & 0xF0 != 0x10 {
            return Err(PlistError::UnknownMarker(marker));
        }
        let width = 1usize << (marker & 0x0F);
        if width > 8 {
            return Err(PlistError::UnknownMarker(marker));
        }
        Ok(read_be_uint(self.take(width)?) as usize)
    }

    fn read_object(&mut self) -> Result<RawObject, PlistError> {
        let marker = self.take(1)?[0];
        let nibble = marker & 0x0F;
        Ok(match marker >> 4 {
            0x0 => match marker {
                0x00 => RawObject::Value(PlistValue::Null),
                0x08 => RawObject::Value(PlistValue::Boolean(false)),
                0x09 => RawObject::Value(PlistValue::Boolean(true)),
                0x0F => RawObject::Value(PlistValue::Null), // fill byte
                other => return Err(PlistError::UnknownMarker(other)),
            },
            0x1 => {
                let width = 1usize << nibble;
                let bytes = self.take(width)?;
                let value = match width {
                    1 | 2 | 4 => read_be_uint(bytes) as i128,
                    8 => i64::from_be_bytes(bytes.try_into().unwrap()) as i128,
                    16 => i128::from_be_bytes(bytes.try_into().unwrap()),
                    _ => return Err(PlistError::UnknownMarker(marker)),
                };
                RawObject::Value(PlistValue::Integer(value))
            }
            0x2 => {
                let value = match nibble {
                    2 => f32::from_be_bytes(self.take(4)?.try_into().unwrap()) as f64,
                    3 => f64::from_be_bytes(self.take(8)?.try_into().unwrap()),
                    _ => return Err(PlistError::UnknownMarker(marker)),
                };
                RawObject::Value(PlistValue::Real(value))
            }
            0x3 => {
                if nibble != 3 {
                    return Err(PlistError::UnknownMarker(marker));
                }
                let seconds = f64::from_be_bytes(self.take(8)?.try_into().unwrap());
                RawObject::Value(PlistValue::Date(date_from_apple_seconds(seconds)))
            }
            0x4 => {
                let len = self.read_length(nibble)?;
                RawObject::Value(PlistValue::Data(self.take(len)?.to_vec()))
            }
            0x5 => {
                let len = self.read_length(nibble)?;
                let bytes = self.take(len)?;
                if !bytes.is_ascii() {
                    return Err(PlistError::InvalidUtf8);
                }
                RawObject::Value(PlistValue::String(
                    String::from_utf8_lossy(bytes).to_string(),
                ))
            }
            0x6 => {
                let len = self.read_length(nibble)?;
                let bytes = self.take(len * 2)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let text = String::from_utf16(&units).map_err(|_| PlistError::InvalidUtf8)?;
                RawObject::Value(PlistValue::String(text))
            }
            0x8 => {
                let bytes = self.take(nibble as usize + 1)?;
                RawObject::Value(PlistValue::Uid(read_be_uint(bytes)))
            }
            0xA => {
                let len = self.read_length(nibble)?;
                let mut refs = Vec::with_capacity(len);
                for _ in 0..len {
                    refs.push(self.read_ref()?);
                }
                RawObject::Array(refs)
            }
            0xD => {
                let len = self.read_length(nibble)?;
                let mut key_refs = Vec::with_capacity(len);
                for _ in 0..len {
                    key_refs.push(self.read_ref()?);
                }
                let mut pairs = Vec::with_capacity(len);
                for key_ref in key_refs {
                    pairs.push((key_ref, self.read_ref()?));
                }
                RawObject::Dictionary(pairs)
            }
            _ => return Err(PlistError::UnknownMarker(marker)),
        })
    }
}

fn read_be_uint(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in bytes {
        value = (value << 8) | b as u64;
    }
    value
}

/// Serializes a value as a complete binary plist.
pub fn to_binary(value: &PlistValue) -> Vec<u8> {
    let mut objects = Vec::new();
    flatten(value, &mut objects);

    let ref_size = byte_width(objects.len().saturating_sub(1) as u64);
    let mut out = BPLIST_MAGIC.to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for entry in &objects {
        offsets.push(out.len() as u64);
        write_object(entry, ref_size, &mut out);
    }

    let offset_table_offset = out.len() as u64;
    let offset_size = byte_width(offset_table_offset);
    for offset in &offsets {
        write_be_uint(*offset, offset_size, &mut out);
    }

    // trailer: 6 unused bytes, sizes, counts, top object, table offset
    out.extend_from_slice(&[0u8; 6]);
    out.push(offset_size as u8);
    out.push(ref_size as u8);
    out.extend_from_slice(&(objects.len() as u64).to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&offset_table_offset.to_be_bytes());
    out
}

enum FlatObject {
    Value(PlistValue),
    Array(Vec<u64>),
    Dictionary(Vec<(u64, u64)>),
}

/// Assigns table indices depth-first, parent before children.
fn flatten(value: &PlistValue, objects: &mut Vec<FlatObject>) -> u64 {
    let index = objects.len() as u64;
    match value {
        PlistValue::Array(items) => {
            objects.push(FlatObject::Array(Vec::new()));
            let refs: Vec<u64> = items.iter().map(|item| flatten(item, objects)).collect();
            objects[index as usize] = FlatObject::Array(refs);
        }
        PlistValue::Dictionary(dict) => {
            objects.push(FlatObject::Dictionary(Vec::new()));
            let mut pairs = Vec::with_capacity(dict.len());
            for (key, val) in dict {
                let key_ref = flatten(&PlistValue::String(key.clone()), objects);
                let val_ref = flatten(val, objects);
                pairs.push((key_ref, val_ref));
            }
            objects[index as usize] = FlatObject::Dictionary(pairs);
        }
        other => objects.push(FlatObject::Value(other.clone())),
    }
    index
}

fn write_object(entry: &FlatObject, ref_size: usize, out: &mut Vec<u8>) {
    match entry {
        FlatObject::Value(value) => write_scalar(value, out),
        FlatObject::Array(refs) => {
            write_marker(0xA0, refs.len(), out);
            for &r in refs {
                write_be_uint(r, ref_size, out);
            }
        }
        FlatObject::Dictionary(pairs) => {
            write_marker(0xD0, pairs.len(), out);
            for &(key_ref, _) in pairs {
                write_be_uint(key_ref, ref_size, out);
            }
            for &(_, val_ref) in pairs {
                write_be_uint(val_ref, ref_size, out);
            }
        }
    }
}

fn write_scalar(value: &PlistValue, out: &mut Vec<u8>) {
    match value {
        PlistValue::Null => out.push(0x00),
        PlistValue::Boolean(false) => out.push(0x08),
        PlistValue::Boolean(true) => out.push(0x09),
        PlistValue::Integer(i) => write_integer(*i, out),
        PlistValue::Real(r) => {
            out.push(0x23);
            out.extend_from_slice(&r.to_be_bytes());
        }
        PlistValue::Date(d) => {
            out.push(0x33);
            out.extend_from_slice(&date_to_apple_seconds(d).to_be_bytes());
        }
        PlistValue::Data(d) => {
            write_marker(0x40, d.len(), out);
            out.extend_from_slice(d);
        }
        PlistValue::String(s) => {
            if s.is_ascii() {
                write_marker(0x50, s.len(), out);
                out.extend_from_slice(s.as_bytes());
            } else {
                let units: Vec<u16> = s.encode_utf16().collect();
                write_marker(0x60, units.len(), out);
                for unit in units {
                    out.extend_from_slice(&unit.to_be_bytes());
                }
            }
        }
        PlistValue::Uid(u) => {
            let width = byte_width(*u);
            out.push(0x80 | (width as u8 - 1));
            write_be_uint(*u, width, out);
        }
        // containers are handled by write_object
        PlistValue::Array(_) | PlistValue::Dictionary(_) => unreachable!(),
    }
}

fn write_integer(value: i128, out: &mut Vec<u8>) {
    if value >= 0 && value <= u8::MAX as i128 {
        out.push(0x10);
        out.push(value as u8);
    } else if value >= 0 && value <= u16::MAX as i128 {
        out.push(0x11);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value >= 0 && value <= u32::MAX as i128 {
        out.push(0x12);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else if value >= i64::MIN as i128 && value <= i64::MAX as i128 {
        out.push(0x13);
        out.extend_from_slice(&(value as i64).to_be_bytes());
    } else {
        out.push(0x14);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn write_marker(base: u8, len: usize, out: &mut Vec<u8>) {
    if len < 0x0F {
        out.push(base | len as u8);
    } else {
        out.push(base | 0x0F);
        write_integer(len as i128, out);
    }
}

fn byte_width(value: u64) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

fn write_be_uint(value: u64, width: usize, out: &mut Vec<u8>) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - width..]);
}
