//! TLV8: Apple's one-byte-type, one-byte-length encoding.
//!
//! A logical item longer than 255 bytes is split into back-to-back records
//! of the same type; the decoder reassembles consecutive records sharing a
//! type into one item.

use indexmap::IndexMap;

use crate::RemoteXpcError;

/// Pairing data component types, as used by pair-setup and pair-verify.
pub mod types {
    pub const METHOD: u8 = 0x00;
    pub const IDENTIFIER: u8 = 0x01;
    pub const SALT: u8 = 0x02;
    pub const PUBLIC_KEY: u8 = 0x03;
    pub const PROOF: u8 = 0x04;
    pub const ENCRYPTED_DATA: u8 = 0x05;
    pub const STATE: u8 = 0x06;
    pub const ERROR_RESPONSE: u8 = 0x07;
    pub const RETRY_DELAY: u8 = 0x08;
    pub const CERTIFICATE: u8 = 0x09;
    pub const SIGNATURE: u8 = 0x0A;
    pub const PERMISSIONS: u8 = 0x0B;
    pub const FRAGMENT_DATA: u8 = 0x0C;
    pub const FRAGMENT_LAST: u8 = 0x0D;
    pub const SESSION_ID: u8 = 0x0E;
    pub const TTL: u8 = 0x0F;
    pub const EXTRA_DATA: u8 = 0x10;
    pub const INFO: u8 = 0x11;
    pub const ACL: u8 = 0x12;
    pub const FLAGS: u8 = 0x13;
    pub const VALIDATION_DATA: u8 = 0x14;
    pub const SEPARATOR: u8 = 0xFF;
}

const MAX_FRAGMENT: usize = 255;

/// One logical TLV8 item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv8Item {
    pub item_type: u8,
    pub data: Vec<u8>,
}

impl Tlv8Item {
    pub fn new(item_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            item_type,
            data: data.into(),
        }
    }

    /// The pairing state marker (`M1`, `M2`, ...).
    pub fn state(stage: u8) -> Self {
        Self::new(types::STATE, vec![stage])
    }
}

/// Serializes items, fragmenting any item longer than 255 bytes.
pub fn encode(items: &[Tlv8Item]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        if item.data.is_empty() {
            out.push(item.item_type);
            out.push(0);
            continue;
        }
        for fragment in item.data.chunks(MAX_FRAGMENT) {
            out.push(item.item_type);
            out.push(fragment.len() as u8);
            out.extend_from_slice(fragment);
        }
    }
    out
}

/// Parses a TLV8 buffer, reassembling consecutive same-type records.
pub fn decode(input: &[u8]) -> Result<Vec<Tlv8Item>, RemoteXpcError> {
    let mut items: Vec<Tlv8Item> = Vec::new();
    let mut index = 0;
    while index < input.len() {
        if index + 2 > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let item_type = input[index];
        let length = input[index + 1] as usize;
        index += 2;
        if index + length > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let data = &input[index..index + length];
        index += length;

        match items.last_mut() {
            Some(last) if last.item_type == item_type => last.data.extend_from_slice(data),
            _ => items.push(Tlv8Item::new(item_type, data)),
        }
    }
    Ok(items)
}

/// The dictionary form: type byte to reassembled data, last occurrence wins
/// for a type that reappears non-consecutively.
pub fn decode_to_dict(input: &[u8]) -> Result<IndexMap<u8, Vec<u8>>, RemoteXpcError> {
    let mut dict = IndexMap::new();
    for item in decode(input)? {
        dict.insert(item.item_type, item.data);
    }
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_the_documented_example() {
        let encoded = encode(&[Tlv8Item::new(0x01, vec![0x42, 0x43, 0x44])]);
        assert_eq!(encoded, [0x01, 0x03, 0x42, 0x43, 0x44]);
    }

    #[test]
    fn round_trips_mixed_items() {
        let items = vec![
            Tlv8Item::state(1),
            Tlv8Item::new(types::PUBLIC_KEY, vec![0xAA; 384]),
            Tlv8Item::new(types::SALT, vec![0x01; 16]),
            Tlv8Item::new(types::SEPARATOR, Vec::new()),
        ];
        let decoded = decode(&encode(&items)).unwrap();
        assert_eq!(decoded, items);
    }

    #[test]
    fn long_items_fragment_into_255_byte_records() {
        let data = vec![0x7Bu8; 600];
        let encoded = encode(&[Tlv8Item::new(0x05, data.clone())]);
        // 255 + 255 + 90 payload bytes, each with a 2-byte header
        assert_eq!(encoded.len(), 600 + 3 * 2);
        assert_eq!(encoded[0], 0x05);
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded[2 + 255], 0x05);
        assert_eq!(encoded[2 + 255 + 1], 255);

        let dict = decode_to_dict(&encoded).unwrap();
        assert_eq!(dict[&0x05], data);
    }

    #[test]
    fn premature_end_is_rejected() {
        assert!(matches!(
            decode(&[0x01]),
            Err(RemoteXpcError::MalformedTlv)
        ));
        assert!(matches!(
            decode(&[0x01, 0x05, 0x00]),
            Err(RemoteXpcError::MalformedTlv)
        ));
    }

    #[test]
    fn non_consecutive_types_stay_separate() {
        let items = vec![
            Tlv8Item::new(0x01, vec![1]),
            Tlv8Item::new(0x02, vec![2]),
            Tlv8Item::new(0x01, vec![3]),
        ];
        let decoded = decode(&encode(&items)).unwrap();
        assert_eq!(decoded.len(), 3);

        // in dict form the later occurrence wins
        let dict = decode_to_dict(&encode(&items)).unwrap();
        assert_eq!(dict[&0x01], vec![3]);
    }
}
