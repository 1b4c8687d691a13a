//! Cryptographic primitives for Apple TV pair-setup and pair-verify.
//!
//! This stack is self-contained and independent of the iOS modules: the
//! TLV8 and OPACK2 codecs carry the pairing messages, SRP-6a establishes the
//! shared secret from the on-screen PIN, HKDF derives session keys,
//! Ed25519 signs the long-term identity and ChaCha20-Poly1305 seals the
//! encrypted TLV fragments. Bonjour discovery and host-id derivation round
//! out what pair-setup needs from the host side.

pub mod aead;
pub mod bonjour;
pub mod hkdf;
pub mod host_id;
pub mod opack;
pub mod signing;
pub mod srp;
pub mod tlv;

pub use aead::{decrypt, encrypt};
pub use bonjour::{BonjourBrowser, BonjourEvent, BonjourServiceKey};
pub use hkdf::hkdf_sha512;
pub use host_id::derive_host_id;
pub use opack::dumps;
pub use srp::SrpClient;
pub use tlv::{decode, decode_to_dict, encode, Tlv8Item};
