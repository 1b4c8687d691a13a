//! ChaCha20-Poly1305 AEAD for the encrypted pairing TLVs.

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};

use crate::RemoteXpcError;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

/// Seals `plaintext`; the result is `ciphertext || 16-byte tag`.
pub fn encrypt(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, RemoteXpcError> {
    let cipher = cipher_for(key, nonce)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: aad.unwrap_or(&[]),
            },
        )
        .map_err(|_| RemoteXpcError::Cryptography("Encryption failed".into()))
}

/// Opens `ciphertext || tag`, failing on any authentication mismatch.
pub fn decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, RemoteXpcError> {
    if ciphertext.len() < TAG_LENGTH {
        return Err(RemoteXpcError::Cryptography(
            "Ciphertext is too short".into(),
        ));
    }
    let cipher = cipher_for(key, nonce)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: aad.unwrap_or(&[]),
            },
        )
        .map_err(|_| RemoteXpcError::Cryptography("Authentication failed".into()))
}

fn cipher_for(key: &[u8], nonce: &[u8]) -> Result<ChaCha20Poly1305, RemoteXpcError> {
    if key.len() != KEY_LENGTH {
        return Err(RemoteXpcError::Cryptography("Key must be 32 bytes".into()));
    }
    if nonce.len() != NONCE_LENGTH {
        return Err(RemoteXpcError::Cryptography("Nonce must be 12 bytes".into()));
    }
    Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
}
