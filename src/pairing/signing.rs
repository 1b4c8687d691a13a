//! Ed25519 identity keys and signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use crate::RemoteXpcError;

pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// Generates a fresh (seed, public key) pair.
pub fn generate_keypair() -> ([u8; PRIVATE_KEY_LENGTH], [u8; PUBLIC_KEY_LENGTH]) {
    let mut seed = [0u8; PRIVATE_KEY_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let signing_key = SigningKey::from_bytes(&seed);
    (seed, signing_key.verifying_key().to_bytes())
}

/// Signs a non-empty message with a 32-byte private key.
pub fn sign(private_key: &[u8], message: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], RemoteXpcError> {
    let seed: [u8; PRIVATE_KEY_LENGTH] = private_key.try_into().map_err(|_| {
        RemoteXpcError::Cryptography("Private key must be 32 bytes".into())
    })?;
    if message.is_empty() {
        return Err(RemoteXpcError::Cryptography(
            "Cannot sign an empty message".into(),
        ));
    }
    let signing_key = SigningKey::from_bytes(&seed);
    Ok(signing_key.sign(message).to_bytes())
}

/// Verifies a signature against a 32-byte public key.
pub fn verify(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, RemoteXpcError> {
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = public_key.try_into().map_err(|_| {
        RemoteXpcError::Cryptography("Public key must be 32 bytes".into())
    })?;
    let signature_bytes: [u8; SIGNATURE_LENGTH] = signature.try_into().map_err(|_| {
        RemoteXpcError::Cryptography("Signature must be 64 bytes".into())
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| RemoteXpcError::Cryptography("Public key is not a valid point".into()))?;
    Ok(verifying_key
        .verify(message, &Signature::from_bytes(&signature_bytes))
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_64_bytes_and_verify() {
        let (private, public) = generate_keypair();
        let signature = sign(&private, b"host identity proof").unwrap();
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert!(verify(&public, b"host identity proof", &signature).unwrap());
        assert!(!verify(&public, b"some other message", &signature).unwrap());
    }

    #[test]
    fn wrong_sized_private_keys_fail() {
        let err = sign(&[0u8; 16], b"message").unwrap_err();
        assert_eq!(err.to_string(), "Private key must be 32 bytes");
    }

    #[test]
    fn empty_messages_fail() {
        let (private, _) = generate_keypair();
        let err = sign(&private, &[]).unwrap_err();
        assert!(matches!(err, RemoteXpcError::Cryptography(_)));
    }

    #[test]
    fn keypairs_are_distinct() {
        let (a, _) = generate_keypair();
        let (b, _) = generate_keypair();
        assert_ne!(a, b);
    }
}
