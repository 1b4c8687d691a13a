//! HKDF-SHA512 (RFC 5869) with strict parameter validation.

use hkdf::Hkdf;
use sha2::Sha512;

use crate::RemoteXpcError;

/// 255 blocks of the 64-byte SHA-512 output.
pub const MAX_OUTPUT_LENGTH: usize = 255 * 64;

/// Extract-then-expand. A missing salt uses the RFC's zero block; the info
/// parameter is required.
pub fn hkdf_sha512(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: Option<&[u8]>,
    length: usize,
) -> Result<Vec<u8>, RemoteXpcError> {
    if ikm.is_empty() {
        return Err(RemoteXpcError::Cryptography(
            "Input key material (IKM) cannot be empty".into(),
        ));
    }
    let info = info.ok_or_else(|| {
        RemoteXpcError::Cryptography("HKDF info parameter is required".into())
    })?;
    if length == 0 {
        return Err(RemoteXpcError::Cryptography(
            "Output length must be greater than zero".into(),
        ));
    }
    if length > MAX_OUTPUT_LENGTH {
        return Err(RemoteXpcError::Cryptography(format!(
            "Output length cannot exceed {MAX_OUTPUT_LENGTH} bytes"
        )));
    }

    let hk = Hkdf::<Sha512>::new(salt, ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| RemoteXpcError::Cryptography("HKDF expansion failed".into()))?;
    Ok(okm)
}
