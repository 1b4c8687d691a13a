//! Deterministic host-id derivation.
//!
//! Pairing identifies the host by a UUID derived from its hostname, so the
//! same machine always presents the same identity.

use uuid::Uuid;

use crate::RemoteXpcError;

/// UUIDv3 of the hostname in the DNS namespace, uppercase.
pub fn derive_host_id(hostname: &str) -> Result<String, RemoteXpcError> {
    if hostname.trim().is_empty() {
        return Err(RemoteXpcError::InvalidState(
            "hostname must be a non-empty string".into(),
        ));
    }
    let uuid = Uuid::new_v3(&Uuid::NAMESPACE_DNS, hostname.as_bytes());
    Ok(uuid.to_string().to_uppercase())
}
