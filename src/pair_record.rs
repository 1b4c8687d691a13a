//! The host-side secret bundle that authorizes a lockdown session.
//!
//! Pair records come back from the muxer as an inner plist; certificate and
//! key fields arrive either as raw PEM bytes or as base64-encoded PEM,
//! depending on which tool wrote the record. The record is held in memory
//! for the life of a tunnel and never persisted by this library.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use tracing::warn;

use crate::plist::{parse_plist, Dictionary, PlistValue};
use crate::RemoteXpcError;

/// Long-lived pairing material for one device.
#[derive(Debug, Clone)]
pub struct PairRecord {
    pub host_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub device_certificate: X509,
    pub root_certificate: X509,
    pub root_private_key: Option<PKey<Private>>,
    pub host_id: String,
    pub system_buid: String,
    pub wifi_mac_address: Option<String>,
    pub escrow_bag: Option<Vec<u8>>,
}

impl PairRecord {
    /// Parses a pair record from a raw plist blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RemoteXpcError> {
        let value = parse_plist(bytes)?;
        Self::from_plist(&value)
    }

    /// Parses a pair record from an already-decoded plist value.
    pub fn from_plist(value: &PlistValue) -> Result<Self, RemoteXpcError> {
        let dict = value
            .as_dictionary()
            .ok_or(RemoteXpcError::UnexpectedResponse)?;

        let host_certificate = X509::from_pem(&pem_field(dict, "HostCertificate")?)
            .map_err(log_pem_error("HostCertificate"))?;
        let host_private_key = PKey::private_key_from_pem(&pem_field(dict, "HostPrivateKey")?)
            .map_err(log_pem_error("HostPrivateKey"))?;
        let device_certificate = X509::from_pem(&pem_field(dict, "DeviceCertificate")?)
            .map_err(log_pem_error("DeviceCertificate"))?;
        let root_certificate = X509::from_pem(&pem_field(dict, "RootCertificate")?)
            .map_err(log_pem_error("RootCertificate"))?;
        let root_private_key = match pem_field(dict, "RootPrivateKey") {
            Ok(pem) => Some(
                PKey::private_key_from_pem(&pem).map_err(log_pem_error("RootPrivateKey"))?,
            ),
            Err(_) => None,
        };

        let host_id = string_field(dict, "HostID")?;
        let system_buid = string_field(dict, "SystemBUID")?;
        let wifi_mac_address = dict
            .get("WiFiMACAddress")
            .and_then(|v| v.as_string())
            .map(str::to_string);
        let escrow_bag = dict
            .get("EscrowBag")
            .and_then(|v| v.as_data())
            .map(<[u8]>::to_vec);

        Ok(Self {
            host_certificate,
            host_private_key,
            device_certificate,
            root_certificate,
            root_private_key,
            host_id,
            system_buid,
            wifi_mac_address,
            escrow_bag,
        })
    }
}

fn string_field(dict: &Dictionary, key: &'static str) -> Result<String, RemoteXpcError> {
    dict.get(key)
        .and_then(|v| v.as_string())
        .map(str::to_string)
        .ok_or(RemoteXpcError::MissingField(key))
}

/// Extracts certificate material, accepting raw PEM bytes or base64 PEM.
fn pem_field(dict: &Dictionary, key: &'static str) -> Result<Vec<u8>, RemoteXpcError> {
    let value = dict.get(key).ok_or(RemoteXpcError::MissingField(key))?;
    let bytes = match value {
        PlistValue::Data(d) => d.clone(),
        PlistValue::String(s) => s.as_bytes().to_vec(),
        _ => return Err(RemoteXpcError::MissingField(key)),
    };
    if bytes.starts_with(b"-----BEGIN") {
        return Ok(bytes);
    }
    // some tools store the PEM itself base64-encoded
    let compact: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    match B64.decode(&compact) {
        Ok(decoded) if decoded.starts_with(b"-----BEGIN") => Ok(decoded),
        _ => Ok(bytes),
    }
}

fn log_pem_error(
    field: &'static str,
) -> impl FnOnce(openssl::error::ErrorStack) -> RemoteXpcError {
    move |e| {
        warn!("Unable to parse {field} from pair record: {e:?}");
        RemoteXpcError::TlsBuilder(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::{asn1::Asn1Time, hash::MessageDigest, rsa::Rsa, x509::X509Builder};

    fn test_keypair() -> (Vec<u8>, Vec<u8>) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut builder = X509Builder::new().unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        (
            cert.to_pem().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap(),
        )
    }

    fn record_dict(cert: &[u8], key: &[u8], encode: bool) -> Dictionary {
        let wrap = |pem: &[u8]| -> PlistValue {
            if encode {
                PlistValue::String(B64.encode(pem))
            } else {
                PlistValue::Data(pem.to_vec())
            }
        };
        let mut dict = Dictionary::new();
        dict.insert("HostCertificate".into(), wrap(cert));
        dict.insert("HostPrivateKey".into(), wrap(key));
        dict.insert("DeviceCertificate".into(), wrap(cert));
        dict.insert("RootCertificate".into(), wrap(cert));
        dict.insert("RootPrivateKey".into(), wrap(key));
        dict.insert(
            "HostID".into(),
            "E7A5C345-1F3E-4DA8-8E3F-5B0C0A1D2E3F".into(),
        );
        dict.insert("SystemBUID".into(), "5C1E0F1B-9A9E-4F5B-A3B7-7C8D9E0F1A2B".into());
        dict.insert("WiFiMACAddress".into(), "aa:bb:cc:dd:ee:ff".into());
        dict
    }

    #[test]
    fn parses_raw_pem_fields() {
        let (cert, key) = test_keypair();
        let dict = record_dict(&cert, &key, false);
        let record = PairRecord::from_plist(&PlistValue::Dictionary(dict)).unwrap();
        assert_eq!(record.host_id, "E7A5C345-1F3E-4DA8-8E3F-5B0C0A1D2E3F");
        assert_eq!(record.wifi_mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(record.root_private_key.is_some());
        assert!(record.escrow_bag.is_none());
    }

    #[test]
    fn parses_base64_encoded_pem_fields() {
        let (cert, key) = test_keypair();
        let dict = record_dict(&cert, &key, true);
        let record = PairRecord::from_plist(&PlistValue::Dictionary(dict)).unwrap();
        assert_eq!(record.system_buid, "5C1E0F1B-9A9E-4F5B-A3B7-7C8D9E0F1A2B");
    }

    #[test]
    fn missing_host_id_is_an_error() {
        let (cert, key) = test_keypair();
        let mut dict = record_dict(&cert, &key, false);
        dict.shift_remove("HostID");
        let err = PairRecord::from_plist(&PlistValue::Dictionary(dict)).unwrap_err();
        assert!(matches!(err, RemoteXpcError::MissingField("HostID")));
    }

    #[test]
    fn round_trips_through_inner_plist_blob() {
        let (cert, key) = test_keypair();
        let dict = record_dict(&cert, &key, false);
        let blob = crate::plist::xml::to_xml(&PlistValue::Dictionary(dict));
        let record = PairRecord::from_bytes(blob.as_bytes()).unwrap();
        assert_eq!(record.host_id, "E7A5C345-1F3E-4DA8-8E3F-5B0C0A1D2E3F");
    }
}
