//! The mobile image mounter.
//!
//! Personalized (iOS 17+) developer images upload in two steps: a
//! `ReceiveBytes` announcement followed by the raw image bytes, then a
//! `MountImage` carrying the personalization manifest and trust cache. The
//! query commands cover the nonce/identifier dance needed to build that
//! manifest. Image fixtures for tooling live in the directory named by the
//! `MOUNTER_IMAGE_DIR` environment variable.

use std::time::Duration;

use tracing::debug;

use super::ServiceConnection;
use crate::plist::{Dictionary, PlistValue};
use crate::RemoteXpcError;

/// RSD name of the image mounter inside the tunnel.
pub const SERVICE_NAME: &str = "com.apple.mobile.mobile_image_mounter.shim.remote";

/// Image type used by personalized mounts.
pub const PERSONALIZED_IMAGE_TYPE: &str = "Personalized";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the image mounter's lockdown-style plist session.
#[derive(Debug)]
pub struct ImageMounterService {
    connection: ServiceConnection,
}

impl ImageMounterService {
    /// Checks in on an established service connection.
    pub async fn new(mut connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        connection.check_in().await?;
        Ok(Self { connection })
    }

    /// Lists currently mounted images.
    pub async fn copy_devices(&mut self) -> Result<Vec<PlistValue>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "CopyDevices".into());
        let mut response = self.request(request).await?;
        match response.shift_remove("EntryList") {
            Some(PlistValue::Array(entries)) => Ok(entries),
            _ => Err(RemoteXpcError::MissingField("EntryList")),
        }
    }

    /// Looks up the signatures of mounted images of one type.
    pub async fn lookup(
        &mut self,
        image_type: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "LookupImage".into());
        request.insert(
            "ImageType".into(),
            image_type.unwrap_or(PERSONALIZED_IMAGE_TYPE).into(),
        );
        let mut response = self.request(request).await?;
        match response.shift_remove("ImageSignature") {
            Some(PlistValue::Array(signatures)) => Ok(signatures
                .into_iter()
                .filter_map(PlistValue::into_data)
                .collect()),
            Some(PlistValue::Data(signature)) => Ok(vec![signature]),
            _ => Ok(Vec::new()),
        }
    }

    /// Whether a personalized image is currently mounted.
    pub async fn is_personalized_image_mounted(&mut self) -> Result<bool, RemoteXpcError> {
        Ok(!self.lookup(Some(PERSONALIZED_IMAGE_TYPE)).await?.is_empty())
    }

    /// Uploads and mounts a personalized image.
    ///
    /// `manifest` is the personalization manifest that signs the image for
    /// this device; `trust_cache` comes from the same image bundle.
    pub async fn mount(
        &mut self,
        image: &[u8],
        manifest: Vec<u8>,
        trust_cache: Vec<u8>,
    ) -> Result<(), RemoteXpcError> {
        self.upload_image(PERSONALIZED_IMAGE_TYPE, image, manifest.clone())
            .await?;

        let mut request = Dictionary::new();
        request.insert("Command".into(), "MountImage".into());
        request.insert("ImageType".into(), PERSONALIZED_IMAGE_TYPE.into());
        request.insert("ImageSignature".into(), manifest.into());
        request.insert("ImageTrustCache".into(), trust_cache.into());
        let response = self.request(request).await?;
        expect_status(&response, "Complete")
    }

    /// Unmounts the image mounted at `mount_path`.
    pub async fn unmount_image(
        &mut self,
        mount_path: impl Into<String>,
    ) -> Result<(), RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "UnmountImage".into());
        request.insert("MountPath".into(), mount_path.into().into());
        let response = self.request(request).await?;
        expect_status(&response, "Complete")
    }

    /// Reads the device's personalization nonce.
    pub async fn query_nonce(
        &mut self,
        personalized_image_type: Option<&str>,
    ) -> Result<Vec<u8>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "QueryNonce".into());
        if let Some(image_type) = personalized_image_type {
            request.insert("PersonalizedImageType".into(), image_type.into());
        }
        let mut response = self.request(request).await?;
        match response.shift_remove("PersonalizationNonce") {
            Some(PlistValue::Data(nonce)) => Ok(nonce),
            _ => Err(RemoteXpcError::MissingField("PersonalizationNonce")),
        }
    }

    /// Reads the chip/board/ECID identifiers personalization needs.
    pub async fn query_personalization_identifiers(
        &mut self,
    ) -> Result<Dictionary, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "QueryPersonalizationIdentifiers".into());
        let mut response = self.request(request).await?;
        match response.shift_remove("PersonalizationIdentifiers") {
            Some(PlistValue::Dictionary(identifiers)) => Ok(identifiers),
            _ => Err(RemoteXpcError::MissingField("PersonalizationIdentifiers")),
        }
    }

    /// Fetches the stored personalization manifest for an image.
    pub async fn query_personalization_manifest(
        &mut self,
        image_type: &str,
        signature: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "QueryPersonalizationManifest".into());
        request.insert("PersonalizedImageType".into(), image_type.into());
        request.insert("ImageType".into(), image_type.into());
        request.insert("ImageSignature".into(), signature.into());
        let mut response = self.request(request).await?;
        match response.shift_remove("ImageSignature") {
            Some(PlistValue::Data(manifest)) => Ok(manifest),
            _ => Err(RemoteXpcError::NotFound),
        }
    }

    /// Whether developer mode is enabled on the device.
    pub async fn query_developer_mode_status(&mut self) -> Result<bool, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "QueryDeveloperModeStatus".into());
        let response = self.request(request).await?;
        response
            .get("DeveloperModeStatus")
            .and_then(|v| v.as_boolean())
            .ok_or(RemoteXpcError::MissingField("DeveloperModeStatus"))
    }

    /// Closes the underlying connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.connection.close();
    }

    async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: Vec<u8>,
    ) -> Result<(), RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "ReceiveBytes".into());
        request.insert("ImageType".into(), image_type.into());
        request.insert("ImageSize".into(), (image.len() as u64).into());
        request.insert("ImageSignature".into(), signature.into());
        let response = self.request(request).await?;
        expect_status(&response, "ReceiveBytesAck")?;

        debug!("uploading {} image bytes", image.len());
        self.connection.send_raw(image).await?;

        let response = self.connection.read_plist_timeout(REQUEST_TIMEOUT).await?;
        expect_status(&response, "Complete")
    }

    async fn request(&mut self, request: Dictionary) -> Result<Dictionary, RemoteXpcError> {
        let response = self
            .connection
            .send_plist_request(request, REQUEST_TIMEOUT)
            .await?;
        if let Some(error) = response.get("Error").and_then(|v| v.as_string()) {
            let detail = response
                .get("DetailedError")
                .and_then(|v| v.as_string())
                .unwrap_or(error);
            return Err(RemoteXpcError::DeviceError(detail.to_string()));
        }
        Ok(response)
    }
}

fn expect_status(response: &Dictionary, expected: &str) -> Result<(), RemoteXpcError> {
    match response.get("Status").and_then(|v| v.as_string()) {
        Some(status) if status == expected => Ok(()),
        Some(status) => Err(RemoteXpcError::DeviceError(status.to_string())),
        None => Err(RemoteXpcError::MissingField("Status")),
    }
}
