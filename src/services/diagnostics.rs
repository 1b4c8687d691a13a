//! The diagnostics relay.
//!
//! Queries IORegistry and MobileGestalt and drives the power verbs. Every
//! reply carries a `Status` field; anything but `Success` fails the call.

use std::time::Duration;

use super::ServiceConnection;
use crate::plist::{Dictionary, PlistValue};
use crate::RemoteXpcError;

/// RSD name of the diagnostics relay inside the tunnel.
pub const SERVICE_NAME: &str = "com.apple.mobile.diagnostics_relay.shim.remote";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the diagnostics relay.
#[derive(Debug)]
pub struct DiagnosticsService {
    connection: ServiceConnection,
}

impl DiagnosticsService {
    /// Checks in on an established service connection.
    pub async fn new(mut connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        connection.check_in().await?;
        Ok(Self { connection })
    }

    /// Requests a subtree of the IO registry.
    pub async fn ioregistry(
        &mut self,
        current_plane: Option<&str>,
        entry_name: Option<&str>,
        entry_class: Option<&str>,
    ) -> Result<Option<Dictionary>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Request".into(), "IORegistry".into());
        if let Some(plane) = current_plane {
            request.insert("CurrentPlane".into(), plane.into());
        }
        if let Some(name) = entry_name {
            request.insert("EntryName".into(), name.into());
        }
        if let Some(class) = entry_class {
            request.insert("EntryClass".into(), class.into());
        }

        let mut response = self.request(request).await?;
        Ok(response
            .shift_remove("Diagnostics")
            .and_then(PlistValue::into_dictionary)
            .and_then(|mut d| d.shift_remove("IORegistry"))
            .and_then(PlistValue::into_dictionary))
    }

    /// Requests MobileGestalt keys; `None` asks for everything available.
    pub async fn mobilegestalt(
        &mut self,
        keys: Option<Vec<String>>,
    ) -> Result<Option<Dictionary>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Request".into(), "MobileGestalt".into());
        if let Some(keys) = keys {
            request.insert(
                "MobileGestaltKeys".into(),
                PlistValue::Array(keys.into_iter().map(PlistValue::String).collect()),
            );
        }

        let mut response = self.request(request).await?;
        Ok(response
            .shift_remove("Diagnostics")
            .and_then(PlistValue::into_dictionary))
    }

    /// Battery gas gauge information.
    pub async fn gas_gauge(&mut self) -> Result<Option<Dictionary>, RemoteXpcError> {
        self.simple_diagnostics("GasGauge").await
    }

    /// Everything the relay will volunteer at once.
    pub async fn all(&mut self) -> Result<Option<Dictionary>, RemoteXpcError> {
        self.simple_diagnostics("All").await
    }

    pub async fn restart(&mut self) -> Result<(), RemoteXpcError> {
        self.power_verb("Restart").await
    }

    pub async fn shutdown(&mut self) -> Result<(), RemoteXpcError> {
        self.power_verb("Shutdown").await
    }

    pub async fn sleep(&mut self) -> Result<(), RemoteXpcError> {
        self.power_verb("Sleep").await
    }

    /// Closes the underlying connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.connection.close();
    }

    async fn simple_diagnostics(
        &mut self,
        request_name: &str,
    ) -> Result<Option<Dictionary>, RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Request".into(), request_name.into());
        let mut response = self.request(request).await?;
        Ok(response
            .shift_remove("Diagnostics")
            .and_then(PlistValue::into_dictionary))
    }

    async fn power_verb(&mut self, verb: &str) -> Result<(), RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Request".into(), verb.into());
        self.request(request).await?;
        Ok(())
    }

    async fn request(&mut self, request: Dictionary) -> Result<Dictionary, RemoteXpcError> {
        let response = self
            .connection
            .send_plist_request(request, REQUEST_TIMEOUT)
            .await?;
        match response.get("Status").and_then(|v| v.as_string()) {
            Some("Success") => Ok(response),
            Some(other) => Err(RemoteXpcError::DeviceError(other.to_string())),
            None => Err(RemoteXpcError::MissingField("Status")),
        }
    }
}
