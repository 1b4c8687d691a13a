//! The notification proxy service.
//!
//! Observe system notifications and post host-side ones. The device only
//! relays notifications that were observed first, so `observe` must be
//! called before posting or pulling from the stream.

use std::time::Duration;

use async_stream::stream;
use futures::Stream;

use super::ServiceConnection;
use crate::plist::{Dictionary, PlistValue};
use crate::RemoteXpcError;

/// RSD name of the notification proxy inside the tunnel.
pub const SERVICE_NAME: &str = "com.apple.mobile.notification_proxy.shim.remote";

/// Client for observing and posting notifications.
#[derive(Debug)]
pub struct NotificationProxyService {
    connection: ServiceConnection,
    observed: bool,
}

impl NotificationProxyService {
    /// Checks in on an established service connection.
    pub async fn new(mut connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        connection.check_in().await?;
        Ok(Self {
            connection,
            observed: false,
        })
    }

    /// Registers interest in a notification by name.
    pub async fn observe(&mut self, name: impl Into<String>) -> Result<(), RemoteXpcError> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), "ObserveNotification".into());
        request.insert("Name".into(), name.into().into());
        self.connection
            .send_plist(PlistValue::Dictionary(request))
            .await?;
        self.observed = true;
        Ok(())
    }

    /// Posts a notification to the device.
    pub async fn post(&mut self, name: impl Into<String>) -> Result<(), RemoteXpcError> {
        self.require_observed("post")?;
        let mut request = Dictionary::new();
        request.insert("Command".into(), "PostNotification".into());
        request.insert("Name".into(), name.into().into());
        self.connection
            .send_plist(PlistValue::Dictionary(request))
            .await
    }

    /// Waits for the next relayed notification.
    pub async fn expect_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.require_observed("expect_notification")?;
        self.connection.read_plist_timeout(timeout).await
    }

    /// A lazy stream of notifications that ends when the connection closes.
    pub fn expect_notifications(
        mut self,
    ) -> Result<impl Stream<Item = Result<Dictionary, RemoteXpcError>>, RemoteXpcError> {
        self.require_observed("expect_notifications")?;
        Ok(stream! {
            loop {
                match self.connection.read_plist().await {
                    Ok(dict) => yield Ok(dict),
                    Err(RemoteXpcError::ConnectionClosed) => break,
                    Err(RemoteXpcError::Socket(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    /// Closes the underlying connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.connection.close();
    }

    fn require_observed(&self, operation: &str) -> Result<(), RemoteXpcError> {
        if self.observed {
            Ok(())
        } else {
            Err(RemoteXpcError::InvalidState(format!(
                "must call observe() before {operation}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::*;
    use futures::StreamExt;
    use tokio::io::duplex;

    fn relay(name: &str) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("Command".into(), "RelayNotification".into());
        dict.insert("Name".into(), name.into());
        dict
    }

    async fn checked_in(
        server_side: &mut (impl crate::ReadWrite + ?Sized),
        client_side: Box<dyn crate::ReadWrite>,
    ) -> NotificationProxyService {
        let connection = ServiceConnection::from_stream(client_side);
        let (service, ()) = tokio::join!(
            async { NotificationProxyService::new(connection).await.unwrap() },
            answer_checkin(server_side),
        );
        service
    }

    #[tokio::test]
    async fn post_requires_observe_first() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = checked_in(&mut server_side, Box::new(client_side)).await;

        let err = service
            .post("com.apple.itunes-mobdev.syncWillStart")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::InvalidState(_)));
        assert_eq!(
            err.to_string(),
            "must call observe() before post"
        );

        service
            .observe("com.apple.mobile.application_installed")
            .await
            .unwrap();
        service
            .post("com.apple.itunes-mobdev.syncWillStart")
            .await
            .unwrap();

        let observe = read_framed(&mut server_side).await;
        assert_eq!(
            observe.get("Command").and_then(|v| v.as_string()),
            Some("ObserveNotification")
        );
        let post = read_framed(&mut server_side).await;
        assert_eq!(
            post.get("Command").and_then(|v| v.as_string()),
            Some("PostNotification")
        );
    }

    #[tokio::test]
    async fn expect_notification_returns_or_times_out() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = checked_in(&mut server_side, Box::new(client_side)).await;
        service.observe("com.apple.mobile.lockdown.device_name_changed").await.unwrap();
        let _observe = read_framed(&mut server_side).await;

        write_framed(
            &mut server_side,
            relay("com.apple.mobile.lockdown.device_name_changed"),
        )
        .await;
        let notification = service
            .expect_notification(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            notification.get("Name").and_then(|v| v.as_string()),
            Some("com.apple.mobile.lockdown.device_name_changed")
        );

        let err = service
            .expect_notification(Duration::from_millis(25))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::Timeout(25)));
    }

    #[tokio::test]
    async fn stream_ends_when_the_connection_closes() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = checked_in(&mut server_side, Box::new(client_side)).await;
        service.observe("com.apple.mobile.application_installed").await.unwrap();
        let _observe = read_framed(&mut server_side).await;

        let server = tokio::spawn(async move {
            write_framed(&mut server_side, relay("first")).await;
            write_framed(&mut server_side, relay("second")).await;
            // dropping server_side closes the stream
        });

        let stream = service.expect_notifications().unwrap();
        let collected: Vec<_> = stream.collect().await;
        server.await.unwrap();

        assert_eq!(collected.len(), 2);
        let names: Vec<_> = collected
            .into_iter()
            .map(|d| {
                d.unwrap()
                    .get("Name")
                    .and_then(|v| v.as_string())
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[tokio::test]
    async fn stream_requires_observe() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let service = checked_in(&mut server_side, Box::new(client_side)).await;
        assert!(service.expect_notifications().is_err());
    }
}
