//! The heartbeat keep-alive service.
//!
//! The device closes service connections when no heartbeat client answers
//! its pings, so most sessions keep one of these running. The device sends
//! "Marco" messages; this side answers each one with `{Command: "Polo"}`.
//! The loop is an explicit state machine: Idle, Running, Stopping, Stopped.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::ServiceConnection;
use crate::plist::{Dictionary, PlistValue};
use crate::RemoteXpcError;

/// RSD name of the heartbeat service inside the tunnel.
pub const SERVICE_NAME: &str = "com.apple.mobile.heartbeat.shim.remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// A heartbeat client over one service connection.
#[derive(Debug)]
pub struct HeartbeatService {
    connection: Option<ServiceConnection>,
    state: HeartbeatState,
    started_at: Option<tokio::time::Instant>,
}

impl Default for HeartbeatService {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatService {
    pub fn new() -> Self {
        Self {
            connection: None,
            state: HeartbeatState::Idle,
            started_at: None,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Checks in on the connection and marks the service running.
    ///
    /// This is the non-blocking entry point; it returns as soon as the
    /// connection is established. Drive the loop with [`run`](Self::run) or
    /// hand it off with [`spawn`](Self::spawn).
    pub async fn start(&mut self, mut connection: ServiceConnection) -> Result<(), RemoteXpcError> {
        if self.state == HeartbeatState::Running {
            return Err(RemoteXpcError::InvalidState(
                "heartbeat is already running".into(),
            ));
        }
        connection.check_in().await?;
        self.connection = Some(connection);
        self.state = HeartbeatState::Running;
        self.started_at = Some(tokio::time::Instant::now());
        Ok(())
    }

    /// Runs the recv→Polo loop inline (the blocking mode).
    ///
    /// With `interval` set, the loop terminates cleanly once that many
    /// seconds have elapsed since [`start`](Self::start). The loop also ends
    /// when the connection closes; device sleep surfaces as
    /// [`RemoteXpcError::HeartbeatSleepyTime`].
    pub async fn run(&mut self, interval: Option<u64>) -> Result<(), RemoteXpcError> {
        if self.state != HeartbeatState::Running {
            return Err(RemoteXpcError::InvalidState(
                "heartbeat is not running; call start() first".into(),
            ));
        }
        let deadline = interval.and_then(|secs| {
            self.started_at
                .map(|start| start + Duration::from_secs(secs))
        });

        loop {
            let connection = match self.connection.as_mut() {
                Some(connection) => connection,
                None => break,
            };
            let message = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, connection.read_plist()).await {
                        Ok(result) => result,
                        Err(_) => break, // requested duration elapsed
                    }
                }
                None => connection.read_plist().await,
            };
            match message {
                Ok(dict) => {
                    if dict.get("Command").and_then(|v| v.as_string()) == Some("SleepyTime") {
                        self.stop();
                        return Err(RemoteXpcError::HeartbeatSleepyTime);
                    }
                    debug!(
                        "heartbeat ping, interval {:?}",
                        dict.get("Interval").and_then(|v| v.as_unsigned())
                    );
                    self.send_polo().await?;
                }
                Err(RemoteXpcError::ConnectionClosed) => break,
                Err(RemoteXpcError::Socket(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }
        self.stop();
        Ok(())
    }

    /// Hands the running loop to a background task (the non-blocking mode).
    pub fn spawn(mut self, interval: Option<u64>) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = self.run(interval) => result,
                _ = &mut stop_rx => {
                    self.stop();
                    Ok(())
                }
            }
        });
        HeartbeatHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Sends a `{Command: "Polo"}` directly.
    pub async fn send_polo(&mut self) -> Result<(), RemoteXpcError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(RemoteXpcError::ConnectionClosed)?;
        let mut message = Dictionary::new();
        message.insert("Command".into(), "Polo".into());
        connection.send_plist(PlistValue::Dictionary(message)).await
    }

    /// Closes the connection and clears running state. Idempotent.
    pub fn stop(&mut self) {
        if self.state == HeartbeatState::Stopped {
            return;
        }
        self.state = HeartbeatState::Stopping;
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.state = HeartbeatState::Stopped;
    }
}

/// Handle to a heartbeat loop running in a background task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), RemoteXpcError>>,
}

impl HeartbeatHandle {
    /// Stops the loop and waits for it to finish.
    pub async fn stop(mut self) -> Result<(), RemoteXpcError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(_) => Ok(()), // the task was already gone
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::*;
    use tokio::io::duplex;

    fn marco(interval: u64) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("Command".into(), "Marco".into());
        dict.insert("Interval".into(), interval.into());
        dict
    }

    #[tokio::test]
    async fn blocking_loop_answers_each_marco_with_polo() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = HeartbeatService::new();

        let server = tokio::spawn(async move {
            answer_checkin(&mut server_side).await;
            for _ in 0..3 {
                write_framed(&mut server_side, marco(30)).await;
                let polo = read_framed(&mut server_side).await;
                assert_eq!(
                    polo.get("Command").and_then(|v| v.as_string()),
                    Some("Polo")
                );
            }
            // dropping the stream ends the loop
        });

        service
            .start(ServiceConnection::from_stream(Box::new(client_side)))
            .await
            .unwrap();
        assert_eq!(service.state(), HeartbeatState::Running);
        service.run(None).await.unwrap();
        server.await.unwrap();
        assert_eq!(service.state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn interval_terminates_the_loop() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = HeartbeatService::new();

        let server = tokio::spawn(async move {
            answer_checkin(&mut server_side).await;
            // never send a ping; the loop must end on its own
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_buf(&mut server_side, &mut buf).await;
        });

        service
            .start(ServiceConnection::from_stream(Box::new(client_side)))
            .await
            .unwrap();
        service.run(Some(0)).await.unwrap();
        assert_eq!(service.state(), HeartbeatState::Stopped);
        server.abort();
    }

    #[tokio::test]
    async fn sleepy_time_surfaces_as_a_typed_error() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = HeartbeatService::new();

        let server = tokio::spawn(async move {
            answer_checkin(&mut server_side).await;
            let mut dict = Dictionary::new();
            dict.insert("Command".into(), "SleepyTime".into());
            write_framed(&mut server_side, dict).await;
        });

        service
            .start(ServiceConnection::from_stream(Box::new(client_side)))
            .await
            .unwrap();
        let err = service.run(None).await.unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, RemoteXpcError::HeartbeatSleepyTime));
        assert_eq!(service.state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_request() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = HeartbeatService::new();

        let server = tokio::spawn(async move {
            answer_checkin(&mut server_side).await;
            write_framed(&mut server_side, marco(30)).await;
            let _polo = read_framed(&mut server_side).await;
            // keep the connection open until the client stops
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_buf(&mut server_side, &mut buf).await;
        });

        service
            .start(ServiceConnection::from_stream(Box::new(client_side)))
            .await
            .unwrap();
        let handle = service.spawn(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn send_polo_works_directly() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let mut service = HeartbeatService::new();

        let server = tokio::spawn(async move {
            answer_checkin(&mut server_side).await;
            let polo = read_framed(&mut server_side).await;
            assert_eq!(
                polo.get("Command").and_then(|v| v.as_string()),
                Some("Polo")
            );
        });

        service
            .start(ServiceConnection::from_stream(Box::new(client_side)))
            .await
            .unwrap();
        service.send_polo().await.unwrap();
        server.await.unwrap();

        service.stop();
        service.stop();
        assert_eq!(service.state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn run_before_start_is_a_state_error() {
        let mut service = HeartbeatService::new();
        let err = service.run(None).await.unwrap_err();
        assert!(matches!(err, RemoteXpcError::InvalidState(_)));
    }
}
