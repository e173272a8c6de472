use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::network::dispatcher::Dispatcher;
use crate::network::heartbeat::Heartbeat;
use super::codec::FrameCodec;
use super::command::Command;
use super::message::{MessageKind, ParsedMessage};

/// Lifecycle of the client's connection to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session and none being established
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Login written, waiting for the acknowledgement
    Authenticating,
    /// Logged in; commands may be issued
    Authenticated,
    /// Lost the session, waiting to try again
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// One connection to the gateway, from transport open to close.
///
/// A session is never reused: every reconnect builds a new one, including
/// its transport buffer and heartbeat timer.
pub(crate) struct Session<S> {
    id: u64,
    attempt: u32,
    state: SessionState,
    state_tx: Arc<watch::Sender<SessionState>>,
    authenticated_at: Option<DateTime<Utc>>,
    writable: bool,
    pub(crate) transport: Framed<S, FrameCodec>,
    pub(crate) heartbeat: Heartbeat,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a freshly connected transport; the caller has already
    /// published `Connecting`
    pub(crate) fn new(
        id: u64,
        attempt: u32,
        stream: S,
        codec: FrameCodec,
        heartbeat_interval: Duration,
        state_tx: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        Session {
            id,
            attempt,
            state: SessionState::Connecting,
            state_tx,
            authenticated_at: None,
            writable: true,
            transport: Framed::new(stream, codec),
            heartbeat: Heartbeat::new(heartbeat_interval),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn authenticated_at(&self) -> Option<DateTime<Utc>> {
        self.authenticated_at
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session = self.id, from = %self.state, to = %next, "Session state change");
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }

    /// Logs in and waits for the gateway's verdict.
    ///
    /// Pushed events that arrive before the acknowledgement are routed as
    /// usual. On rejection or timeout the transport is closed.
    pub(crate) async fn authenticate(
        &mut self,
        username: &str,
        secret: &str,
        deadline: Duration,
        dispatcher: &mut Dispatcher,
    ) -> Result<()> {
        self.transition(SessionState::Authenticating);
        if let Err(e) = self.send(Command::login(username, secret)).await {
            self.close().await;
            return Err(e);
        }

        let transport = &mut self.transport;
        let verdict = async {
            while let Some(frame) = transport.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => return Err(e),
                };
                let message = ParsedMessage::parse(&frame);
                match message.kind() {
                    MessageKind::AuthSuccess => return Ok(()),
                    MessageKind::AuthFailure => {
                        return Err(Error::authentication(message.reason()));
                    }
                    MessageKind::CommandResponse => {
                        debug!("Ignoring command response received before login");
                    }
                    _ => dispatcher.route(message),
                }
            }
            Err(Error::transport("connection closed during authentication"))
        };

        let outcome = match tokio::time::timeout(deadline, verdict).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::timeout(format!(
                "no login acknowledgement within {:?}",
                deadline
            ))),
        };

        match outcome {
            Ok(()) => {
                self.authenticated_at = Some(Utc::now());
                self.transition(SessionState::Authenticated);
                self.heartbeat.start();
                info!(session = self.id, attempt = self.attempt, "Authenticated with gateway");
                Ok(())
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "Gateway login failed");
                self.close().await;
                Err(e)
            }
        }
    }

    /// Writes a command if the transport is still usable.
    ///
    /// A failed write marks the transport unusable and stops the heartbeat;
    /// the read side reports the loss itself.
    pub(crate) async fn send(&mut self, command: Command) -> Result<()> {
        if !self.writable {
            return Err(Error::NotConnected);
        }
        let name = command.name();
        if let Err(e) = self.transport.send(command).await {
            warn!(session = self.id, command = name, error = %e, "Write to gateway failed");
            self.writable = false;
            self.heartbeat.stop();
            return Err(Error::transport(format!("failed to write {}: {}", name, e)));
        }
        Ok(())
    }

    /// Writes a keepalive; stops the heartbeat if the write fails
    pub(crate) async fn beat(&mut self) {
        if self.state != SessionState::Authenticated {
            self.heartbeat.stop();
            return;
        }
        if self.send(Command::Ping).await.is_err() {
            warn!(session = self.id, "Heartbeat stopped after failed write");
        }
    }

    /// Stops the heartbeat and shuts the transport down
    pub(crate) async fn close(&mut self) {
        self.heartbeat.stop();
        if self.writable {
            self.writable = false;
            if let Err(e) = self.transport.close().await {
                debug!(session = self.id, error = %e, "Error while closing transport");
            }
        }
    }

    /// Ends the session on the gateway side, then closes the transport
    pub(crate) async fn logoff(&mut self) {
        if self.state == SessionState::Authenticated && self.writable {
            let _ = self.send(Command::Logoff).await;
        }
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GatewayEvent;
    use tokio::sync::broadcast;
    use tokio_test::io::Builder;

    const LOGIN: &[u8] = b"Action: Login\r\nUsername: admin\r\nSecret: pw\r\n\r\n";

    fn state_channel() -> (Arc<watch::Sender<SessionState>>, watch::Receiver<SessionState>) {
        let (tx, rx) = watch::channel(SessionState::Disconnected);
        (Arc::new(tx), rx)
    }

    fn dispatcher() -> (Dispatcher, broadcast::Receiver<GatewayEvent>) {
        let (events, rx) = broadcast::channel(8);
        (Dispatcher::new(events), rx)
    }

    #[tokio::test]
    async fn test_login_accepted() {
        let stream = Builder::new()
            .write(LOGIN)
            .read(b"Asterisk Call Manager/1.1\r\nResponse: Success\r\nMessage: Authentication accepted\r\n\r\n")
            .build();
        let (state_tx, state_rx) = state_channel();
        let (mut dispatcher, _events) = dispatcher();
        let mut session = Session::new(1, 0, stream, FrameCodec::new(), Duration::from_secs(20), state_tx);

        session
            .authenticate("admin", "pw", Duration::from_secs(10), &mut dispatcher)
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(*state_rx.borrow(), SessionState::Authenticated);
        assert!(session.authenticated_at().is_some());
        assert!(session.heartbeat.is_running());
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let stream = Builder::new()
            .write(LOGIN)
            .read(b"Response: Error\r\nMessage: Authentication failed\r\n\r\n")
            .build();
        let (state_tx, _state_rx) = state_channel();
        let (mut dispatcher, _events) = dispatcher();
        let mut session = Session::new(1, 0, stream, FrameCodec::new(), Duration::from_secs(20), state_tx);

        let result = session
            .authenticate("admin", "pw", Duration::from_secs(10), &mut dispatcher)
            .await;

        match result {
            Err(Error::Authentication(reason)) => assert_eq!(reason, "Authentication failed"),
            other => panic!("expected authentication error, got {:?}", other),
        }
        assert!(!session.heartbeat.is_running());
        assert!(matches!(session.send(Command::Ping).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_events_before_login_reply_are_routed() {
        let stream = Builder::new()
            .write(LOGIN)
            .read(b"Event: ReceivedSMS\r\nID: 1\r\nGsmSpan: 2\r\nSender: 100\r\nContent: early\r\n\r\n")
            .read(b"Response: Success\r\n\r\n")
            .build();
        let (state_tx, _state_rx) = state_channel();
        let (mut dispatcher, mut events) = dispatcher();
        let mut session = Session::new(1, 0, stream, FrameCodec::new(), Duration::from_secs(20), state_tx);

        session
            .authenticate("admin", "pw", Duration::from_secs(10), &mut dispatcher)
            .await
            .unwrap();

        assert!(matches!(events.try_recv(), Ok(GatewayEvent::SmsReceived(_))));
    }

    #[tokio::test]
    async fn test_closed_during_login() {
        let stream = Builder::new().write(LOGIN).build();
        let (state_tx, _state_rx) = state_channel();
        let (mut dispatcher, _events) = dispatcher();
        let mut session = Session::new(1, 0, stream, FrameCodec::new(), Duration::from_secs(20), state_tx);

        let result = session
            .authenticate("admin", "pw", Duration::from_secs(10), &mut dispatcher)
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_timeout() {
        let (client, _gateway) = tokio::io::duplex(1024);
        let (state_tx, _state_rx) = state_channel();
        let (mut dispatcher, _events) = dispatcher();
        let mut session = Session::new(1, 0, client, FrameCodec::new(), Duration::from_secs(20), state_tx);

        let started = tokio::time::Instant::now();
        let result = session
            .authenticate("admin", "pw", Duration::from_secs(10), &mut dispatcher)
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!session.heartbeat.is_running());
    }

    #[test]
    fn test_new_session_does_not_republish_state() {
        let (state_tx, mut state_rx) = state_channel();
        state_tx.send_replace(SessionState::Connecting);
        state_rx.borrow_and_update();

        let (client, _gateway) = tokio::io::duplex(64);
        let session = Session::new(1, 0, client, FrameCodec::new(), Duration::from_secs(20), state_tx);

        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!state_rx.has_changed().unwrap());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Authenticated.to_string(), "authenticated");
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
    }
}
