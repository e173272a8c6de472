use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::core::{Error, GatewayConfig, GatewayEvent, Result};
use crate::protocol::{Command, FrameCodec, ParsedMessage, Session, SessionState};
use super::backoff::Backoff;
use super::dispatcher::{Correlation, Dispatcher, Reply};

/// Work handed from the client to its session task
pub(crate) enum Request {
    /// Write a command and complete `reply` once it is answered
    Command {
        command: Command,
        correlation: Correlation,
        timeout: Duration,
        reply: Reply,
    },
    /// Log off and stop
    Disconnect,
}

/// Why a steady-state session ended
enum SessionEnd {
    /// The client asked to disconnect, or went away
    Shutdown,
    /// The transport failed or the gateway closed it
    Lost(Error),
}

/// Owns the gateway socket for one client.
///
/// Runs as a single task: every read, write, timer and command goes
/// through its select loop, so the socket needs no lock.
pub(crate) struct Supervisor {
    config: Arc<GatewayConfig>,
    state: Arc<watch::Sender<SessionState>>,
    dispatcher: Dispatcher,
    requests: mpsc::Receiver<Request>,
    backoff: Backoff,
    next_session_id: u64,
}

impl Supervisor {
    pub(crate) fn new(
        config: Arc<GatewayConfig>,
        state: Arc<watch::Sender<SessionState>>,
        dispatcher: Dispatcher,
        requests: mpsc::Receiver<Request>,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay);
        Supervisor {
            config,
            state,
            dispatcher,
            requests,
            backoff,
            next_session_id: 0,
        }
    }

    /// Connects, reports the outcome through `ready`, then keeps the
    /// session alive until the client disconnects
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        let mut session = match self.establish().await {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                self.state.send_replace(SessionState::Disconnected);
                let _ = ready.send(Err(e));
                return;
            }
            None => {
                self.state.send_replace(SessionState::Disconnected);
                let _ = ready.send(Err(Error::invalid_state("connect abandoned")));
                return;
            }
        };
        self.on_authenticated(session.id());
        let _ = ready.send(Ok(()));

        loop {
            match self.drive(&mut session).await {
                SessionEnd::Shutdown => {
                    self.shutdown(&mut session).await;
                    return;
                }
                SessionEnd::Lost(reason) => {
                    let uptime = session
                        .authenticated_at()
                        .map(|at| (Utc::now() - at).num_seconds())
                        .unwrap_or_default();
                    warn!(session = session.id(), uptime_secs = uptime, error = %reason, "Gateway connection lost");
                    session.close().await;
                    self.dispatcher
                        .pending()
                        .fail_all(|| Error::transport("connection to gateway lost"));
                    self.state.send_replace(SessionState::Reconnecting);
                    self.dispatcher.publish(GatewayEvent::Disconnected {
                        session_id: session.id(),
                        reason: reason.to_string(),
                    });
                }
            }

            session = match self.reconnect().await {
                Some(next) => next,
                None => {
                    self.state.send_replace(SessionState::Disconnected);
                    return;
                }
            };
        }
    }

    fn on_authenticated(&mut self, session_id: u64) {
        self.backoff.reset();
        self.dispatcher
            .publish(GatewayEvent::Authenticated { session_id });
    }

    /// Opens a transport and logs in, rejecting commands meanwhile.
    /// Returns `None` if the client asked to stop.
    async fn establish(&mut self) -> Option<Result<Session<TcpStream>>> {
        self.next_session_id += 1;
        let open = open_session(
            &self.config,
            self.next_session_id,
            self.backoff.attempt(),
            Arc::clone(&self.state),
            &mut self.dispatcher,
        );
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => return Some(result),
                request = self.requests.recv() => match request {
                    Some(Request::Command { reply, .. }) => {
                        let _ = reply.send(Err(Error::NotConnected));
                    }
                    Some(Request::Disconnect) | None => return None,
                },
            }
        }
    }

    /// Retries with backoff until a session authenticates.
    /// Returns `None` on shutdown or on a credential rejection.
    async fn reconnect(&mut self) -> Option<Session<TcpStream>> {
        loop {
            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            self.state.send_replace(SessionState::Reconnecting);
            self.dispatcher
                .publish(GatewayEvent::Reconnecting { attempt, delay });

            if !self.wait(delay).await {
                return None;
            }

            match self.establish().await? {
                Ok(session) => {
                    info!(session = session.id(), attempt, "Reconnected to gateway");
                    self.on_authenticated(session.id());
                    return Some(session);
                }
                Err(e) if !e.is_transient() => {
                    error!(error = %e, "Giving up reconnecting");
                    self.dispatcher.publish(GatewayEvent::Disconnected {
                        session_id: self.next_session_id,
                        reason: e.to_string(),
                    });
                    return None;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    /// Sleeps for `delay` while rejecting commands; false on shutdown
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                request = self.requests.recv() => match request {
                    Some(Request::Command { reply, .. }) => {
                        let _ = reply.send(Err(Error::NotConnected));
                    }
                    Some(Request::Disconnect) | None => return false,
                },
            }
        }
    }

    /// Steady state of an authenticated session
    async fn drive<S>(&mut self, session: &mut Session<S>) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let has_pending = self.dispatcher.has_pending();
            tokio::select! {
                frame = session.transport.next() => match frame {
                    Some(Ok(frame)) => {
                        trace!(session = session.id(), frame = %String::from_utf8_lossy(&frame), "Frame received");
                        self.dispatcher.route(ParsedMessage::parse(&frame));
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e),
                    None => return SessionEnd::Lost(Error::transport("connection closed by gateway")),
                },
                request = self.requests.recv() => match request {
                    Some(Request::Command { command, correlation, timeout, reply }) => {
                        self.issue(session, command, correlation, timeout, reply).await;
                    }
                    Some(Request::Disconnect) | None => return SessionEnd::Shutdown,
                },
                Some(expired) = self.dispatcher.pending().next_expired(), if has_pending => {
                    self.dispatcher.pending().expire(expired);
                }
                _ = session.heartbeat.tick() => session.beat().await,
            }
        }
    }

    async fn issue<S>(
        &mut self,
        session: &mut Session<S>,
        command: Command,
        correlation: Correlation,
        timeout: Duration,
        reply: Reply,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if session.state() != SessionState::Authenticated {
            let _ = reply.send(Err(Error::NotConnected));
            return;
        }
        let name = command.name();
        if !self
            .dispatcher
            .pending()
            .register(correlation.clone(), name, timeout, reply)
        {
            return;
        }
        debug!(session = session.id(), command = name, ?correlation, "Issuing command");
        if let Err(e) = session.send(command).await {
            self.dispatcher.pending().resolve(&correlation, Err(e));
        }
    }

    async fn shutdown<S>(&mut self, session: &mut Session<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(session = session.id(), "Disconnecting from gateway");
        session.logoff().await;
        self.dispatcher.pending().fail_all(|| Error::NotConnected);
        self.state.send_replace(SessionState::Disconnected);
        self.dispatcher.publish(GatewayEvent::Disconnected {
            session_id: session.id(),
            reason: "disconnected by client".to_string(),
        });
    }
}

async fn open_session(
    config: &GatewayConfig,
    id: u64,
    attempt: u32,
    state: Arc<watch::Sender<SessionState>>,
    dispatcher: &mut Dispatcher,
) -> Result<Session<TcpStream>> {
    state.send_replace(SessionState::Connecting);
    let address = config.address();
    debug!(session = id, address = %address, "Connecting to gateway");

    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::timeout(format!("connecting to {}", address)))?
        .map_err(|e| Error::transport(format!("failed to connect to {}: {}", address, e)))?;
    configure_socket(&stream, config.heartbeat_interval);

    let mut session = Session::new(
        id,
        attempt,
        stream,
        FrameCodec::with_max_length(config.max_frame_length),
        config.heartbeat_interval,
        state,
    );
    session
        .authenticate(&config.username, &config.secret, config.auth_timeout, dispatcher)
        .await?;
    Ok(session)
}

fn configure_socket(stream: &TcpStream, idle: Duration) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to disable Nagle");
    }
    let keepalive = TcpKeepalive::new().with_time(idle);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to enable TCP keepalive");
    }
}
