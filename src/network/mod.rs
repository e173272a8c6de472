//! Gateway connection management
//!
//! This module owns the TCP session with the gateway: the background task
//! that reads and writes the socket, command correlation, keepalive and
//! reconnection. [`GatewayClient`] is the handle applications use.

pub(crate) mod backoff;
mod connection;
pub(crate) mod dispatcher;
pub(crate) mod heartbeat;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::{
    Error, GatewayConfig, GatewayEvent, Port, PortInfo, Result, SmsStatusUpdate, UssdResponse,
};
use crate::protocol::{parse_port_report, parse_ussd_response, Command, ParsedMessage, SessionState};
use self::connection::{Request, Supervisor};
use self::dispatcher::{Correlation, Dispatcher};

/// Depth of the queue between API calls and the session task
const REQUEST_QUEUE_DEPTH: usize = 32;

struct Link {
    requests: mpsc::Sender<Request>,
    task: JoinHandle<()>,
}

/// Client for one GSM gateway.
///
/// `connect` spawns a background task that owns the socket and keeps the
/// session alive, reconnecting with exponential backoff after any loss.
/// Dropping the client stops that task.
pub struct GatewayClient {
    config: Arc<GatewayConfig>,
    events: broadcast::Sender<GatewayEvent>,
    state: Arc<watch::Sender<SessionState>>,
    link: Mutex<Option<Link>>,
    /// Serializes commands answered by "the next response"
    command_gate: Mutex<()>,
}

impl GatewayClient {
    /// Creates a disconnected client
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let (state, _) = watch::channel(SessionState::Disconnected);
        Ok(GatewayClient {
            config: Arc::new(config),
            events,
            state: Arc::new(state),
            link: Mutex::new(None),
            command_gate: Mutex::new(()),
        })
    }

    /// Connects and logs in.
    ///
    /// Fails if the first attempt fails; once authenticated, later losses
    /// are recovered in the background and reported through events.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if !existing.task.is_finished() {
                return Err(Error::invalid_state("client is already connected"));
            }
        }

        let (requests, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = Supervisor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.state),
            Dispatcher::new(self.events.clone()),
            requests_rx,
        );
        let task = tokio::spawn(supervisor.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(address = %self.config.address(), "Connected to gateway");
                *link = Some(Link { requests, task });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => {
                self.state.send_replace(SessionState::Disconnected);
                Err(Error::transport("session task ended before connecting"))
            }
        }
    }

    /// Logs off and stops reconnecting; pending commands fail with
    /// `NotConnected`. Does nothing when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            // A finished task has already dropped its receiver
            let _ = link.requests.send(Request::Disconnect).await;
            if let Err(e) = link.task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
        self.state.send_replace(SessionState::Disconnected);
        Ok(())
    }

    /// Queries the status of every port
    pub async fn get_all_ports_info(&self) -> Result<Vec<PortInfo>> {
        let reply = self
            .singleton(Command::ShowSpans, self.config.command_timeout)
            .await?;
        Ok(parse_port_report(&reply))
    }

    /// Sends an SMS from `port` (1-4) and waits for its delivery status.
    ///
    /// `message_id` correlates the gateway's `UpdateSMS` event and must be
    /// unique among sends in flight. A failed delivery is an `Ok` result;
    /// check [`SmsStatusUpdate::is_sent`].
    pub async fn send_sms(
        &self,
        port: u8,
        destination: &str,
        body: &str,
        message_id: &str,
    ) -> Result<SmsStatusUpdate> {
        let command = Command::send_sms(Port::new(port)?, destination, body, message_id)?;
        let reply = self
            .request(
                command,
                Correlation::MessageId(message_id.to_string()),
                self.config.sms_timeout,
            )
            .await?;
        SmsStatusUpdate::try_from(&reply)
    }

    /// Sends a USSD code from `port` (1-4) and returns the network's reply
    pub async fn send_ussd(&self, port: u8, code: &str, timeout_secs: u64) -> Result<UssdResponse> {
        let port = Port::new(port)?;
        let command = Command::send_ussd(port, code, timeout_secs)?;
        // The gateway itself waits up to timeout_secs for the network
        let deadline = Duration::from_secs(timeout_secs)
            .checked_add(self.config.command_timeout)
            .ok_or_else(|| Error::invalid_argument("USSD timeout is too large"))?;
        let reply = self.singleton(command, deadline).await?;
        Ok(parse_ussd_response(port, &reply))
    }

    /// Subscribes to gateway events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches session state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn singleton(&self, command: Command, timeout: Duration) -> Result<ParsedMessage> {
        let _gate = self.command_gate.lock().await;
        let reply = self
            .request(command, Correlation::NextResponse, timeout)
            .await?;
        if reply.is_error_response() {
            return Err(Error::command(reply.reason()));
        }
        Ok(reply)
    }

    async fn request(
        &self,
        command: Command,
        correlation: Correlation,
        timeout: Duration,
    ) -> Result<ParsedMessage> {
        if self.state() != SessionState::Authenticated {
            return Err(Error::NotConnected);
        }
        let requests = match self.link.lock().await.as_ref() {
            Some(link) => link.requests.clone(),
            None => return Err(Error::NotConnected),
        };

        let (reply, response) = oneshot::channel();
        requests
            .send(Request::Command {
                command,
                correlation,
                timeout,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        response.await.map_err(|_| Error::NotConnected)?
    }
}
