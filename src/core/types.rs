use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Logical, user-facing gateway port (1..=4).
///
/// The device numbers its SIM slots as GSM spans 2..=5 on the wire. All
/// conversions between the two go through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Port(u8);

impl Port {
    /// Creates a port from its logical number
    pub fn new(number: u8) -> Result<Self> {
        if (1..=super::MAX_GSM_SPAN - 1).contains(&number) {
            Ok(Port(number))
        } else {
            Err(Error::InvalidPort(number))
        }
    }

    /// Maps a device GSM span number onto its logical port
    pub fn from_span(span: u8) -> Result<Self> {
        if (super::MIN_GSM_SPAN..=super::MAX_GSM_SPAN).contains(&span) {
            Ok(Port(span - 1))
        } else {
            Err(Error::protocol(format!("GSM span {} out of range", span)))
        }
    }

    /// Returns the logical port number
    pub fn number(&self) -> u8 {
        self.0
    }

    /// Returns the GSM span number used on the wire
    pub fn span(&self) -> u8 {
        self.0 + 1
    }
}

impl TryFrom<u8> for Port {
    type Error = Error;

    fn try_from(number: u8) -> Result<Self> {
        Port::new(number)
    }
}

impl From<Port> for u8 {
    fn from(port: Port) -> u8 {
        port.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of one SIM port, derived from a span report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Logical port number
    pub port: Port,
    /// GSM span number as reported by the device
    pub gsm_span: u8,
    /// Radio is up and not powered off
    pub is_up: bool,
    /// Report carries a "Power on" flag
    pub power_on: bool,
    /// Report carries a "Power off" flag
    pub power_off: bool,
    /// SIM is provisioned
    pub provisioned: bool,
    /// Raw flag text after the colon
    pub status: String,
}

/// SMS pushed by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSms {
    /// Device-assigned message id
    pub id: String,
    /// GSM span the message arrived on
    pub gsm_span: u8,
    /// Logical port the message arrived on
    pub port: Port,
    /// Originating number
    pub sender: String,
    /// Body as transmitted (URL-encoded)
    pub raw_content: String,
    /// Decoded body
    pub content: String,
    /// Part number of a multi-part message, starting at 1
    pub index: u32,
    /// Total number of parts
    pub total: u32,
    /// Receive time exactly as the device sent it
    pub received_at: String,
}

impl InboundSms {
    /// Parses the device receive time, when it uses the usual layout
    pub fn received_at_parsed(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(self.received_at.trim(), "%Y-%m-%d %H:%M:%S").ok()
    }

    /// Returns true when this is one part of a multi-part message
    pub fn is_multipart(&self) -> bool {
        self.total > 1
    }
}

/// Delivery outcome of an outbound SMS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmsStatus {
    /// The gateway handed the message to the network
    Sent,
    /// Any other status code
    Failed(String),
}

impl SmsStatus {
    /// Interprets the `Status` field of an `UpdateSMS` event
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "1" => SmsStatus::Sent,
            other => SmsStatus::Failed(other.to_string()),
        }
    }
}

/// Status event for an outbound SMS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsStatusUpdate {
    /// Client-chosen message id the send was issued with
    pub id: String,
    /// Delivery outcome
    pub status: SmsStatus,
}

impl SmsStatusUpdate {
    /// Returns true when the gateway reported the message as sent
    pub fn is_sent(&self) -> bool {
        self.status == SmsStatus::Sent
    }
}

/// Reply to a USSD request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UssdResponse {
    /// Port the code was sent from
    pub port: Port,
    /// Reply body with protocol headers removed
    pub text: String,
}

/// Notification published to subscribers of a client
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A session completed login
    Authenticated {
        /// Session identity, unique per client
        session_id: u64,
    },
    /// A session ended
    Disconnected {
        /// Session identity, unique per client
        session_id: u64,
        /// Why the session ended
        reason: String,
    },
    /// A reconnect attempt has been scheduled
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt starts
        delay: Duration,
    },
    /// An SMS arrived on one of the ports
    SmsReceived(InboundSms),
    /// The gateway reported the outcome of an outbound SMS
    SmsStatusUpdate(SmsStatusUpdate),
}

/// Configuration for a gateway client
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway host name or address
    pub host: String,
    /// Management interface port
    pub port: u16,
    /// Login user name
    pub username: String,
    /// Login secret, sent in plain text
    pub secret: String,
    /// Timeout for establishing the TCP connection
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_timeout: Duration,
    /// Timeout for the login acknowledgement
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub auth_timeout: Duration,
    /// Deadline for commands answered by the next response
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub command_timeout: Duration,
    /// Deadline for the status event of an outbound SMS
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub sms_timeout: Duration,
    /// Idle keepalive period
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// First reconnect delay
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub reconnect_base_delay: Duration,
    /// Upper bound on the reconnect delay
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub reconnect_max_delay: Duration,
    /// Largest message accepted before the stream is considered corrupt
    pub max_frame_length: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl GatewayConfig {
    /// Creates a configuration with default timings
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        GatewayConfig {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// Returns the `host:port` address to connect to
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(Error::config("username must not be empty"));
        }
        let line_break = |c: char| c == '\r' || c == '\n';
        if self.username.contains(line_break) || self.secret.contains(line_break) {
            return Err(Error::config("credentials must not contain line breaks"));
        }
        let timings = [
            ("connect_timeout", self.connect_timeout),
            ("auth_timeout", self.auth_timeout),
            ("command_timeout", self.command_timeout),
            ("sms_timeout", self.sms_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("reconnect_base_delay", self.reconnect_base_delay),
        ];
        for (name, value) in timings {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
            if value > super::MAX_CONFIG_DURATION {
                return Err(Error::config(format!(
                    "{} must not exceed {:?}",
                    name,
                    super::MAX_CONFIG_DURATION
                )));
            }
        }
        if self.reconnect_max_delay > super::MAX_CONFIG_DURATION {
            return Err(Error::config("reconnect_max_delay is too large"));
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(Error::config(
                "reconnect_base_delay must not exceed reconnect_max_delay",
            ));
        }
        if self.max_frame_length == 0 || self.event_capacity == 0 {
            return Err(Error::config(
                "max_frame_length and event_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: super::DEFAULT_PORT,
            username: String::new(),
            secret: String::new(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            sms_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            max_frame_length: super::DEFAULT_MAX_FRAME_LENGTH,
            event_capacity: 256,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("auth_timeout", &self.auth_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("sms_timeout", &self.sms_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect_base_delay", &self.reconnect_base_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .field("max_frame_length", &self.max_frame_length)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}
