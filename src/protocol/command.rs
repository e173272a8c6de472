use std::fmt;

use crate::core::{Error, Port, Result, MAX_USSD_TIMEOUT_SECS};
use crate::util::{encode_body, ensure_token};

/// Commands the client writes to the gateway
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain-text login
    Login {
        /// User name
        username: String,
        /// Secret
        secret: String,
    },
    /// Keepalive; the gateway's reply is not awaited
    Ping,
    /// Ends the session on the gateway side
    Logoff,
    /// Asks for the status of every GSM span
    ShowSpans,
    /// Sends an SMS; the outcome arrives later as an `UpdateSMS` event
    SendSms {
        /// Port to send from
        port: Port,
        /// Destination number
        destination: String,
        /// Message body, unencoded
        body: String,
        /// Client-chosen id echoed back in the status event
        message_id: String,
    },
    /// Sends a USSD code
    SendUssd {
        /// Port to send from
        port: Port,
        /// USSD code, e.g. `*100#`
        code: String,
        /// How long the device waits for the network
        timeout_secs: u64,
    },
}

impl Command {
    /// Builds a login command
    pub fn login(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Command::Login {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Builds a validated SMS send command
    pub fn send_sms(
        port: Port,
        destination: impl Into<String>,
        body: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<Self> {
        let destination = destination.into();
        let message_id = message_id.into();
        ensure_token("destination", &destination)?;
        ensure_token("message id", &message_id)?;
        Ok(Command::SendSms {
            port,
            destination,
            body: body.into(),
            message_id,
        })
    }

    /// Builds a validated USSD command
    pub fn send_ussd(port: Port, code: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let code = code.into();
        ensure_token("USSD code", &code)?;
        if timeout_secs > MAX_USSD_TIMEOUT_SECS {
            return Err(Error::invalid_argument(format!(
                "USSD timeout of {}s exceeds {}s",
                timeout_secs, MAX_USSD_TIMEOUT_SECS
            )));
        }
        Ok(Command::SendUssd {
            port,
            code,
            timeout_secs,
        })
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Login { .. } => "login",
            Command::Ping => "ping",
            Command::Logoff => "logoff",
            Command::ShowSpans => "show spans",
            Command::SendSms { .. } => "send sms",
            Command::SendUssd { .. } => "send ussd",
        }
    }

    /// Renders the command as wire text, including the terminating blank line
    pub fn to_wire(&self) -> String {
        match self {
            Command::Login { username, secret } => format!(
                "Action: Login\r\nUsername: {}\r\nSecret: {}\r\n\r\n",
                username, secret
            ),
            Command::Ping => "Action: Ping\r\n\r\n".to_string(),
            Command::Logoff => "Action: Logoff\r\n\r\n".to_string(),
            Command::ShowSpans => sms_command("gsm show spans"),
            Command::SendSms {
                port,
                destination,
                body,
                message_id,
            } => sms_command(&format!(
                "gsm send sms {} {} \"{}\" {}",
                port.span(),
                destination,
                encode_body(body),
                message_id
            )),
            Command::SendUssd {
                port,
                code,
                timeout_secs,
            } => sms_command(&format!(
                "gsm send ussd {} \"{}\" {}",
                port.span(),
                code,
                timeout_secs
            )),
        }
    }
}

fn sms_command(command: &str) -> String {
    format!("Action: smscommand\r\ncommand: {}\r\n\r\n", command)
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("secret", &"<redacted>")
                .finish(),
            Command::SendSms {
                port,
                destination,
                message_id,
                ..
            } => f
                .debug_struct("SendSms")
                .field("port", port)
                .field("destination", destination)
                .field("message_id", message_id)
                .finish_non_exhaustive(),
            Command::SendUssd {
                port,
                code,
                timeout_secs,
            } => f
                .debug_struct("SendUssd")
                .field("port", port)
                .field("code", code)
                .field("timeout_secs", timeout_secs)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}
