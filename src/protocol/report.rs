//! Interpretation of span reports and SMS push events.

use tracing::warn;

use crate::core::{Error, InboundSms, Port, PortInfo, Result, SmsStatus, SmsStatusUpdate, UssdResponse};
use crate::util::decode_body;
use super::message::{MessageKind, ParsedMessage, END_COMMAND_MARKER};

const SPAN_PREFIX: &str = "GSM span ";

/// Extracts one `PortInfo` per `GSM span N: ...` line of a report
pub fn parse_port_report(message: &ParsedMessage) -> Vec<PortInfo> {
    message
        .lines()
        .iter()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix(SPAN_PREFIX)?;
            match parse_span_line(rest) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(line = %line, error = %e, "Skipping unusable span line");
                    None
                }
            }
        })
        .collect()
}

fn parse_span_line(rest: &str) -> Result<PortInfo> {
    let (number, flags) = rest
        .split_once(':')
        .ok_or_else(|| Error::protocol("span line has no status"))?;
    let gsm_span: u8 = number
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("invalid span number {:?}", number.trim())))?;
    let port = Port::from_span(gsm_span)?;

    let status = flags.trim().to_string();
    let power_off = status.contains("Power off");
    Ok(PortInfo {
        port,
        gsm_span,
        // An explicit power-off wins over a stale "Up"
        is_up: status.contains("Up") && !power_off,
        power_on: status.contains("Power on"),
        power_off,
        provisioned: status.contains("Provisioned"),
        status,
    })
}

fn parse_count(message: &ParsedMessage, name: &str) -> u32 {
    message
        .field(name)
        .and_then(|value| value.parse().ok())
        .filter(|count| *count > 0)
        .unwrap_or(1)
}

impl TryFrom<&ParsedMessage> for InboundSms {
    type Error = Error;

    fn try_from(message: &ParsedMessage) -> Result<Self> {
        if message.kind() != MessageKind::SmsEvent {
            return Err(Error::protocol("not a ReceivedSMS event"));
        }
        let id = message
            .field("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::protocol("ReceivedSMS event without ID"))?;
        let span_text = message
            .field("GsmSpan")
            .ok_or_else(|| Error::protocol("ReceivedSMS event without GsmSpan"))?;
        let gsm_span: u8 = span_text
            .parse()
            .map_err(|_| Error::protocol(format!("invalid GsmSpan {:?}", span_text)))?;
        let port = Port::from_span(gsm_span)?;
        let raw_content = message.field("Content").unwrap_or_default().to_string();

        Ok(InboundSms {
            id: id.to_string(),
            gsm_span,
            port,
            sender: message.field("Sender").unwrap_or_default().to_string(),
            content: decode_body(&raw_content),
            raw_content,
            index: parse_count(message, "Index"),
            total: parse_count(message, "Total"),
            received_at: message.field("Recvtime").unwrap_or_default().to_string(),
        })
    }
}

impl TryFrom<&ParsedMessage> for SmsStatusUpdate {
    type Error = Error;

    fn try_from(message: &ParsedMessage) -> Result<Self> {
        if message.kind() != MessageKind::SmsStatusEvent {
            return Err(Error::protocol("not an UpdateSMS event"));
        }
        let id = message
            .field("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::protocol("UpdateSMS event without ID"))?;
        Ok(SmsStatusUpdate {
            id: id.to_string(),
            status: SmsStatus::from_code(message.field("Status").unwrap_or_default()),
        })
    }
}

/// Builds a USSD reply from the free-text command response
pub fn parse_ussd_response(port: Port, message: &ParsedMessage) -> UssdResponse {
    let text = message
        .lines()
        .iter()
        .map(|line| line.trim())
        .filter(|line| {
            !line.starts_with("Response:")
                && !line.starts_with("Privilege:")
                && !line.contains(END_COMMAND_MARKER)
        })
        .collect::<Vec<_>>()
        .join("\n");
    UssdResponse { port, text }
}
