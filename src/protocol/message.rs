use std::collections::HashMap;

/// Marker that closes a free-text command reply
pub const END_COMMAND_MARKER: &str = "--END COMMAND--";

/// Classification of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Login acknowledged, or a plain success reply
    AuthSuccess,
    /// Login rejected, or an error reply
    AuthFailure,
    /// `Event: ReceivedSMS`
    SmsEvent,
    /// `Event: UpdateSMS`
    SmsStatusEvent,
    /// Any other command reply
    CommandResponse,
    /// Nothing we know how to handle
    Unrecognized,
}

/// A framed message split into fields and classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    kind: MessageKind,
    fields: HashMap<String, String>,
    lines: Vec<String>,
}

impl ParsedMessage {
    /// Parses one complete frame
    pub fn parse(frame: &[u8]) -> Self {
        let text = String::from_utf8_lossy(frame);
        let lines: Vec<String> = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();

        let mut fields = HashMap::new();
        for line in &lines {
            // Firmware sometimes emits bare text lines; those carry no field
            if let Some((name, value)) = line.split_once(':') {
                fields
                    .entry(name.trim().to_string())
                    .or_insert_with(|| value.trim().to_string());
            }
        }

        let kind = classify(&lines, &fields);
        ParsedMessage { kind, fields, lines }
    }

    /// Returns the message classification
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the first value of a field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Returns all non-blank lines in arrival order
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Returns true for `Response: Error` / `Response: Failed` replies
    pub fn is_error_response(&self) -> bool {
        self.kind == MessageKind::AuthFailure
    }

    /// Human-readable reason carried by a reply
    pub fn reason(&self) -> String {
        self.field("Message")
            .or_else(|| self.field("Response"))
            .unwrap_or("no message")
            .to_string()
    }
}

fn classify(lines: &[String], fields: &HashMap<String, String>) -> MessageKind {
    if lines.iter().any(|line| line.contains("Response: Success")) {
        return MessageKind::AuthSuccess;
    }
    if lines
        .iter()
        .any(|line| line.contains("Response: Error") || line.contains("Response: Failed"))
    {
        return MessageKind::AuthFailure;
    }
    match fields.get("Event").map(String::as_str) {
        Some("ReceivedSMS") => return MessageKind::SmsEvent,
        Some("UpdateSMS") => return MessageKind::SmsStatusEvent,
        _ => {}
    }
    if fields.contains_key("Response") || lines.iter().any(|line| line.contains(END_COMMAND_MARKER))
    {
        return MessageKind::CommandResponse;
    }
    MessageKind::Unrecognized
}
