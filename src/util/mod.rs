//! Utility module
//!
//! Text helpers shared by the command encoder and the report parsers.

use crate::core::{Error, Result};

/// URL-encodes an SMS body for the wire
pub fn encode_body(body: &str) -> String {
    urlencoding::encode(body).into_owned()
}

/// Decodes a URL-encoded body, falling back to the raw text when it does
/// not decode to valid UTF-8
pub fn decode_body(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Checks that a value can be placed as one token in a command line
pub fn ensure_token(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_argument(format!("{} must not be empty", name)));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '"')
    {
        return Err(Error::invalid_argument(format!(
            "{} must not contain whitespace, quotes or control characters",
            name
        )));
    }
    Ok(())
}
