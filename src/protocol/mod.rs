//! Protocol implementation module
//!
//! This module defines the gateway's text protocol: framing, message
//! classification, outbound commands, report parsing and the per-connection
//! session state machine.

pub mod codec;
pub mod command;
pub mod message;
pub mod report;
pub mod state;

pub use self::codec::FrameCodec;
pub use self::command::Command;
pub use self::message::{MessageKind, ParsedMessage, END_COMMAND_MARKER};
pub use self::report::{parse_port_report, parse_ussd_response};
pub use self::state::SessionState;
pub(crate) use self::state::Session;

/// Blank line that terminates every message in both directions
pub const FRAME_DELIMITER: &[u8] = b"\r\n\r\n";
