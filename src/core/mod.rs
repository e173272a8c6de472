//! Core types for the gateway client
//!
//! This module contains the error type, the typed records handed to callers
//! and the client configuration.

pub mod error;
pub mod serde;
pub mod types;

use std::time::Duration;

pub use self::error::{Error, Result};
pub use self::types::{
    GatewayConfig,
    GatewayEvent,
    InboundSms,
    Port,
    PortInfo,
    SmsStatus,
    SmsStatusUpdate,
    UssdResponse,
};

/// Default TCP port of the gateway's management interface
pub const DEFAULT_PORT: u16 = 5038;

/// Lowest GSM span number the device reports
pub const MIN_GSM_SPAN: u8 = 2;

/// Highest GSM span number the device reports
pub const MAX_GSM_SPAN: u8 = 5;

/// Default upper bound on a single framed message
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Longest USSD wait the device is asked for
pub const MAX_USSD_TIMEOUT_SECS: u64 = 600;

/// Upper bound on every configured timeout and interval
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
