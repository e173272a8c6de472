//! GSM gateway client: a persistent session with a multi-SIM GSM gateway
//!
//! The gateway speaks a line-oriented, blank-line-terminated text protocol
//! modelled on the Asterisk Manager Interface. This library keeps one
//! authenticated session open, correlates command replies, publishes SMS
//! push events and reconnects with exponential backoff when the link drops.
//!
//! ```no_run
//! use gsm_gateway::{GatewayClient, GatewayConfig, GatewayEvent};
//!
//! # async fn run() -> gsm_gateway::Result<()> {
//! let client = GatewayClient::new(GatewayConfig::new("192.168.1.50", 5038, "admin", "secret"))?;
//! let mut events = client.subscribe();
//! client.connect().await?;
//!
//! for port in client.get_all_ports_info().await? {
//!     println!("port {}: {}", port.port, port.status);
//! }
//! while let Ok(event) = events.recv().await {
//!     if let GatewayEvent::SmsReceived(sms) = event {
//!         println!("{} on port {}: {}", sms.sender, sms.port, sms.content);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod network;
pub mod protocol;
mod util;

// Re-export commonly used items
pub use crate::core::{
    Error, GatewayConfig, GatewayEvent, InboundSms, Port, PortInfo, Result, SmsStatus,
    SmsStatusUpdate, UssdResponse,
};
pub use crate::network::GatewayClient;
pub use crate::protocol::SessionState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
