use std::time::Duration;

use gsm_gateway::{GatewayClient, GatewayConfig, GatewayEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tracing::{error, info, warn};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Connection settings come from the environment
    let host = env_or("GATEWAY_HOST", "127.0.0.1");
    let port = env_or("GATEWAY_PORT", "5038").parse().unwrap_or(5038);
    let username = env_or("GATEWAY_USER", "admin");
    let secret = env_or("GATEWAY_SECRET", "admin");

    let client = match GatewayClient::new(GatewayConfig::new(host, port, username, secret)) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Invalid gateway configuration");
            return;
        }
    };
    let mut events = client.subscribe();

    if let Err(e) = client.connect().await {
        error!(error = %e, "Could not connect to gateway");
        return;
    }

    println!("Connected to {}", client.config().address());
    let mut report = interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = report.tick() => match client.get_all_ports_info().await {
                Ok(ports) => {
                    for info in ports {
                        println!(
                            "port {} (span {}): {} [{}]",
                            info.port,
                            info.gsm_span,
                            if info.is_up { "up" } else { "down" },
                            info.status
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Port query failed"),
            },
            event = events.recv() => match event {
                Ok(GatewayEvent::SmsReceived(sms)) => {
                    println!(
                        "SMS {} on port {} from {} ({}/{}): {}",
                        sms.id, sms.port, sms.sender, sms.index, sms.total, sms.content
                    );
                }
                Ok(GatewayEvent::SmsStatusUpdate(update)) => {
                    println!("SMS {} status: {:?}", update.id, update.status);
                }
                Ok(GatewayEvent::Disconnected { session_id, reason }) => {
                    info!(session = session_id, reason = %reason, "Session ended");
                }
                Ok(other) => info!(event = ?other, "Gateway event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event consumer lagging"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
}
