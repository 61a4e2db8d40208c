use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rudp::client::RudpClient;
use rudp::config::RudpConfig;
use rudp::error::RudpError;
use rudp::notification::RudpNotification;
use tokio::sync::Notify;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    #[clap(default_value = "127.0.0.1:9876")]
    server_address: String,

    #[clap(short, long, default_value_t = 10)]
    num_packets: usize,

    #[clap(long, default_value_t = 1024)]
    packet_size: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Default)]
struct WakeupNotification {
    data_ready: Notify,
    send_ready: Notify,
    closed: Notify,
}

#[async_trait]
impl RudpNotification for WakeupNotification {
    async fn on_data_ready(&self, _peer: SocketAddr) {
        self.data_ready.notify_one();
    }

    async fn on_send_ready(&self, _peer: SocketAddr) {
        self.send_ready.notify_one();
    }

    async fn on_peer_removed(&self, _peer: SocketAddr) {}

    async fn on_closed(&self) {
        self.closed.notify_one();
    }

    async fn on_connection_lost(&self, peer: SocketAddr, error: RudpError) {
        warn!("lost connection to {:?}: {}", peer, error);
        self.closed.notify_one();
    }
}

/// the text, zero padded to a packet
fn padded(text: &str, packet_size: usize) -> Vec<u8> {
    let mut result = text.as_bytes().to_vec();
    result.resize(packet_size, 0);
    result
}

fn unpadded(packet: &[u8]) -> String {
    let end = packet.iter().position(|&b| b == 0).unwrap_or(packet.len());
    String::from_utf8_lossy(&packet[..end]).to_string()
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = RudpConfig::default_ipv4();
    config.packet_size = args.packet_size;
    config.send_buffer_capacity = 32 * args.packet_size;
    config.receive_buffer_capacity = 32 * args.packet_size;

    let notification = Arc::new(WakeupNotification::default());
    let client = RudpClient::new(config, notification.clone()).await?;
    client.connect(args.server_address.parse()?).await?;

    for i in 0..args.num_packets {
        let packet = padded(&format!("packet #{}", i), args.packet_size);
        while !client.append_send(&packet).await? {
            notification.send_ready.notified().await;
        }
    }

    let mut num_received = 0;
    while num_received < args.num_packets {
        match client.consume_receive().await {
            Some(packet) => {
                info!("echo: {}", unpadded(&packet));
                num_received += 1;
            }
            None => {
                let _ = tokio::time::timeout(Duration::from_secs(1), notification.data_ready.notified()).await;
            }
        }
    }

    client.close().await?;
    notification.closed.notified().await;
    info!("connection closed");
    Ok(())
}
