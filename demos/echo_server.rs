use clap::Parser;
use clap_derive::Parser;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use rudp::config::RudpConfig;
use rudp::dispatcher::Dispatcher;
use rudp::error::RudpError;
use rudp::notification::RudpNotification;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    #[clap(default_value = "127.0.0.1:9876")]
    address: String,

    #[clap(long, default_value_t = 1024)]
    packet_size: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Debug)]
enum Event {
    DataReady(SocketAddr),
    SendReady(SocketAddr),
    PeerGone(SocketAddr),
}

struct ChannelNotification {
    sender: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl RudpNotification for ChannelNotification {
    async fn on_data_ready(&self, peer: SocketAddr) {
        self.sender.send(Event::DataReady(peer)).ok();
    }

    async fn on_send_ready(&self, peer: SocketAddr) {
        self.sender.send(Event::SendReady(peer)).ok();
    }

    async fn on_peer_removed(&self, peer: SocketAddr) {
        info!("peer {:?} disconnected", peer);
        self.sender.send(Event::PeerGone(peer)).ok();
    }

    async fn on_closed(&self) {}

    async fn on_connection_lost(&self, peer: SocketAddr, error: RudpError) {
        warn!("lost peer {:?}: {}", peer, error);
    }
}

/// echoes packets back to their sender, holding them back while the peer's send buffer is full
async fn echo_pending(dispatcher: &Dispatcher, peer: SocketAddr, pending: &mut VecDeque<Bytes>) {
    while let Some(packet) = pending.front() {
        match dispatcher.append_send(peer, packet).await {
            Ok(true) => {
                pending.pop_front();
            }
            Ok(false) => break,
            Err(e) => {
                warn!("cannot echo to {:?}: {}", peer, e);
                pending.clear();
                break;
            }
        }
    }
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

    let mut config = RudpConfig::new(args.address.parse()?);
    config.packet_size = args.packet_size;
    config.send_buffer_capacity = 32 * args.packet_size;
    config.receive_buffer_capacity = 32 * args.packet_size;

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(config, Arc::new(ChannelNotification { sender })).await?;
    info!("echo server listening on {:?}", dispatcher.local_addr());

    let mut pending: FxHashMap<SocketAddr, VecDeque<Bytes>> = FxHashMap::default();
    while let Some(event) = receiver.recv().await {
        match event {
            Event::DataReady(peer) => {
                let queue = pending.entry(peer).or_default();
                while let Ok(Some(packet)) = dispatcher.consume_receive(peer).await {
                    queue.push_back(packet);
                }
                echo_pending(&dispatcher, peer, queue).await;
            }
            Event::SendReady(peer) => {
                if let Some(queue) = pending.get_mut(&peer) {
                    echo_pending(&dispatcher, peer, queue).await;
                }
            }
            Event::PeerGone(peer) => {
                pending.remove(&peer);
            }
        }
    }
    Ok(())
}
