//! The server side of rUDP: a single socket shared by all peers. The dispatcher's receive loop
//!  routes each datagram to the connection for its source address, creating connections for
//!  inbound SYNs.

use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::config::{RudpConfig, MAX_UDP_PAYLOAD};
use crate::connection::{random_isn, Connection, ConnectionOwner, Segment};
use crate::error::RudpError;
use crate::notification::{Notifier, RudpNotification};
use crate::send_pipeline::SendPipeline;
use crate::state::ConnectionState;

/// The server's connections, keyed by peer address
pub struct PeerTable {
    self_ref: Weak<PeerTable>,
    config: Arc<RudpConfig>,
    send_pipeline: Arc<SendPipeline>,
    notifier: Notifier,
    connections: Mutex<FxHashMap<SocketAddr, Arc<Connection>>>,
}

impl PeerTable {
    pub fn new(config: Arc<RudpConfig>, send_pipeline: Arc<SendPipeline>, notifier: Notifier) -> Arc<PeerTable> {
        Arc::new_cyclic(|self_ref| PeerTable {
            self_ref: self_ref.clone(),
            config,
            send_pipeline,
            notifier,
            connections: Default::default(),
        })
    }

    /// parses a received datagram and hands it to its connection
    pub async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        let segment = match Segment::parse(datagram) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("datagram from {:?} dropped: {}", from, e);
                return;
            }
        };

        let connection = match self.route(from, &segment).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("{} - dropping", e);
                return;
            }
        };

        if let Err(e) = connection.on_segment(segment).await {
            debug!("segment from {:?}: {}", from, e);
        }
    }

    async fn route(&self, from: SocketAddr, segment: &Segment) -> Result<Arc<Connection>, RudpError> {
        let mut connections = self.connections.lock().await;
        match connections.entry(from) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                if !segment.header.is_syn() || segment.header.is_ack() {
                    return Err(RudpError::UnknownPeer(from));
                }

                info!("new connection from {:?}", from);
                let owner: Weak<dyn ConnectionOwner> = self.self_ref.clone();
                let connection = Connection::new(
                    self.config.clone(),
                    from,
                    ConnectionState::Listen,
                    random_isn(),
                    self.send_pipeline.clone(),
                    self.notifier.clone(),
                    owner,
                );
                Ok(e.insert(connection).clone())
            }
        }
    }

    pub async fn get(&self, peer: SocketAddr) -> Result<Arc<Connection>, RudpError> {
        self.connections.lock().await
            .get(&peer)
            .cloned()
            .ok_or(RudpError::UnknownPeer(peer))
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.connections.lock().await
            .keys()
            .cloned()
            .collect()
    }

    /// releases all connections without notifying the application
    pub async fn clear(&self) {
        let connections = self.connections.lock().await
            .drain()
            .map(|(_, connection)| connection)
            .collect::<Vec<_>>();
        for connection in connections {
            connection.abort().await;
        }
    }
}

#[async_trait]
impl ConnectionOwner for PeerTable {
    async fn on_connection_terminated(&self, peer_addr: SocketAddr) {
        if self.connections.lock().await.remove(&peer_addr).is_some() {
            info!("removed peer {:?}", peer_addr);
            self.notifier.peer_removed(peer_addr);
        }
    }
}

/// The server endpoint. Creating a dispatcher binds its socket and starts the receive loop, which
///  runs until `shutdown` is called or the dispatcher is dropped.
pub struct Dispatcher {
    local_addr: SocketAddr,
    peers: Arc<PeerTable>,
    finished: Arc<AtomicBool>,
    recv_loop_handle: JoinHandle<()>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.recv_loop_handle.abort();
    }
}

impl Dispatcher {
    pub async fn new(config: RudpConfig, notification: Arc<dyn RudpNotification>) -> anyhow::Result<Dispatcher> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound server socket to {:?}", local_addr);

        let config = Arc::new(config);
        let send_pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone())));
        let peers = PeerTable::new(config.clone(), send_pipeline, Notifier::new(notification));
        let finished = Arc::new(AtomicBool::new(false));

        let recv_loop_handle = tokio::spawn(Self::recv_loop(
            socket,
            peers.clone(),
            finished.clone(),
            config.listener_poll_interval,
        ));

        Ok(Dispatcher {
            local_addr,
            peers,
            finished,
            recv_loop_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peers.peers().await
    }

    pub async fn peer_state(&self, peer: SocketAddr) -> Result<ConnectionState, RudpError> {
        Ok(self.peers.get(peer).await?.state().await)
    }

    pub async fn append_send(&self, peer: SocketAddr, data: &[u8]) -> Result<bool, RudpError> {
        self.peers.get(peer).await?
            .append_send(data).await
    }

    pub async fn consume_receive(&self, peer: SocketAddr) -> Result<Option<Bytes>, RudpError> {
        Ok(self.peers.get(peer).await?
            .consume_receive().await)
    }

    /// starts the active close of a single peer's connection
    pub async fn close_peer(&self, peer: SocketAddr) -> Result<(), RudpError> {
        self.peers.get(peer).await?
            .close().await
    }

    /// Stops the receive loop after its current poll interval and releases all connections
    pub async fn shutdown(&self) {
        info!("shutting down server on {:?}", self.local_addr);
        self.finished.store(true, Ordering::Release);
        self.peers.clear().await;
    }

    async fn recv_loop(socket: Arc<UdpSocket>, peers: Arc<PeerTable>, finished: Arc<AtomicBool>, poll_interval: Duration) {
        info!("starting receive loop");

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        while !finished.load(Ordering::Acquire) {
            let (num_read, from) = match time::timeout(poll_interval, socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!("socket error: {}", e);
                    continue;
                }
                Ok(Ok(x)) => x,
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            trace!(parent: &span, "received {} bytes from {:?}", num_read, from);

            let datagram = Bytes::copy_from_slice(&buf[..num_read]);
            let peers = peers.clone();
            tokio::spawn(async move {
                peers.on_datagram(from, datagram).await;
            }.instrument(span));
        }
        info!("receive loop finished");
    }
}
