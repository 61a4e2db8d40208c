use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
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

/// Terminating the client's connection finishes the client
struct ClientOwner {
    finished: Arc<AtomicBool>,
    notifier: Notifier,
}

#[async_trait]
impl ConnectionOwner for ClientOwner {
    async fn on_connection_terminated(&self, peer_addr: SocketAddr) {
        info!("connection to {:?} closed", peer_addr);
        self.finished.store(true, Ordering::Release);
        self.notifier.closed();
    }
}

/// The client side of rUDP: a single connection to a server, over a socket of its own
pub struct RudpClient {
    config: Arc<RudpConfig>,
    socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    notifier: Notifier,
    owner: Arc<ClientOwner>,
    finished: Arc<AtomicBool>,
    connection: RwLock<Option<Arc<Connection>>>,
    listener_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RudpClient {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.listener_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

impl RudpClient {
    pub async fn new(config: RudpConfig, notification: Arc<dyn RudpNotification>) -> anyhow::Result<RudpClient> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound client socket to {:?}", socket.local_addr()?);

        let notifier = Notifier::new(notification);
        let finished = Arc::new(AtomicBool::new(false));
        Ok(RudpClient {
            config: Arc::new(config),
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(socket.clone()))),
            socket,
            owner: Arc::new(ClientOwner {
                finished: finished.clone(),
                notifier: notifier.clone(),
            }),
            notifier,
            finished,
            connection: Default::default(),
            listener_handle: Default::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_pipeline.local_addr()
    }

    /// true after the connection was torn down
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> ConnectionState {
        match self.connection.read().await.as_ref() {
            Some(connection) => connection.state().await,
            None => ConnectionState::Closed,
        }
    }

    /// Opens the connection, returning once the handshake is complete. Fails with
    ///  `ConnectionLost` if the server does not respond in spite of retransmissions.
    pub async fn connect(&self, dest: SocketAddr) -> Result<(), RudpError> {
        let connection = {
            let mut slot = self.connection.write().await;
            if let Some(existing) = slot.as_ref() {
                return Err(RudpError::InvalidState(existing.state().await));
            }

            let owner: Weak<ClientOwner> = Arc::downgrade(&self.owner);
            let connection = Connection::new(
                self.config.clone(),
                dest,
                ConnectionState::Closed,
                random_isn(),
                self.send_pipeline.clone(),
                self.notifier.clone(),
                owner,
            );
            *slot = Some(connection.clone());
            connection
        };

        let listener = tokio::spawn(Self::listen(
            self.socket.clone(),
            connection.clone(),
            self.finished.clone(),
            self.config.listener_poll_interval,
        ));
        if let Ok(mut handle) = self.listener_handle.lock() {
            *handle = Some(listener);
        }

        let mut states = connection.subscribe_state();
        info!("connecting to {:?}", dest);
        connection.connect().await?;

        let state = states.wait_for(|s| matches!(s, ConnectionState::Established | ConnectionState::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| RudpError::ConnectionLost(dest))?;
        if state == ConnectionState::Established {
            info!("connected to {:?}", dest);
            Ok(())
        }
        else {
            Err(RudpError::ConnectionLost(dest))
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, RudpError> {
        self.connection.read().await
            .clone()
            .ok_or(RudpError::UseBeforeConnect)
    }

    /// see [Connection::append_send]
    pub async fn append_send(&self, data: &[u8]) -> Result<bool, RudpError> {
        self.connection().await?
            .append_send(data).await
    }

    pub async fn consume_receive(&self) -> Option<Bytes> {
        match self.connection().await {
            Ok(connection) => connection.consume_receive().await,
            Err(_) => None,
        }
    }

    pub async fn close(&self) -> Result<(), RudpError> {
        self.connection().await?
            .close().await
    }

    async fn listen(socket: Arc<UdpSocket>, connection: Arc<Connection>, finished: Arc<AtomicBool>, poll_interval: Duration) {
        let peer_addr = connection.peer_addr();
        info!("starting client listener for {:?}", peer_addr);

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

            if from != peer_addr {
                debug!(parent: &span, "datagram from {:?} is not from the server - dropping", from);
                continue;
            }

            let datagram = Bytes::copy_from_slice(&buf[..num_read]);
            let connection = connection.clone();
            tokio::spawn(async move {
                let result = match Segment::parse(datagram) {
                    Ok(segment) => connection.on_segment(segment).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!("dropped datagram: {}", e);
                }
            }.instrument(span));
        }
        debug!("client listener for {:?} finished", peer_addr);
    }
}
