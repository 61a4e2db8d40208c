use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;
use crate::error::RudpError;

/// This is the interface through which the protocol informs the application about events. It is
///  implemented by application code.
///
/// Callbacks are invoked in tasks of their own, never while the protocol holds locks, so it is
///  safe to call back into the connection (e.g. to consume received data) from a callback.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RudpNotification: Send + Sync + 'static {
    /// new in-order data is available via `consume_receive`
    async fn on_data_ready(&self, peer: SocketAddr);

    /// the send buffer has room for more data, or the connection was just established
    async fn on_send_ready(&self, peer: SocketAddr);

    /// server side: the connection to a peer was torn down and its resources were released
    async fn on_peer_removed(&self, peer: SocketAddr);

    /// client side: the connection was torn down
    async fn on_closed(&self);

    /// The peer did not acknowledge a datagram in spite of retransmissions. The connection is
    ///  released, which is reported through `on_peer_removed` or `on_closed` as well.
    async fn on_connection_lost(&self, peer: SocketAddr, error: RudpError);
}

/// Invokes an application's callbacks in fire-and-forget tasks
#[derive(Clone)]
pub struct Notifier {
    app: Arc<dyn RudpNotification>,
}

impl Notifier {
    pub fn new(app: Arc<dyn RudpNotification>) -> Notifier {
        Notifier { app }
    }

    pub fn data_ready(&self, peer: SocketAddr) {
        trace!("notifying data ready for {:?}", peer);
        let app = self.app.clone();
        tokio::spawn(async move { app.on_data_ready(peer).await });
    }

    pub fn send_ready(&self, peer: SocketAddr) {
        trace!("notifying send ready for {:?}", peer);
        let app = self.app.clone();
        tokio::spawn(async move { app.on_send_ready(peer).await });
    }

    pub fn peer_removed(&self, peer: SocketAddr) {
        let app = self.app.clone();
        tokio::spawn(async move { app.on_peer_removed(peer).await });
    }

    pub fn closed(&self) {
        let app = self.app.clone();
        tokio::spawn(async move { app.on_closed().await });
    }

    pub fn connection_lost(&self, peer: SocketAddr, error: RudpError) {
        let app = self.app.clone();
        tokio::spawn(async move { app.on_connection_lost(peer, error).await });
    }
}
