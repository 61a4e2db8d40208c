use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use crate::connection::{ConnectionOwner, Segment};
use crate::error::RudpError;
use crate::notification::RudpNotification;
use crate::send_pipeline::SendSocket;

/// A send socket that records all datagrams instead of sending them
pub struct TrackingSendSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}
impl TrackingSendSocket {
    pub fn new(local_addr: SocketAddr) -> Arc<TrackingSendSocket> {
        Arc::new(TrackingSendSocket {
            local_addr,
            sent: Default::default(),
        })
    }

    /// removes and returns the datagrams sent so far, parsed and checksum-verified
    pub fn take_sent(&self) -> Vec<(SocketAddr, Segment)> {
        self.sent.lock().unwrap()
            .drain(..)
            .map(|(addr, datagram)| (addr, Segment::parse(datagram).expect("sent datagram should be valid")))
            .collect()
    }

    pub fn take_single(&self) -> Segment {
        let mut sent = self.take_sent();
        assert_eq!(sent.len(), 1, "expected exactly one datagram");
        sent.remove(0).1
    }

    pub fn assert_nothing_sent(&self) {
        assert!(self.sent.lock().unwrap().is_empty());
    }
}

#[async_trait]
impl SendSocket for TrackingSendSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.sent.lock().unwrap()
            .push((to, Bytes::copy_from_slice(packet_buf)));
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    DataReady(SocketAddr),
    SendReady(SocketAddr),
    PeerRemoved(SocketAddr),
    Closed,
    ConnectionLost(SocketAddr, RudpError),
    Terminated(SocketAddr),
}

/// Forwards application notifications and connection terminations to a channel, allowing test
///  code to await them
pub struct TrackingNotification {
    sender: mpsc::UnboundedSender<NotificationEvent>,
}
impl TrackingNotification {
    pub fn new() -> (Arc<TrackingNotification>, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(TrackingNotification { sender }), receiver)
    }

    fn send(&self, evt: NotificationEvent) {
        self.sender.send(evt).ok();
    }
}

#[async_trait]
impl RudpNotification for TrackingNotification {
    async fn on_data_ready(&self, peer: SocketAddr) {
        self.send(NotificationEvent::DataReady(peer));
    }

    async fn on_send_ready(&self, peer: SocketAddr) {
        self.send(NotificationEvent::SendReady(peer));
    }

    async fn on_peer_removed(&self, peer: SocketAddr) {
        self.send(NotificationEvent::PeerRemoved(peer));
    }

    async fn on_closed(&self) {
        self.send(NotificationEvent::Closed);
    }

    async fn on_connection_lost(&self, peer: SocketAddr, error: RudpError) {
        self.send(NotificationEvent::ConnectionLost(peer, error));
    }
}

#[async_trait]
impl ConnectionOwner for TrackingNotification {
    async fn on_connection_terminated(&self, peer_addr: SocketAddr) {
        self.send(NotificationEvent::Terminated(peer_addr));
    }
}
