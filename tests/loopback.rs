use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rudp::client::RudpClient;
use rudp::config::RudpConfig;
use rudp::dispatcher::Dispatcher;
use rudp::error::RudpError;
use rudp::header::{HeaderFlags, RudpHeader};
use rudp::notification::RudpNotification;
use rudp::send_pipeline::SendPipeline;
use rudp::seq_num::SeqNum;
use rudp::state::ConnectionState;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

const PACKET_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    DataReady(SocketAddr),
    SendReady(SocketAddr),
    PeerRemoved(SocketAddr),
    Closed,
    ConnectionLost(SocketAddr, RudpError),
}

struct ChannelNotification {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelNotification {
    fn new() -> (Arc<ChannelNotification>, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelNotification { sender }), receiver)
    }
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
        self.sender.send(Event::PeerRemoved(peer)).ok();
    }

    async fn on_closed(&self) {
        self.sender.send(Event::Closed).ok();
    }

    async fn on_connection_lost(&self, peer: SocketAddr, error: RudpError) {
        self.sender.send(Event::ConnectionLost(peer, error)).ok();
    }
}

fn test_config() -> RudpConfig {
    let mut config = RudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    config.packet_size = PACKET_SIZE;
    config.send_buffer_capacity = 8 * PACKET_SIZE;
    config.receive_buffer_capacity = 8 * PACKET_SIZE;
    config.base_retransmit_timeout = Duration::from_millis(50);
    config.max_retransmit_timeout = Duration::from_millis(400);
    config.max_retransmissions = 8;
    config.time_wait_linger = Duration::from_millis(200);
    config.listener_poll_interval = Duration::from_millis(20);
    config
}

fn packet(n: u8) -> Vec<u8> {
    vec![n; PACKET_SIZE]
}

/// waits for a specific event, skipping all others
async fn expect_event(events: &mut mpsc::UnboundedReceiver<Event>, expected: Event) {
    time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(evt) if evt == expected => return,
                Some(_) => continue,
                None => panic!("notification channel closed"),
            }
        }
    }).await
        .unwrap_or_else(|_| panic!("timeout waiting for {:?}", expected));
}

async fn connected_pair() -> (Dispatcher, mpsc::UnboundedReceiver<Event>, RudpClient, mpsc::UnboundedReceiver<Event>) {
    let (server_notification, server_events) = ChannelNotification::new();
    let server = Dispatcher::new(test_config(), server_notification).await.unwrap();

    let (client_notification, client_events) = ChannelNotification::new();
    let client = RudpClient::new(test_config(), client_notification).await.unwrap();
    client.connect(server.local_addr()).await.unwrap();

    (server, server_events, client, client_events)
}

#[tokio::test]
async fn test_connect() {
    let (server, mut server_events, client, _client_events) = connected_pair().await;

    assert_eq!(client.state().await, ConnectionState::Established);
    expect_event(&mut server_events, Event::SendReady(client.local_addr())).await;
    assert_eq!(server.peers().await, vec![client.local_addr()]);
    assert_eq!(server.peer_state(client.local_addr()).await, Ok(ConnectionState::Established));
}

#[tokio::test]
async fn test_echo() {
    let (server, mut server_events, client, mut client_events) = connected_pair().await;
    let client_addr = client.local_addr();
    expect_event(&mut server_events, Event::SendReady(client_addr)).await;

    for n in 0..5 {
        assert_eq!(client.append_send(&packet(n)).await, Ok(true));
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        expect_event(&mut server_events, Event::DataReady(client_addr)).await;
        while let Some(data) = server.consume_receive(client_addr).await.unwrap() {
            received.push(data[0]);
            assert_eq!(server.append_send(client_addr, &data).await, Ok(true));
        }
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);

    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        expect_event(&mut client_events, Event::DataReady(server.local_addr())).await;
        while let Some(data) = client.consume_receive().await {
            assert_eq!(data.len(), PACKET_SIZE);
            echoed.push(data[0]);
        }
    }
    assert_eq!(echoed, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_more_data_than_the_receive_window() {
    let (server, mut server_events, client, mut client_events) = connected_pair().await;
    let client_addr = client.local_addr();
    expect_event(&mut server_events, Event::SendReady(client_addr)).await;

    // twice the receive buffer: the sender has to wait for the receiver's window to re-open
    let mut next_to_send = 0u8;
    let mut received = Vec::new();
    while received.len() < 16 {
        while next_to_send < 16 && client.append_send(&packet(next_to_send)).await == Ok(true) {
            next_to_send += 1;
        }
        tokio::select! {
            _ = expect_event(&mut server_events, Event::DataReady(client_addr)) => {}
            _ = expect_event(&mut client_events, Event::SendReady(server.local_addr())) => {}
        }
        while let Some(data) = server.consume_receive(client_addr).await.unwrap() {
            received.push(data[0]);
        }
    }
    assert_eq!(received, (0..16).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_client_closes() {
    let (server, mut server_events, client, mut client_events) = connected_pair().await;
    let client_addr = client.local_addr();

    client.close().await.unwrap();

    expect_event(&mut server_events, Event::PeerRemoved(client_addr)).await;
    assert!(server.peers().await.is_empty());

    // after the linger period
    expect_event(&mut client_events, Event::Closed).await;
    assert_eq!(client.state().await, ConnectionState::Closed);
    assert!(client.is_finished());
    assert_eq!(client.append_send(&packet(1)).await, Err(RudpError::UseBeforeConnect));
}

#[tokio::test]
async fn test_server_closes() {
    let (server, mut server_events, client, mut client_events) = connected_pair().await;
    let client_addr = client.local_addr();
    expect_event(&mut server_events, Event::SendReady(client_addr)).await;

    server.close_peer(client_addr).await.unwrap();

    expect_event(&mut client_events, Event::Closed).await;
    expect_event(&mut server_events, Event::PeerRemoved(client_addr)).await;
    assert_eq!(server.close_peer(client_addr).await, Err(RudpError::UnknownPeer(client_addr)));
}

#[tokio::test]
async fn test_unknown_peer_is_ignored() {
    let (server_notification, _server_events) = ChannelNotification::new();
    let server = Dispatcher::new(test_config(), server_notification).await.unwrap();

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let header = RudpHeader::new(
        raw.local_addr().unwrap().port(),
        server.local_addr().port(),
        SeqNum::from_raw(1000),
        SeqNum::from_raw(2000),
        HeaderFlags::ACK,
        8,
    );
    raw.send_to(&SendPipeline::finalize_datagram(&header, &packet(3)), server.local_addr()).await.unwrap();

    let mut buf = [0u8; 1024];
    assert!(time::timeout(Duration::from_millis(300), raw.recv_from(&mut buf)).await.is_err());
    assert!(server.peers().await.is_empty());
    assert_eq!(server.consume_receive(raw.local_addr().unwrap()).await, Err(RudpError::UnknownPeer(raw.local_addr().unwrap())));
}

#[tokio::test]
async fn test_raw_handshake() {
    let (server_notification, mut server_events) = ChannelNotification::new();
    let server = Dispatcher::new(test_config(), server_notification).await.unwrap();
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let raw_addr = raw.local_addr().unwrap();

    let syn = RudpHeader::new(raw_addr.port(), server.local_addr().port(), SeqNum::from_raw(1000), SeqNum::ZERO, HeaderFlags::SYN, 8);
    raw.send_to(&SendPipeline::finalize_datagram(&syn, &[]), server.local_addr()).await.unwrap();

    let mut buf = [0u8; 1024];
    let (len, from) = time::timeout(Duration::from_secs(5), raw.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(from, server.local_addr());
    assert_eq!(len, RudpHeader::SERIALIZED_LEN);
    assert!(rudp::checksum::check_header_checksum(&buf[..len]));

    let syn_ack = RudpHeader::deser(&mut &buf[..len]).unwrap();
    assert_eq!(syn_ack.flags, HeaderFlags::SYN | HeaderFlags::ACK);
    assert_eq!(syn_ack.ack_num, SeqNum::from_raw(1001));
    assert_eq!(syn_ack.recv_window, 8);

    let ack = RudpHeader::new(raw_addr.port(), server.local_addr().port(), SeqNum::from_raw(1001), syn_ack.seq_num.plus(1), HeaderFlags::ACK, 8);
    raw.send_to(&SendPipeline::finalize_datagram(&ack, &[]), server.local_addr()).await.unwrap();

    expect_event(&mut server_events, Event::SendReady(raw_addr)).await;
    assert_eq!(server.peer_state(raw_addr).await, Ok(ConnectionState::Established));
}
