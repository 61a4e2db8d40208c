//! A `Connection` is one endpoint of an rUDP connection, i.e. the state machine for a single peer.
//!  It is shared by both roles: a client creates it in `Closed` and calls `connect`, the server's
//!  dispatcher creates it in `Listen` when a SYN arrives.
//!
//! All mutable protocol state lives in `ConnectionInner` behind a single lock. The send buffer
//!  has a lock of its own because retransmission timers report congestion to it; when both are
//!  needed, `inner` is always locked first.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use bytes::Bytes;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};
use crate::checksum::check_header_checksum;
use crate::config::RudpConfig;
use crate::error::RudpError;
use crate::header::{HeaderFlags, RudpHeader};
use crate::message::{Message, RetransmissionObserver, RetransmitTimer};
use crate::message_pool::MessagePool;
use crate::notification::Notifier;
use crate::receive_buffer::ReceiveWindowBuffer;
use crate::send_buffer::SendWindowBuffer;
use crate::send_pipeline::SendPipeline;
use crate::seq_num::SeqNum;
use crate::state::ConnectionState;

/// A received datagram after checksum verification: the decoded header and the payload
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: RudpHeader,
    pub payload: Bytes,
}

impl Segment {
    pub fn parse(datagram: Bytes) -> Result<Segment, RudpError> {
        if datagram.len() < RudpHeader::SERIALIZED_LEN {
            return Err(RudpError::MalformedLength { expected: RudpHeader::SERIALIZED_LEN, actual: datagram.len() });
        }
        if !check_header_checksum(&datagram) {
            return Err(RudpError::ChecksumMismatch);
        }

        let mut buf: &[u8] = &datagram;
        let header = RudpHeader::deser(&mut buf)
            .map_err(|_| RudpError::MalformedLength { expected: RudpHeader::SERIALIZED_LEN, actual: datagram.len() })?;
        let payload = datagram.slice(RudpHeader::SERIALIZED_LEN..);
        Ok(Segment { header, payload })
    }
}

/// The owner of a connection (client or dispatcher) is informed when the connection terminates
///  so it can release it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionOwner: Send + Sync + 'static {
    async fn on_connection_terminated(&self, peer_addr: SocketAddr);
}

/// random initial sequence number
pub fn random_isn() -> SeqNum {
    SeqNum::from_raw(rand::thread_rng().gen_range(1..=65536))
}

struct ConnectionInner {
    state: ConnectionState,
    /// next sequence number to send
    seq_num: SeqNum,
    /// oldest unacknowledged data sequence number
    snd_una: SeqNum,
    /// next sequence number expected from the peer
    peer_seq: SeqNum,
    receive_buffer: ReceiveWindowBuffer,
    message_pool: MessagePool,
    /// the key of our in-flight SYN or FIN
    control_ack: Option<SeqNum>,
    close_pending: bool,
    linger_handle: Option<JoinHandle<()>>,
}

#[must_use]
enum AfterSegment {
    Continue,
    Terminated,
}

pub struct Connection {
    self_ref: Weak<Connection>,
    config: Arc<RudpConfig>,
    peer_addr: SocketAddr,
    local_port: u16,
    initial_seq: SeqNum,
    send_pipeline: Arc<SendPipeline>,
    notifier: Notifier,
    owner: Weak<dyn ConnectionOwner>,
    send_buffer: Arc<Mutex<SendWindowBuffer>>,
    inner: Mutex<ConnectionInner>,
    state_sender: watch::Sender<ConnectionState>,
}

impl Connection {
    pub fn new(
        config: Arc<RudpConfig>,
        peer_addr: SocketAddr,
        initial_state: ConnectionState,
        initial_seq: SeqNum,
        send_pipeline: Arc<SendPipeline>,
        notifier: Notifier,
        owner: Weak<dyn ConnectionOwner>,
    ) -> Arc<Connection> {
        let local_port = send_pipeline.local_addr().port();
        let (state_sender, _) = watch::channel(initial_state);

        Arc::new_cyclic(|self_ref| Connection {
            self_ref: self_ref.clone(),
            peer_addr,
            local_port,
            initial_seq,
            send_pipeline,
            notifier,
            owner,
            send_buffer: Arc::new(Mutex::new(SendWindowBuffer::new(&config))),
            inner: Mutex::new(ConnectionInner {
                state: initial_state,
                seq_num: initial_seq,
                snd_una: initial_seq,
                peer_seq: SeqNum::ZERO,
                receive_buffer: ReceiveWindowBuffer::new(&config),
                message_pool: MessagePool::new(),
                control_ack: None,
                close_pending: false,
                linger_handle: None,
            }),
            state_sender,
            config,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_sender.subscribe()
    }

    #[cfg(test)]
    pub async fn force_state(&self, state: ConnectionState, seq_num: SeqNum, peer_seq: SeqNum) {
        let mut inner = self.inner.lock().await;
        inner.seq_num = seq_num;
        inner.snd_una = seq_num;
        inner.peer_seq = peer_seq;
        self.set_state(&mut inner, state);
    }

    fn set_state(&self, inner: &mut ConnectionInner, new_state: ConnectionState) {
        debug!("{:?}: {} -> {}", self.peer_addr, inner.state, new_state);
        inner.state = new_state;
        self.state_sender.send_replace(new_state);
    }

    fn observer(&self) -> Weak<dyn RetransmissionObserver> {
        self.self_ref.clone()
    }

    fn header(&self, inner: &ConnectionInner, seq_num: SeqNum, ack_num: SeqNum, flags: HeaderFlags) -> RudpHeader {
        RudpHeader::new(
            self.local_port,
            self.peer_addr.port(),
            seq_num,
            ack_num,
            flags,
            inner.receive_buffer.get_window(),
        )
    }

    /// sends a datagram once, for pure ACKs and window updates
    async fn send_unreliable(&self, header: &RudpHeader) {
        let datagram = SendPipeline::finalize_datagram(header, &[]);
        Message::new(datagram, header.seq_num)
            .send(&self.send_pipeline, self.peer_addr)
            .await;
    }

    async fn send_reliable(&self, inner: &mut ConnectionInner, header: &RudpHeader, payload: &[u8], expected_ack: SeqNum) {
        let datagram = SendPipeline::finalize_datagram(header, payload);
        let mut message = Message::new(datagram, expected_ack);
        message.send_with_timer(
            self.send_pipeline.clone(),
            self.peer_addr,
            RetransmitTimer::new(&self.config),
            self.observer(),
        ).await;
        inner.message_pool.add(message);
    }

    async fn send_ack(&self, inner: &ConnectionInner) {
        let header = self.header(inner, inner.seq_num, inner.peer_seq, HeaderFlags::ACK);
        self.send_unreliable(&header).await;
    }

    /// Client side: sends the SYN and moves to `SynSent`
    pub async fn connect(&self) -> Result<(), RudpError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Closed {
            return Err(RudpError::InvalidState(inner.state));
        }

        let isn = self.initial_seq;
        inner.seq_num = isn;
        let header = self.header(&inner, isn, SeqNum::ZERO, HeaderFlags::SYN);
        self.send_reliable(&mut inner, &header, &[], isn.plus(1)).await;
        inner.control_ack = Some(isn.plus(1));
        self.set_state(&mut inner, ConnectionState::SynSent);
        Ok(())
    }

    /// Handles an inbound segment from this connection's peer. An `Err` describes why the segment
    ///  was dropped or only re-acknowledged, it does not affect the connection.
    pub async fn on_segment(&self, segment: Segment) -> Result<(), RudpError> {
        let header = &segment.header;
        if header.dest_port != self.local_port || header.source_port != self.peer_addr.port() {
            debug!("ports {} -> {} do not match connection {:?} - dropping", header.source_port, header.dest_port, self.peer_addr);
            return Ok(());
        }

        let after = {
            let mut inner = self.inner.lock().await;
            trace!("received segment in state {}: seq={} ack={} flags={:?} payload={}", inner.state, header.seq_num, header.ack_num, header.flags, segment.payload.len());

            if header.is_syn() {
                self.on_syn(&mut inner, header).await
            }
            else if header.is_fin() {
                self.on_fin(&mut inner, header).await
            }
            else if header.is_ack() {
                self.on_ack(&mut inner, header).await
            }
            else {
                self.on_data(&mut inner, &segment).await?;
                AfterSegment::Continue
            }
        };

        if let AfterSegment::Terminated = after {
            self.notify_terminated(None).await;
        }
        Ok(())
    }

    async fn on_syn(&self, inner: &mut ConnectionInner, header: &RudpHeader) -> AfterSegment {
        match inner.state {
            ConnectionState::Listen if !header.is_ack() => {
                inner.peer_seq = header.seq_num.plus(1);
                let isn = self.initial_seq;
                inner.seq_num = isn;

                let syn_ack = self.header(inner, isn, inner.peer_seq, HeaderFlags::SYN | HeaderFlags::ACK);
                self.send_reliable(inner, &syn_ack, &[], isn.plus(1)).await;
                inner.control_ack = Some(isn.plus(1));
                self.set_state(inner, ConnectionState::SynRcvd);
            }
            ConnectionState::SynSent if header.is_ack() => {
                if Some(header.ack_num) != inner.control_ack {
                    debug!("SYN+ACK acknowledges {} rather than {:?} - ignoring", header.ack_num, inner.control_ack);
                    return AfterSegment::Continue;
                }
                inner.message_pool.ack_to_num(header.ack_num);
                inner.control_ack = None;
                inner.peer_seq = header.seq_num.plus(1);
                inner.seq_num = header.ack_num;
                inner.snd_una = header.ack_num;

                self.send_ack(inner).await;
                self.set_state(inner, ConnectionState::Established);
                self.notifier.send_ready(self.peer_addr);
            }
            ConnectionState::Established | ConnectionState::FinWait1 | ConnectionState::FinWait2 | ConnectionState::TimeWait if header.is_ack() => {
                debug!("duplicate SYN+ACK from {:?} - re-sending final ACK", self.peer_addr);
                self.send_ack(inner).await;
            }
            state => {
                debug!("unexpected SYN in state {} - ignoring", state);
            }
        }
        AfterSegment::Continue
    }

    async fn on_fin(&self, inner: &mut ConnectionInner, header: &RudpHeader) -> AfterSegment {
        match inner.state {
            ConnectionState::Established => {
                self.on_passive_fin(inner, header).await;
            }
            ConnectionState::SynRcvd if header.is_ack() && header.seq_num == inner.peer_seq && Some(header.ack_num) == inner.control_ack => {
                debug!("FIN from {:?} completes the handshake", self.peer_addr);
                self.establish_passive(inner);
                self.on_passive_fin(inner, header).await;
            }
            ConnectionState::FinWait1 => {
                if header.is_ack() && Some(header.ack_num) == inner.control_ack {
                    inner.message_pool.ack_to_num(header.ack_num);
                    inner.control_ack = None;
                    self.set_state(inner, ConnectionState::FinWait2);
                    self.on_peer_fin(inner, header).await;
                }
                else if header.seq_num == inner.peer_seq {
                    debug!("simultaneous close with {:?}", self.peer_addr);
                    inner.peer_seq = inner.peer_seq.plus(1);
                    self.enter_time_wait(inner).await;
                }
            }
            ConnectionState::FinWait2 => {
                self.on_peer_fin(inner, header).await;
            }
            ConnectionState::TimeWait => {
                debug!("retransmitted FIN from {:?} - re-sending final ACK", self.peer_addr);
                self.send_ack(inner).await;
            }
            state => {
                debug!("FIN in state {} - ignoring", state);
            }
        }
        AfterSegment::Continue
    }

    async fn on_passive_fin(&self, inner: &mut ConnectionInner, header: &RudpHeader) {
        if header.seq_num != inner.peer_seq {
            debug!("FIN {} does not match expected sequence number {} - ignoring", header.seq_num, inner.peer_seq);
            return;
        }
        if header.is_ack() && inner.message_pool.get(header.ack_num).is_some() {
            self.on_data_ack(inner, header).await;
        }

        inner.peer_seq = inner.peer_seq.plus(1);
        self.set_state(inner, ConnectionState::CloseWait);

        if self.send_buffer.lock().await.has_unsent() {
            warn!("peer {:?} closed the connection - discarding unsent data", self.peer_addr);
        }
        self.send_fin(inner).await;
        self.set_state(inner, ConnectionState::LastAck);
    }

    async fn on_peer_fin(&self, inner: &mut ConnectionInner, header: &RudpHeader) {
        if header.seq_num != inner.peer_seq {
            debug!("FIN {} does not match expected sequence number {} - ignoring", header.seq_num, inner.peer_seq);
            return;
        }
        inner.peer_seq = inner.peer_seq.plus(1);
        self.enter_time_wait(inner).await;
    }

    async fn enter_time_wait(&self, inner: &mut ConnectionInner) {
        self.send_ack(inner).await;
        self.set_state(inner, ConnectionState::TimeWait);

        let connection = self.self_ref.clone();
        let linger = self.config.time_wait_linger;
        inner.linger_handle = Some(tokio::spawn(async move {
            time::sleep(linger).await;
            if let Some(connection) = connection.upgrade() {
                trace!("linger period for {:?} expired", connection.peer_addr);
                connection.terminate(None).await;
            }
        }));
    }

    async fn send_fin(&self, inner: &mut ConnectionInner) {
        let seq = inner.seq_num;
        let header = self.header(inner, seq, inner.peer_seq, HeaderFlags::FIN | HeaderFlags::ACK);
        self.send_reliable(inner, &header, &[], seq.plus(1)).await;
        inner.control_ack = Some(seq.plus(1));
        inner.seq_num = seq.plus(1);
        inner.close_pending = false;
    }

    async fn on_ack(&self, inner: &mut ConnectionInner, header: &RudpHeader) -> AfterSegment {
        if header.ack_num == SeqNum::ZERO {
            trace!("window update from {:?}: {}", self.peer_addr, header.recv_window);
            if header.recv_window > 0 {
                let mut send_buffer = self.send_buffer.lock().await;
                send_buffer.set_win(u32::from(header.recv_window));
                self.pump(inner, &mut send_buffer).await;
            }
            return AfterSegment::Continue;
        }

        if inner.message_pool.get(header.ack_num).is_none() {
            trace!("stale ack {} - ignoring", header.ack_num);
            return AfterSegment::Continue;
        }

        let is_control_ack = Some(header.ack_num) == inner.control_ack;
        match inner.state {
            ConnectionState::SynRcvd if is_control_ack => {
                self.establish_passive(inner);
            }
            ConnectionState::FinWait1 if is_control_ack => {
                inner.message_pool.ack_to_num(header.ack_num);
                inner.control_ack = None;
                self.set_state(inner, ConnectionState::FinWait2);
            }
            ConnectionState::LastAck if is_control_ack => {
                if self.terminate_locked(inner) {
                    return AfterSegment::Terminated;
                }
            }
            _ if is_control_ack => {
                trace!("late ack for our FIN in state {}", inner.state);
                inner.message_pool.ack_to_num(header.ack_num);
                inner.control_ack = None;
            }
            _ => {
                self.on_data_ack(inner, header).await;
            }
        }
        AfterSegment::Continue
    }

    fn establish_passive(&self, inner: &mut ConnectionInner) {
        let Some(syn_ack) = inner.control_ack.take() else { return; };
        inner.message_pool.ack_to_num(syn_ack);
        inner.seq_num = syn_ack;
        inner.snd_una = syn_ack;
        self.set_state(inner, ConnectionState::Established);
        self.notifier.send_ready(self.peer_addr);
    }

    async fn on_data_ack(&self, inner: &mut ConnectionInner, header: &RudpHeader) {
        let ack_num = header.ack_num;
        if !inner.snd_una.is_before(ack_num) || !ack_num.is_before_or_at(inner.seq_num) {
            trace!("ack {} outside of the send window {}..{} - ignoring", ack_num, inner.snd_una, inner.seq_num);
            return;
        }

        inner.message_pool.ack_to_num(ack_num);
        let num_packets = ack_num.distance_from(inner.snd_una) as usize / self.config.packet_size;
        inner.snd_una = ack_num;

        let mut send_buffer = self.send_buffer.lock().await;
        let freed = send_buffer.ack(num_packets);
        if header.recv_window > 0 {
            let win = u32::from(header.recv_window).min(send_buffer.cwnd());
            send_buffer.set_win(win);
        }
        self.pump(inner, &mut send_buffer).await;
        if freed {
            self.notifier.send_ready(self.peer_addr);
        }

        if inner.close_pending && send_buffer.is_empty() {
            drop(send_buffer);
            debug!("all data to {:?} acknowledged - sending pending FIN", self.peer_addr);
            self.send_fin(inner).await;
            self.set_state(inner, ConnectionState::FinWait1);
        }
    }

    /// sends the buffered packets the window allows
    async fn pump(&self, inner: &mut ConnectionInner, send_buffer: &mut SendWindowBuffer) {
        if inner.state != ConnectionState::Established {
            return;
        }

        for packet in send_buffer.get_data() {
            let seq = inner.seq_num;
            let expected_ack = seq.plus(self.config.packet_size_u32());
            let header = self.header(inner, seq, inner.peer_seq, HeaderFlags::empty());
            trace!("sending data {} to {:?}", seq, self.peer_addr);
            self.send_reliable(inner, &header, &packet, expected_ack).await;
            inner.seq_num = expected_ack;
        }
    }

    async fn on_data(&self, inner: &mut ConnectionInner, segment: &Segment) -> Result<(), RudpError> {
        let header = &segment.header;

        if inner.state == ConnectionState::SynRcvd && header.seq_num == inner.peer_seq && Some(header.ack_num) == inner.control_ack {
            debug!("data from {:?} completes the handshake", self.peer_addr);
            self.establish_passive(inner);
        }
        if !inner.state.can_receive_data() {
            return Err(RudpError::InvalidState(inner.state));
        }
        if segment.payload.len() != self.config.packet_size {
            return Err(RudpError::MalformedLength { expected: self.config.packet_size, actual: segment.payload.len() });
        }

        if header.seq_num == inner.peer_seq {
            if !inner.receive_buffer.add(&segment.payload) {
                return Err(RudpError::BufferFull);
            }
            inner.peer_seq = inner.peer_seq.plus(self.config.packet_size_u32());
            self.send_ack(inner).await;
            self.notifier.data_ready(self.peer_addr);
            Ok(())
        }
        else if header.seq_num.is_before(inner.peer_seq) {
            self.send_ack(inner).await;
            Err(RudpError::DuplicateOrStale { seq: header.seq_num, expected: inner.peer_seq })
        }
        else {
            Err(RudpError::OutOfOrder { seq: header.seq_num, expected: inner.peer_seq })
        }
    }

    /// Appends a packet to the send buffer and sends whatever the window allows. Returns
    ///  `Ok(false)` if the send buffer is full, in which case the application should retry after
    ///  the next `on_send_ready` notification.
    pub async fn append_send(&self, data: &[u8]) -> Result<bool, RudpError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Established if !inner.close_pending => {}
            ConnectionState::Closed | ConnectionState::Listen | ConnectionState::SynSent | ConnectionState::SynRcvd => {
                return Err(RudpError::UseBeforeConnect);
            }
            state => return Err(RudpError::InvalidState(state)),
        }
        if data.len() != self.config.packet_size {
            return Err(RudpError::MalformedLength { expected: self.config.packet_size, actual: data.len() });
        }

        let mut send_buffer = self.send_buffer.lock().await;
        let added = send_buffer.add(data);
        self.pump(&mut inner, &mut send_buffer).await;
        Ok(added)
    }

    /// Takes the oldest received packet. If this re-opens a closed receive window, the peer is
    ///  informed by a window update.
    pub async fn consume_receive(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().await;
        let window_was_closed = inner.receive_buffer.get_window() == 0;
        let data = inner.receive_buffer.pop()?;

        if window_was_closed && inner.state != ConnectionState::Closed {
            debug!("receive window re-opened - sending window update to {:?}", self.peer_addr);
            let header = self.header(&inner, inner.seq_num, SeqNum::ZERO, HeaderFlags::ACK);
            self.send_unreliable(&header).await;
        }
        Some(data)
    }

    /// Starts the active close. The FIN is sent once all buffered data is acknowledged.
    pub async fn close(&self) -> Result<(), RudpError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Established => {
                if inner.close_pending {
                    return Ok(());
                }
                if self.send_buffer.lock().await.is_empty() {
                    self.send_fin(&mut inner).await;
                    self.set_state(&mut inner, ConnectionState::FinWait1);
                }
                else {
                    debug!("close requested - waiting for buffered data to be acknowledged");
                    inner.close_pending = true;
                }
                Ok(())
            }
            ConnectionState::FinWait1 | ConnectionState::FinWait2 | ConnectionState::TimeWait | ConnectionState::CloseWait | ConnectionState::LastAck => {
                debug!("close requested in state {} - already closing", inner.state);
                Ok(())
            }
            ConnectionState::Closed => Err(RudpError::UseBeforeConnect),
            state => Err(RudpError::InvalidState(state)),
        }
    }

    /// Terminates the connection, releasing its resources and informing the owner
    pub async fn terminate(&self, lost: Option<RudpError>) {
        let terminated = {
            let mut inner = self.inner.lock().await;
            self.terminate_locked(&mut inner)
        };
        if terminated {
            self.notify_terminated(lost).await;
        }
    }

    /// Releases the connection's resources without informing the owner, for shutting down
    pub async fn abort(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.linger_handle.take() {
            handle.abort();
        }
        self.terminate_locked(&mut inner);
    }

    /// returns `false` if the connection was terminated before
    fn terminate_locked(&self, inner: &mut ConnectionInner) -> bool {
        if inner.state == ConnectionState::Closed {
            return false;
        }
        self.set_state(inner, ConnectionState::Closed);
        inner.message_pool.clear();
        inner.control_ack = None;
        inner.close_pending = false;
        // a linger task that is still pending finds the connection closed
        inner.linger_handle = None;
        true
    }

    async fn notify_terminated(&self, lost: Option<RudpError>) {
        if let Some(error) = lost {
            self.notifier.connection_lost(self.peer_addr, error);
        }
        match self.owner.upgrade() {
            Some(owner) => owner.on_connection_terminated(self.peer_addr).await,
            None => debug!("owner of connection {:?} is gone", self.peer_addr),
        }
    }
}

#[async_trait]
impl RetransmissionObserver for Connection {
    async fn on_retransmit(&self, expected_ack: SeqNum, retries: u32) {
        trace!("retransmission #{} for ack {} - congestion signal", retries, expected_ack);
        self.send_buffer.lock().await.find_cong();
    }

    async fn on_exhausted(&self, expected_ack: SeqNum, retries: u32) {
        warn!("{:?}: {}", self.peer_addr, RudpError::RetransmissionExhausted { expected_ack, retries });
        self.terminate(Some(RudpError::ConnectionLost(self.peer_addr))).await;
    }
}
