use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::header::RudpHeader;

/// maximum UDP payload for IPV4 (65535 - 20 bytes IP header - 8 bytes UDP header)
pub const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Debug, Clone)]
pub struct RudpConfig {
    /// The address the UDP socket is bound to. Port 0 lets the operating system pick an
    ///  ephemeral port.
    pub self_addr: SocketAddr,

    /// This is the number of payload bytes in every data datagram. RUDP does not frame partial
    ///  packets: the application is expected to pad short messages to exactly this size, and
    ///  data datagrams with a different payload length are dropped by the receiver.
    ///
    /// Both sides of a connection must agree on this value - it is not negotiated.
    pub packet_size: usize,

    /// Capacity of the send buffer in bytes. Must be a multiple of `packet_size`.
    pub send_buffer_capacity: usize,
    /// Capacity of the receive buffer in bytes. Must be a multiple of `packet_size`. The
    ///  advertised receive window is derived from the free part of this buffer.
    pub receive_buffer_capacity: usize,

    /// slow start threshold (in packets) that is set when the first data is buffered
    pub initial_ssthresh: u32,
    /// upper bound for the number of packets in flight, regardless of cwnd and the peer's
    ///  advertised window
    pub max_send_window: u32,

    /// This is the basic time unit for retransmission: an unacknowledged datagram is re-sent
    ///  after this timeout, which is doubled on every re-send.
    pub base_retransmit_timeout: Duration,
    /// When doubling would make the retransmission timeout exceed this value, it starts over
    ///  at `base_retransmit_timeout`.
    pub max_retransmit_timeout: Duration,
    /// The number of re-sends of a single datagram after which the peer is considered
    ///  unreachable and the connection is dropped.
    pub max_retransmissions: u32,

    /// time spent in TIME_WAIT before resources are released
    pub time_wait_linger: Duration,

    /// Receive loops poll their socket with this timeout so they notice when they are shut down
    pub listener_poll_interval: Duration,
}

impl RudpConfig {
    pub fn default_ipv4() -> RudpConfig {
        Self::new(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn new(self_addr: SocketAddr) -> RudpConfig {
        let packet_size = 1024;
        RudpConfig {
            self_addr,
            packet_size,
            send_buffer_capacity: 32 * packet_size,
            receive_buffer_capacity: 32 * packet_size,
            initial_ssthresh: 10,
            max_send_window: 10,
            base_retransmit_timeout: Duration::from_secs(1),
            max_retransmit_timeout: Duration::from_secs(8),
            max_retransmissions: 16,
            time_wait_linger: Duration::from_secs(30),
            listener_poll_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_size == 0 {
            bail!("packet size must not be 0");
        }
        if self.packet_size + RudpHeader::SERIALIZED_LEN > MAX_UDP_PAYLOAD {
            bail!("packet size {} does not fit into a UDP datagram", self.packet_size);
        }
        if self.send_buffer_capacity == 0 || self.send_buffer_capacity % self.packet_size != 0 {
            bail!("send buffer capacity {} must be a non-zero multiple of the packet size {}", self.send_buffer_capacity, self.packet_size);
        }
        if self.receive_buffer_capacity == 0 || self.receive_buffer_capacity % self.packet_size != 0 {
            bail!("receive buffer capacity {} must be a non-zero multiple of the packet size {}", self.receive_buffer_capacity, self.packet_size);
        }
        if self.initial_ssthresh == 0 {
            bail!("initial ssthresh must be at least 1");
        }
        if self.max_send_window == 0 {
            bail!("max send window must be at least 1");
        }
        if self.base_retransmit_timeout.is_zero() {
            bail!("base retransmit timeout must be positive");
        }
        if self.max_retransmit_timeout < self.base_retransmit_timeout {
            bail!("max retransmit timeout must not be smaller than the base timeout");
        }
        if self.max_retransmissions == 0 {
            bail!("max retransmissions must be at least 1");
        }
        Ok(())
    }

    pub(crate) fn packet_size_u32(&self) -> u32 {
        // validate() bounds packet_size well below u32::MAX
        self.packet_size as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        RudpConfig::default_ipv4().validate().unwrap();
    }

    #[rstest]
    #[case::zero_packet_size(|c: &mut RudpConfig| c.packet_size = 0)]
    #[case::huge_packet_size(|c: &mut RudpConfig| c.packet_size = 65_500)]
    #[case::send_capacity_not_aligned(|c: &mut RudpConfig| c.send_buffer_capacity = 1500)]
    #[case::receive_capacity_zero(|c: &mut RudpConfig| c.receive_buffer_capacity = 0)]
    #[case::zero_ssthresh(|c: &mut RudpConfig| c.initial_ssthresh = 0)]
    #[case::zero_window(|c: &mut RudpConfig| c.max_send_window = 0)]
    #[case::zero_timeout(|c: &mut RudpConfig| c.base_retransmit_timeout = Duration::ZERO)]
    #[case::max_below_base(|c: &mut RudpConfig| c.max_retransmit_timeout = Duration::from_millis(500))]
    #[case::no_retries(|c: &mut RudpConfig| c.max_retransmissions = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut RudpConfig)) {
        let mut config = RudpConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
