use bytes::Bytes;
use crate::config::RudpConfig;
use crate::ring_buffer::RingBuffer;

/// In-order packets that were received but not yet consumed by the application. The free part
///  of this buffer is advertised to the peer as the receive window.
pub struct ReceiveWindowBuffer {
    ring: RingBuffer,
}

impl ReceiveWindowBuffer {
    pub fn new(config: &RudpConfig) -> ReceiveWindowBuffer {
        ReceiveWindowBuffer {
            ring: RingBuffer::new(config.receive_buffer_capacity, config.packet_size),
        }
    }

    #[must_use]
    pub fn add(&mut self, packet: &[u8]) -> bool {
        self.ring.push(packet)
    }

    /// the advertised window in packets
    pub fn get_window(&self) -> u16 {
        u16::try_from(self.ring.free_packets())
            .unwrap_or(u16::MAX)
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.ring.pop()
    }
}
