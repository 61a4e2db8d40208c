use bytes::Bytes;

/// A fixed-capacity circular byte buffer that stores fixed-size packets. Capacity is a multiple
///  of the packet size and all offsets are packet-aligned, so a packet never wraps around the
///  end of the backing buffer.
pub struct RingBuffer {
    buf: Vec<u8>,
    packet_size: usize,
    /// offset of the oldest buffered byte
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize, packet_size: usize) -> RingBuffer {
        assert!(packet_size > 0 && capacity % packet_size == 0, "capacity must be a multiple of the packet size");

        RingBuffer {
            buf: vec![0; capacity],
            packet_size,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// number of buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_packets(&self) -> usize {
        self.len / self.packet_size
    }

    pub fn free_packets(&self) -> usize {
        (self.capacity() - self.len) / self.packet_size
    }

    fn offset(&self, packet_index: usize) -> usize {
        (self.head + packet_index * self.packet_size) % self.capacity()
    }

    /// Appends a packet at the tail. Returns `false` without modifying the buffer if there is
    ///  no room.
    #[must_use]
    pub fn push(&mut self, packet: &[u8]) -> bool {
        debug_assert_eq!(packet.len(), self.packet_size);

        if self.free_packets() == 0 {
            return false;
        }
        let tail = self.offset(self.num_packets());
        self.buf[tail..tail + self.packet_size].copy_from_slice(packet);
        self.len += self.packet_size;
        true
    }

    /// The packet at a given position counted from the head, if it is buffered
    pub fn packet_at(&self, packet_index: usize) -> Option<&[u8]> {
        if packet_index >= self.num_packets() {
            return None;
        }
        let offs = self.offset(packet_index);
        Some(&self.buf[offs..offs + self.packet_size])
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        let result = Bytes::copy_from_slice(self.packet_at(0)?);
        self.discard(1);
        Some(result)
    }

    /// removes up to `num_packets` packets from the head, returning the number actually removed
    pub fn discard(&mut self, num_packets: usize) -> usize {
        let num_packets = num_packets.min(self.num_packets());
        self.head = self.offset(num_packets);
        self.len -= num_packets * self.packet_size;
        num_packets
    }
}
