//! The send buffer holds outbound packets from the moment the application hands them over until
//!  the peer acknowledges them. It also does congestion control, which is a simplified version of
//!  TCP's (RFC 5681): slow start and congestion avoidance, driven by acks and by
//!  retransmissions, without RTT measurements or fast recovery.
//!
//! ```ascii
//!  last_byte_acked        last_byte_sent           last_byte_ready
//!        |   sent, unacked     |   buffered, unsent     |
//!  ------+---------------------+------------------------+-------
//! ```

use bytes::Bytes;
use tracing::{debug, instrument, trace};
use crate::config::RudpConfig;
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongState {
    /// no data was buffered yet
    Shaking,
    SlowStart,
    CongAvoid,
}

pub struct SendWindowBuffer {
    /// head is `last_byte_acked`, tail is `last_byte_ready`
    ring: RingBuffer,
    /// number of packets between `last_byte_acked` and `last_byte_sent`
    num_sent: usize,

    state: CongState,
    cwnd: u32,
    ssthresh: u32,
    win: u32,
    /// packets acknowledged since the last cwnd increment in congestion avoidance
    acked_in_window: u32,

    config_initial_ssthresh: u32,
    config_max_win: u32,
}

impl SendWindowBuffer {
    pub fn new(config: &RudpConfig) -> SendWindowBuffer {
        SendWindowBuffer {
            ring: RingBuffer::new(config.send_buffer_capacity, config.packet_size),
            num_sent: 0,
            state: CongState::Shaking,
            cwnd: 0,
            ssthresh: 0,
            win: 0,
            acked_in_window: 0,
            config_initial_ssthresh: config.initial_ssthresh,
            config_max_win: config.max_send_window,
        }
    }

    #[cfg(test)]
    pub fn set_internals(&mut self, state: CongState, cwnd: u32, ssthresh: u32, win: u32) {
        self.state = state;
        self.cwnd = cwnd;
        self.ssthresh = ssthresh;
        self.win = win;
    }

    pub fn state(&self) -> CongState {
        self.state
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn win(&self) -> u32 {
        self.win
    }

    /// bytes that are buffered and not yet acknowledged
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn in_flight_packets(&self) -> usize {
        self.num_sent
    }

    pub fn has_unsent(&self) -> bool {
        self.num_sent < self.ring.num_packets()
    }

    /// Appends a packet. Returns `false` if the buffer is full, in which case the caller must
    ///  hold the data back until acknowledgments free up space.
    #[must_use]
    pub fn add(&mut self, packet: &[u8]) -> bool {
        if !self.ring.push(packet) {
            trace!("send buffer full");
            return false;
        }

        if self.state == CongState::Shaking {
            self.cwnd = 1;
            self.win = 1;
            self.ssthresh = self.config_initial_ssthresh;
            self.state = CongState::SlowStart;
            debug!("first data buffered - starting slow start with ssthresh {}", self.ssthresh);
        }
        true
    }

    /// Returns the packets that may be sent now, i.e. the unsent packets that fit into the
    ///  window together with those already in flight, and marks them as sent.
    pub fn get_data(&mut self) -> Vec<Bytes> {
        let mut result = Vec::new();
        while self.num_sent < self.win as usize {
            match self.ring.packet_at(self.num_sent) {
                Some(packet) => result.push(Bytes::copy_from_slice(packet)),
                None => break,
            }
            self.num_sent += 1;
        }
        result
    }

    /// Registers the acknowledgment of the oldest `num_packets` in-flight packets, growing cwnd.
    ///  Returns `true` if this freed space in the buffer.
    #[instrument(skip(self))]
    pub fn ack(&mut self, num_packets: usize) -> bool {
        let num_packets = self.ring.discard(num_packets.min(self.num_sent));
        self.num_sent -= num_packets;

        for _ in 0..num_packets {
            match self.state {
                CongState::Shaking => {}
                CongState::SlowStart => {
                    self.cwnd += 1;
                    if self.cwnd >= self.ssthresh {
                        debug!("cwnd {} reached ssthresh - congestion avoidance", self.cwnd);
                        self.state = CongState::CongAvoid;
                        self.acked_in_window = 0;
                    }
                }
                CongState::CongAvoid => {
                    self.acked_in_window += 1;
                    if self.acked_in_window >= self.cwnd {
                        self.acked_in_window = 0;
                        self.cwnd += 1;
                    }
                }
            }
        }

        if num_packets > 0 {
            trace!("acknowledged {} packets, cwnd is {}", num_packets, self.cwnd);
        }
        num_packets > 0
    }

    /// congestion signal: a packet had to be retransmitted
    pub fn find_cong(&mut self) {
        if self.state != CongState::CongAvoid {
            return;
        }
        self.ssthresh = self.cwnd / 2;
        self.cwnd = 1;
        self.win = self.win.min(self.cwnd);
        self.acked_in_window = 0;
        self.state = CongState::SlowStart;
        debug!("retransmission in congestion avoidance - back to slow start, ssthresh {}", self.ssthresh);
    }

    /// sets the window based on the peer's advertised receive window
    pub fn set_win(&mut self, advertised: u32) {
        self.win = advertised
            .min(self.cwnd)
            .min(self.config_max_win);
    }
}
