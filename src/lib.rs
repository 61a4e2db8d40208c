//! rUDP is a miniature TCP on top of UDP: a reliable, connection-oriented, in-order byte transport
//!  between a client and a server, built from UDP datagrams.
//!
//! ## Design goals
//!
//! * connection establishment by a three-way handshake (SYN, SYN+ACK, ACK) and teardown by a
//!   FIN / ACK exchange in both directions, with a linger period on the side that closes first
//! * in-order delivery: the receiver only buffers the packet it expects next, everything else is
//!   dropped or re-acknowledged, and the sender retransmits until acknowledged
//! * acknowledgments are cumulative
//! * retransmission with exponential backoff, giving up after a configurable number of retries
//! * flow control through the receiver's advertised window, and congestion control (slow start,
//!   congestion avoidance) on the sender's side
//! * a per-datagram checksum
//! * the application sends and receives fixed-size packets (`packet_size` bytes, 1024 by
//!   default)
//!
//! Out of scope are selective acks, fast retransmit, RTT estimation, path MTU discovery and
//!  encryption.
//!
//! ## Header
//!
//! Every datagram starts with a 20 byte header, all numbers in network byte order (BE):
//! ```ascii
//!  0: source port (u16)
//!  2: destination port (u16)
//!  4: sequence number (u32)
//!  8: acknowledgment number (u32)
//! 12: data offset (4 bits), reserved (3 bits), NS (1 bit)
//! 13: flags (8 bits): CWR ECE URG ACK PSH RST SYN FIN
//! 14: receive window (u16) - in packets
//! 16: checksum (u16)
//! 18: urgent pointer (u16)
//! ```
//!
//! The checksum is the one's complement of the one's complement sum over the header (with the
//!  checksum field zeroed) and the payload.
//!
//! Sequence numbers count bytes. The initial sequence number is random, SYN and FIN count as one
//!  byte each, and a data packet advances the sequence number by `packet_size`. A datagram
//!  acknowledging a message carries the sequence number following it.
//!
//! An ACK with acknowledgment number 0 is a window update: it is sent when the receiver's
//!  application consumes data from a full receive buffer, re-opening the window. Sequence numbers
//!  skip 0 when they wrap around, so a regular acknowledgment is never 0.
//!
//! ## API
//!
//! [client::RudpClient] connects to a single server, [dispatcher::Dispatcher] accepts
//!  connections from any number of clients on a single socket. The application is informed
//!  about received data, available send buffer and closed connections through the
//!  [notification::RudpNotification] trait.

pub mod checksum;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod header;
pub mod message;
pub mod message_pool;
pub mod notification;
pub mod receive_buffer;
pub mod ring_buffer;
pub mod send_buffer;
pub mod send_pipeline;
pub mod seq_num;
pub mod state;

#[cfg(test)]
mod test_util;
