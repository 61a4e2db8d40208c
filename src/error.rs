use std::net::SocketAddr;
use thiserror::Error;
use crate::seq_num::SeqNum;
use crate::state::ConnectionState;

/// Protocol level outcomes. Most of these are handled inside the protocol (dropping or
///  re-acknowledging a datagram) and only show up in logs; `ConnectionLost` is reported to the
///  application through the notification interface, and the API level variants are returned to
///  the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RudpError {
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("payload length {actual} does not match the packet size {expected}")]
    MalformedLength { expected: usize, actual: usize },
    #[error("packet {seq} arrived out of order, expecting {expected}")]
    OutOfOrder { seq: SeqNum, expected: SeqNum },
    #[error("packet {seq} was received before, expecting {expected}")]
    DuplicateOrStale { seq: SeqNum, expected: SeqNum },
    #[error("buffer full")]
    BufferFull,
    #[error("no connection for peer {0:?}")]
    UnknownPeer(SocketAddr),
    #[error("no ack for {expected_ack} after {retries} retransmissions")]
    RetransmissionExhausted { expected_ack: SeqNum, retries: u32 },
    #[error("connection to {0:?} lost")]
    ConnectionLost(SocketAddr),
    #[error("connection is not established")]
    UseBeforeConnect,
    #[error("operation not possible in state {0}")]
    InvalidState(ConnectionState),
}
