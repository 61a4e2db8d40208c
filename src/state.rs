use std::fmt::{Display, Formatter};

/// The states of a connection. Client and server roles share this type: `Listen` and `SynRcvd`
///  only occur for server-side (passive open) connections, `SynSent` only for client-side ones.
///  Either side can perform the active or the passive close.
///
/// ```text
/// active open:  Closed --SYN--> SynSent --SYN+ACK / ACK--> Established
/// passive open: Listen --SYN / SYN+ACK--> SynRcvd --ACK--> Established
///
/// active close:  Established --FIN--> FinWait1 --ACK--> FinWait2 --FIN / ACK--> TimeWait --linger--> Closed
/// passive close: Established --FIN / FIN+ACK--> CloseWait -> LastAck --ACK--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    TimeWait,
    CloseWait,
    LastAck,
}

impl ConnectionState {
    /// states in which inbound data packets are accepted
    pub fn can_receive_data(&self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::FinWait1 | ConnectionState::FinWait2)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynRcvd => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
        };
        write!(f, "{}", s)
    }
}
