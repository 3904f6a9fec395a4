//! WebSocket close codes with protocol meaning.
//!
//! Only a handful of codes drive the connection lifecycle: 1000 and 1006
//! send a client back into its reconnect loop, 1001 is terminal, 1002 is
//! what a server answers to an undecodable frame.

/// Close codes the protocol assigns meaning to.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Server is shutting off; clients reconnect.
    ServerShuttingOff = 1000,
    /// Endpoint is going away for good; terminal for the peer.
    GoingAway = 1001,
    /// Peer sent a frame the codec rejected.
    ProtocolError = 1002,
    /// Transport dropped without a close handshake.
    Abnormal = 1006,
}

impl CloseCode {
    /// Map a raw wire code onto the protocol set, if it is one of ours.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1000 => Some(CloseCode::ServerShuttingOff),
            1001 => Some(CloseCode::GoingAway),
            1002 => Some(CloseCode::ProtocolError),
            1006 => Some(CloseCode::Abnormal),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether a client seeing this close should enter its reconnect loop.
    pub fn triggers_reconnect(value: u16) -> bool {
        matches!(
            Self::from_u16(value),
            Some(CloseCode::ServerShuttingOff) | Some(CloseCode::Abnormal)
        )
    }

    /// Whether this close ends the coordinator for good.
    pub fn is_terminal(value: u16) -> bool {
        Self::from_u16(value) == Some(CloseCode::GoingAway)
    }
}
