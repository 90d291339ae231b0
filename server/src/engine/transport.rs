use std::time::Duration;

use thiserror::Error;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is going away (page navigation, server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One frame on the persistent connection. Protocol-agnostic: the web layer
/// converts WebSocket messages to and from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<u16>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("transport error: {0}")]
    Io(String),
}

/// Close codes a well-behaved peer sends when it simply goes away.
pub fn is_expected_close(code: Option<u16>) -> bool {
    matches!(
        code,
        None | Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY) | Some(CLOSE_ABNORMAL)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_close_codes() {
        assert!(is_expected_close(None));
        assert!(is_expected_close(Some(1000)));
        assert!(is_expected_close(Some(1001)));
        assert!(is_expected_close(Some(1006)));
        assert!(!is_expected_close(Some(1008)));
        assert!(!is_expected_close(Some(1011)));
    }
}
