//! Shared error types for CapTP.

use crate::slot::Slot;
use thiserror::Error;

/// Why a promise, a send, or a single inbound message failed.
///
/// Cloneable because one settlement may be observed by many waiters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapTpError {
    /// A message broke the protocol. Only that message is dropped.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A slot in an inbound message is not in our tables.
    #[error("Unknown slot {0}")]
    UnknownSlot(Slot),

    /// The peer reported an application-level failure for a call.
    #[error("Remote rejection: {0}")]
    RemoteRejection(String),

    /// The connection is gone; nothing further will be delivered.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A value could not be converted to or from its wire form.
    #[error("Marshal error: {0}")]
    Marshal(String),
}

impl CapTpError {
    /// Whether this error is terminal for the connection.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, CapTpError::ConnectionClosed(_))
    }
}

/// Alias for Result with CapTpError.
pub type CapTpResult<T> = Result<T, CapTpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotKind;

    #[test]
    fn test_display() {
        let err = CapTpError::UnknownSlot(Slot::local(SlotKind::Object, 9));
        assert_eq!(err.to_string(), "Unknown slot o+9");
        let closed = CapTpError::ConnectionClosed("peer went away".into());
        assert!(closed.is_connection_closed());
        assert!(!CapTpError::Marshal("x".into()).is_connection_closed());
    }
}
