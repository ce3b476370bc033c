// ============================
// crates/backend-lib/src/connection.rs
// ============================
//! Live transport endpoints.
//!
//! A [`ConnectionHandle`] is the write side of one WebSocket: a bounded queue
//! drained by the socket's writer task. Cloning a handle is cheap; every clone
//! pushes into the same queue. Once the writer task is gone the queue is
//! closed and every push fails with [`PushError::Closed`].
use chat_relay_common::ServerToClient;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique id of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a push did not reach the connection's queue
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("push to connection {0} timed out")]
    TimedOut(ConnectionId),
}

/// Writable endpoint of a live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerToClient>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerToClient>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: ConnectionId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True once the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue an event for this connection, waiting at most `timeout` for room
    pub async fn push(&self, event: ServerToClient, timeout: Duration) -> Result<(), PushError> {
        match tokio::time::timeout(timeout, self.tx.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PushError::Closed(self.id)),
            Err(_) => Err(PushError::TimedOut(self.id)),
        }
    }
}

/// Two handles are the same endpoint when their ids match
impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ServerToClient {
        ServerToClient::Identified {
            identity: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_push_reaches_receiver() {
        let (handle, mut rx) = ConnectionHandle::channel(4);
        handle.push(event(), Duration::from_millis(100)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerToClient::Identified { .. })));
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let (handle, rx) = ConnectionHandle::channel(4);
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.push(event(), Duration::from_millis(100)).await,
            Err(PushError::Closed(handle.id()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_to_full_queue_times_out() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        handle.push(event(), Duration::from_millis(100)).await.unwrap();
        assert_eq!(
            handle.push(event(), Duration::from_millis(100)).await,
            Err(PushError::TimedOut(handle.id()))
        );
    }

    #[test]
    fn test_clones_compare_equal() {
        let (a, _rx_a) = ConnectionHandle::channel(1);
        let (b, _rx_b) = ConnectionHandle::channel(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
