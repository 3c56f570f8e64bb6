use std::sync::{Arc, OnceLock};

use session_driver::Session;
use terminal_protocol::Frame;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::server::connect::ConnectOptions;

/// Outbound frames buffered per connection
pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Key frames buffered ahead of the session's input
pub(crate) const INPUT_QUEUE_DEPTH: usize = 64;

/// Lifecycle of one WebSocket connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    AwaitingConnect,
    Streaming,
    Exiting,
    Closed,
}

/// Item on the outbound queue
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// Close the socket after everything queued before it
    Close,
}

/// The session bound to a connection, the options it was started with, and
/// the queue feeding its input
pub(crate) struct Bound {
    pub session: Arc<Session>,
    pub options: ConnectOptions,
    pub input: mpsc::Sender<Vec<u8>>,
}

/// Per-connection context shared by the tasks serving one WebSocket.
///
/// The outbound queue is the only path to the socket; exactly one task
/// drains it.
pub(crate) struct Connection {
    pub id: Uuid,
    state: watch::Sender<ConnectionState>,
    bound: OnceLock<Bound>,
    outbound: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: watch::Sender::new(ConnectionState::Idle),
            bound: OnceLock::new(),
            outbound,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next`. `Closed` is terminal.
    pub fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            debug!(from = ?*current, to = ?next, "connection state");
            *current = next;
            true
        });
    }

    /// Bind a session. Returns `false` if one was already bound.
    pub fn bind(
        &self,
        session: Arc<Session>,
        options: ConnectOptions,
        input: mpsc::Sender<Vec<u8>>,
    ) -> bool {
        self.bound
            .set(Bound {
                session,
                options,
                input,
            })
            .is_ok()
    }

    pub fn bound(&self) -> Option<&Bound> {
        self.bound.get()
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.bound.get().map(|b| &b.session)
    }

    /// Queue a frame. `false` once the writer is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.outbound.send(Outbound::Frame(frame)).await.is_ok()
    }

    /// Queue a close after everything already queued
    pub async fn send_close(&self) {
        let _ = self.outbound.send(Outbound::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_stop_at_closed() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.set_state(ConnectionState::AwaitingConnect);
        conn.set_state(ConnectionState::Streaming);
        assert_eq!(conn.state(), ConnectionState::Streaming);

        conn.set_state(ConnectionState::Closed);
        conn.set_state(ConnectionState::Exiting);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Connection::new(tx);

        assert!(conn.send(Frame::HeartBeat(None)).await);
        conn.send_close().await;
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Frame(Frame::HeartBeat(None)))
        ));
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));

        drop(rx);
        assert!(!conn.send(Frame::HeartBeat(None)).await);
    }

    #[test]
    fn unbound_connection_has_no_session() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);
        assert!(conn.session().is_none());
        assert!(conn.bound().is_none());
    }
}
