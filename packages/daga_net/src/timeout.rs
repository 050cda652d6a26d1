//! Reads raced against a timer.
//!
//! Each guarded read spawns two tasks, the read itself and a sleep, and
//! resolves on whichever finishes first. The loser is not cancelled: its
//! result lands in a single-slot `oneshot` that nobody reads, so a late
//! completion never blocks. Side effects of an abandoned read still happen
//! (it may consume bytes, and it keeps the read half locked until it
//! finishes), so a connection that timed out should be treated as suspect.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::{Connection, NodeId};
use crate::error::NetError;
use crate::framing::{self, DatagramSocket};

/// Result of a supervised stream read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// The timer won. The node id was pushed on the timeout queue.
    TimedOut,
    /// The read failed. The node id was pushed on the disconnect queue.
    Disconnected,
}

impl ReadOutcome {
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// Sending side of the timeout and disconnect queues.
#[derive(Debug, Clone)]
pub struct LivenessNotifier {
    timed_out: mpsc::Sender<NodeId>,
    disconnected: mpsc::Sender<NodeId>,
}

/// Receiving side, drained by whoever reaps slow or dead peers.
#[derive(Debug)]
pub struct LivenessReceivers {
    pub timed_out: mpsc::Receiver<NodeId>,
    pub disconnected: mpsc::Receiver<NodeId>,
}

/// Create both queues. Size `capacity` to at least the number of peers so a
/// round of notifications never fills them.
pub fn liveness_channels(capacity: usize) -> (LivenessNotifier, LivenessReceivers) {
    let (timed_out_tx, timed_out_rx) = mpsc::channel(capacity.max(1));
    let (disconnected_tx, disconnected_rx) = mpsc::channel(capacity.max(1));
    (
        LivenessNotifier {
            timed_out: timed_out_tx,
            disconnected: disconnected_tx,
        },
        LivenessReceivers {
            timed_out: timed_out_rx,
            disconnected: disconnected_rx,
        },
    )
}

impl LivenessNotifier {
    pub fn notify_timed_out(&self, node: NodeId) {
        Self::notify(&self.timed_out, node, "timeout");
    }

    pub fn notify_disconnected(&self, node: NodeId) {
        Self::notify(&self.disconnected, node, "disconnect");
    }

    // Never waits: the supervising read must return within its timeout.
    fn notify(tx: &mpsc::Sender<NodeId>, node: NodeId, kind: &str) {
        match tx.try_send(node) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(node, kind, "liveness queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(node, kind, "liveness queue closed");
            }
        }
    }
}

/// Read one frame from `connection`, giving up after `timeout`.
pub async fn read_message_with_timeout<S>(
    node: NodeId,
    connection: &Arc<Connection<S>>,
    timeout: Duration,
    notifier: &LivenessNotifier,
) -> ReadOutcome
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_tx, read_rx) = oneshot::channel();
    let conn = Arc::clone(connection);
    tokio::spawn(async move {
        let _ = read_tx.send(conn.read_message().await);
    });

    let (timer_tx, timer_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = timer_tx.send(());
    });

    tokio::select! {
        // A read that resolved in the same poll as the timer wins.
        biased;

        result = read_rx => match result {
            Ok(Ok(body)) => ReadOutcome::Data(body),
            Ok(Err(err)) => {
                warn!(node, error = %err, "read failed, peer disconnected");
                notifier.notify_disconnected(node);
                ReadOutcome::Disconnected
            }
            Err(_) => {
                warn!(node, "read task dropped its result");
                notifier.notify_disconnected(node);
                ReadOutcome::Disconnected
            }
        },
        _ = timer_rx => {
            warn!(node, ?timeout, "read timed out");
            notifier.notify_timed_out(node);
            ReadOutcome::TimedOut
        }
    }
}

/// Receive one framed datagram, giving up after `timeout`.
///
/// Errors are returned directly rather than queued: a timeout is
/// [`NetError::Timeout`], anything else is the read error itself.
pub async fn read_datagram_with_timeout<D>(
    socket: &Arc<D>,
    expected_size: usize,
    timeout: Duration,
) -> Result<Vec<u8>, NetError>
where
    D: DatagramSocket + 'static,
{
    let (read_tx, read_rx) = oneshot::channel();
    let sock = Arc::clone(socket);
    tokio::spawn(async move {
        let _ = read_tx.send(framing::read_datagram(&*sock, expected_size).await);
    });

    let (timer_tx, timer_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = timer_tx.send(());
    });

    tokio::select! {
        biased;

        result = read_rx => match result {
            Ok(result) => result,
            Err(_) => Err(NetError::Transport(std::io::Error::other(
                "datagram read task dropped its result",
            ))),
        },
        _ = timer_rx => Err(NetError::Timeout),
    }
}
