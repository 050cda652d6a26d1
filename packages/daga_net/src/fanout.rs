//! Sending one message to many peers.

use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::connection::{Connection, NodeRepresentation};
use crate::error::NetError;

/// Best-effort delivery to every node still flagged `connected`.
///
/// Writes to distinct peers run concurrently. A node whose write fails is
/// flagged `connected = false` and the rest still receive the message; callers
/// inspect the flags afterwards.
pub async fn broadcast_to_connected_nodes<C, P>(nodes: &mut [NodeRepresentation<C, P>], message: &[u8])
where
    C: AsyncRead + AsyncWrite + Send,
{
    let writes = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.connected)
        .map(|(index, node)| async move { (index, node.connection.write_message(message).await) });
    let results = join_all(writes).await;

    for (index, result) in results {
        if let Err(err) = result {
            let node = &mut nodes[index];
            warn!(node = node.id, error = %err, "write failed, marking node disconnected");
            node.connected = false;
        }
    }
}

/// Deliver to every connection in order, stopping at the first failure.
///
/// For contexts where partial delivery is worse than none.
pub async fn broadcast_to_connections<C>(
    connections: &[Arc<Connection<C>>],
    message: &[u8],
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
{
    for (index, conn) in connections.iter().enumerate() {
        if let Err(err) = conn.write_message(message).await {
            warn!(index, peer = ?conn.peer_addr(), error = %err, "broadcast aborted");
            return Err(err);
        }
    }
    Ok(())
}
