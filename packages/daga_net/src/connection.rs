//! Peer connections and the per-peer record owned by role state.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::NetError;
use crate::framing;

/// Identifier of a node in the roster. Crosses the wire as a u32.
pub type NodeId = u32;

/// A bidirectional byte stream split into independently locked halves.
///
/// Frame writes are not atomic against interleaving, so every write goes
/// through the write-half lock; reads likewise hold the read-half lock for a
/// whole frame. Reading and writing can proceed at the same time.
pub struct Connection<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    peer_addr: Option<SocketAddr>,
}

pub type TcpConnection = Connection<TcpStream>;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr: None,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Write one frame. Concurrent callers are serialized.
    pub async fn write_message(&self, body: &[u8]) -> Result<(), NetError> {
        let mut writer = self.writer.lock().await;
        framing::write_message(&mut *writer, body).await
    }

    /// Read one frame.
    pub async fn read_message(&self) -> Result<Vec<u8>, NetError> {
        let mut reader = self.reader.lock().await;
        framing::read_message(&mut *reader).await
    }
}

impl Connection<TcpStream> {
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream).with_peer_addr(addr))
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "Connection({addr})"),
            None => write!(f, "Connection(<unaddressed>)"),
        }
    }
}

/// What a role knows about one peer.
///
/// Records are never removed from their owning collection: a failed write
/// flips `connected` so indices and ids stay stable.
#[derive(Debug)]
pub struct NodeRepresentation<S, P> {
    pub id: NodeId,
    pub connection: Arc<Connection<S>>,
    pub connected: bool,
    pub public_key: P,
}

impl<S, P> NodeRepresentation<S, P> {
    pub fn new(id: NodeId, connection: Arc<Connection<S>>, public_key: P) -> Self {
        Self {
            id,
            connection,
            connected: true,
            public_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_writes_do_not_interleave() {
        let (a, mut b) = tokio::io::duplex(1024 * 1024);
        let conn = Arc::new(Connection::new(a));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.write_message(&vec![i; 4096]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let body = framing::read_message(&mut b).await.unwrap();
            assert_eq!(body.len(), 4096);
            assert!(body.iter().all(|&x| x == body[0]), "frame was interleaved");
            seen.push(body[0]);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn read_and_write_halves() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Connection::new(a);
        let right = Connection::new(b);
        left.write_message(b"hi").await.unwrap();
        assert_eq!(right.read_message().await.unwrap(), b"hi");
        right.write_message(b"back").await.unwrap();
        assert_eq!(left.read_message().await.unwrap(), b"back");
    }

    #[test]
    fn new_record_starts_connected() {
        let (a, _b) = tokio::io::duplex(16);
        let node = NodeRepresentation::new(4, Arc::new(Connection::new(a)), ());
        assert!(node.connected);
        assert_eq!(node.id, 4);
    }
}
