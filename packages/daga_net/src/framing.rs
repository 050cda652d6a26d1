//! Versioned length-prefixed envelope, for stream and datagram transports.
//!
//! Wire format: `[u16 version][u32 body length][body]`, big-endian.
//!
//! A frame whose version differs from [`PROTOCOL_VERSION`] is rejected
//! outright. There is no negotiation.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::NetError;

/// Bumped by hand whenever the wire format changes.
pub const PROTOCOL_VERSION: u16 = 3;

/// `version (2) + length (4)`.
pub const HEADER_SIZE: usize = 6;

/// Default upper bound on a stream body. Rejected before allocating.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Receive buffer for datagram bodies. Must exceed the largest datagram sent
/// or the tail is lost.
pub const DEFAULT_DATAGRAM_BUFFER_SIZE: usize = 1024;

/// Prefix `body` with the frame header.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, NetError> {
    let len = u32::try_from(body.len()).map_err(|_| NetError::FrameTooLarge {
        size: body.len(),
        limit: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Validate the version and return the announced body length.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<usize, NetError> {
    let version = u16::from_be_bytes([header[0], header[1]]);
    if version != PROTOCOL_VERSION {
        return Err(NetError::ProtocolVersionMismatch {
            received: version,
            local: PROTOCOL_VERSION,
        });
    }
    Ok(u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize)
}

/// Write one frame, continuing after partial writes until the whole frame is
/// accepted.
///
/// A transport that stops accepting bytes (a write returning zero) yields
/// [`NetError::ShortWrite`] with the count written so far.
pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body)?;
    let mut written = 0;
    while written < frame.len() {
        let n = writer.write(&frame[written..]).await?;
        if n == 0 {
            return Err(NetError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        written += n;
    }
    writer.flush().await?;
    debug!(body_len = body.len(), "wrote frame");
    Ok(())
}

/// Read one frame, rejecting bodies over [`MAX_MESSAGE_SIZE`].
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, NetError>
where
    R: AsyncRead + Unpin,
{
    read_message_bounded(reader, MAX_MESSAGE_SIZE).await
}

/// Read one frame, rejecting bodies longer than `max_body`.
pub async fn read_message_bounded<R>(reader: &mut R, max_body: usize) -> Result<Vec<u8>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let read = read_full(reader, &mut header).await?;
    if read != HEADER_SIZE {
        return Err(NetError::ShortRead {
            read,
            expected: HEADER_SIZE,
        });
    }

    let body_len = decode_header(&header)?;
    if body_len > max_body {
        return Err(NetError::FrameTooLarge {
            size: body_len,
            limit: max_body,
        });
    }

    let mut body = vec![0u8; body_len];
    let read = read_full(reader, &mut body).await?;
    if read != body_len {
        return Err(NetError::ShortRead {
            read,
            expected: body_len,
        });
    }
    Ok(body)
}

/// Fill `buf` until it is full or the stream ends. Returns the byte count.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A message-oriented socket: each receive yields at most one datagram.
pub trait DatagramSocket: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

impl DatagramSocket for UdpSocket {
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::recv(self, buf)
    }
}

/// Receive one framed datagram with a single receive call.
///
/// Messages split across several datagrams are not reassembled. If fewer
/// body bytes arrive than the header announced, the bytes that did arrive are
/// returned inside [`NetError::TruncatedDatagram`].
pub async fn read_datagram<D>(socket: &D, expected_size: usize) -> Result<Vec<u8>, NetError>
where
    D: DatagramSocket,
{
    let mut buf = vec![0u8; expected_size + HEADER_SIZE];
    let n = socket.recv(&mut buf).await?;
    if n < HEADER_SIZE {
        return Err(NetError::ShortRead {
            read: n,
            expected: HEADER_SIZE,
        });
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&buf[..HEADER_SIZE]);
    let body_len = decode_header(&header)?;

    let received = n - HEADER_SIZE;
    if received < body_len {
        buf.truncate(n);
        return Err(NetError::TruncatedDatagram {
            partial: buf.split_off(HEADER_SIZE),
            received,
            expected: body_len,
        });
    }

    buf.truncate(HEADER_SIZE + body_len);
    Ok(buf.split_off(HEADER_SIZE))
}

/// Frame `body` and send it as one datagram on a connected socket.
pub async fn write_datagram(socket: &UdpSocket, body: &[u8]) -> Result<(), NetError> {
    let frame = encode_frame(body)?;
    let written = socket.send(&frame).await?;
    if written < frame.len() {
        return Err(NetError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_version(version: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = version.to_be_bytes().to_vec();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn header_layout() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(frame, vec![0, 3, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        write_message(&mut a, &body).await.unwrap();
        write_message(&mut a, b"").await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), body);
        assert!(read_message(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_newer_version() {
        let frame = frame_with_version(PROTOCOL_VERSION + 1, b"payload");
        let err = read_message(&mut frame.as_slice()).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::ProtocolVersionMismatch {
                received: 4,
                local: 3
            }
        ));
    }

    #[tokio::test]
    async fn short_header_is_short_read() {
        let err = read_message(&mut [0u8, 3, 0].as_slice()).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::ShortRead {
                read: 3,
                expected: 6
            }
        ));
    }

    #[tokio::test]
    async fn short_body_is_short_read() {
        let mut frame = encode_frame(b"0123456789").unwrap();
        frame.truncate(HEADER_SIZE + 4);
        let err = read_message(&mut frame.as_slice()).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::ShortRead {
                read: 4,
                expected: 10
            }
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_allocation() {
        let mut frame = PROTOCOL_VERSION.to_be_bytes().to_vec();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = read_message_bounded(&mut frame.as_slice(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn partial_writes_are_continued() {
        let frame = encode_frame(b"hello world").unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .write(&frame[..4])
            .write(&frame[4..])
            .build();
        write_message(&mut mock, b"hello world").await.unwrap();
    }

    #[tokio::test]
    async fn large_frame_through_small_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let expected = body.clone();
        let reader = tokio::spawn(async move { read_message(&mut b).await });
        write_message(&mut a, &body).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), expected);
    }

    /// Accepts nothing, as a transport that has stopped taking bytes.
    struct ZeroWriter;

    impl AsyncWrite for ZeroWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(0))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn stalled_writer_is_short_write() {
        let err = write_message(&mut ZeroWriter, b"hello world")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetError::ShortWrite {
                written: 0,
                expected: 17
            }
        ));
    }

    #[tokio::test]
    async fn write_error_is_transport() {
        let mut mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let err = write_message(&mut mock, b"x").await.unwrap_err();
        assert!(matches!(err, NetError::Transport(_)));
    }

    async fn udp_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn datagram_roundtrip() {
        let (a, b) = udp_pair().await;
        write_datagram(&a, b"ping").await.unwrap();
        let body = read_datagram(&b, DEFAULT_DATAGRAM_BUFFER_SIZE).await.unwrap();
        assert_eq!(body, b"ping");
    }

    #[tokio::test]
    async fn truncated_datagram_keeps_partial_body() {
        let (a, b) = udp_pair().await;
        // Header claims 100 bytes but only 5 follow.
        let mut datagram = PROTOCOL_VERSION.to_be_bytes().to_vec();
        datagram.extend_from_slice(&100u32.to_be_bytes());
        datagram.extend_from_slice(b"hello");
        a.send(&datagram).await.unwrap();

        match read_datagram(&b, DEFAULT_DATAGRAM_BUFFER_SIZE).await {
            Err(NetError::TruncatedDatagram {
                partial,
                received,
                expected,
            }) => {
                assert_eq!(partial, b"hello");
                assert_eq!(received, 5);
                assert_eq!(expected, 100);
            }
            other => panic!("expected truncated datagram, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn datagram_larger_than_buffer_is_truncated() {
        let (a, b) = udp_pair().await;
        write_datagram(&a, &[7u8; 64]).await.unwrap();
        let err = read_datagram(&b, 16).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::TruncatedDatagram {
                received: 16,
                expected: 64,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn datagram_version_guard() {
        let (a, b) = udp_pair().await;
        a.send(&frame_with_version(PROTOCOL_VERSION + 1, b"x"))
            .await
            .unwrap();
        let err = read_datagram(&b, 64).await.unwrap_err();
        assert!(matches!(err, NetError::ProtocolVersionMismatch { .. }));
    }
}
