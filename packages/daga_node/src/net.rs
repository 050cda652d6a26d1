use anyhow::{Context, Result};
use daga_net::framing::HEADER_SIZE;
use daga_net::{Connection, NetError, TcpConnection};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Dial `address`, retrying up to `attempts` times in total.
pub async fn connect_with_retry(address: &str, attempts: u32) -> Result<TcpConnection> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                info!(address, attempt, "connected");
                return Connection::from_tcp(stream)
                    .with_context(|| format!("failed to configure connection to {address}"));
            }
            Err(err) if attempt < attempts => {
                warn!(address, attempt, attempts, error = %err, "connect failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to connect to {address} after {attempts} attempts")
                });
            }
        }
    }
}

/// The peer closed the stream cleanly between frames.
pub fn is_closed(err: &NetError) -> bool {
    matches!(
        err,
        NetError::ShortRead {
            read: 0,
            expected: HEADER_SIZE
        }
    )
}
