//! Echo handler for the Tokio runtime.

use crate::signal::Shutdown;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Echo bytes back until the peer closes. Returns the number echoed.
pub async fn handle_connection<S>(mut stream: S, buffer_size: usize) -> io::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size.max(1));
    let mut echoed = 0u64;

    loop {
        buffer.clear();
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            break;
        }
        stream.write_all(&buffer).await?;
        echoed += n as u64;
    }

    stream.shutdown().await?;
    Ok(echoed)
}

/// Accept and echo until `shutdown` is requested.
pub async fn serve(
    listener: TcpListener,
    shutdown: Shutdown,
    poll_timeout: Duration,
    buffer_size: usize,
) -> io::Result<()> {
    let connection_limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    info!(address = %listener.local_addr()?, "Echo server listening");

    while !shutdown.is_requested() {
        // Bounded wait so the shutdown flag is observed
        let accepted = match tokio::time::timeout(poll_timeout, listener.accept()).await {
            Ok(accepted) => accepted,
            Err(_) => continue,
        };

        match accepted {
            Ok((stream, peer)) => {
                let permit = match Arc::clone(&connection_limit).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                debug!(peer = %peer, "New connection");
                tokio::spawn(async move {
                    log_result(peer, handle_connection(stream, buffer_size).await);
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }

    info!("Echo server stopped accepting");
    Ok(())
}

fn log_result(peer: SocketAddr, result: io::Result<u64>) {
    match result {
        Ok(bytes) => info!(peer = %peer, bytes, "Connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
    }
}
