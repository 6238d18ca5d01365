//! Heartbeat supervision of an external helper process
//!
//! The workflow binds a local port and hands it to the helper, which
//! connects back and writes `heartbeat\n` every couple of seconds. Silence
//! longer than the timeout, or a closed connection, means the helper is gone.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const HEARTBEAT_MESSAGE: &str = "heartbeat";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No heartbeat (or no connection) within the timeout
    TimedOut,
    /// Helper closed the connection
    Disconnected,
    /// The owning workflow finished
    Stopped,
}

/// Resolves once `stop` holds `true` or its sender is dropped
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Listens for a single helper and watches its heartbeats
pub struct HeartbeatServer {
    listener: TcpListener,
    timeout: Duration,
}

impl HeartbeatServer {
    pub async fn bind(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, HeartbeatError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, timeout })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HeartbeatError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one helper and monitor it until it goes quiet or `stop` fires
    pub async fn supervise(
        self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<HeartbeatOutcome, HeartbeatError> {
        info!("Waiting for heartbeat client on {}", self.local_addr()?);

        let (stream, peer) = tokio::select! {
            _ = stop_requested(&mut stop) => return Ok(HeartbeatOutcome::Stopped),
            accepted = tokio::time::timeout(self.timeout, self.listener.accept()) => {
                match accepted {
                    Err(_) => {
                        warn!("No heartbeat client connected within {:?}", self.timeout);
                        return Ok(HeartbeatOutcome::TimedOut);
                    }
                    Ok(result) => result?,
                }
            }
        };
        info!("Heartbeat client connected from {peer}");

        let mut lines = BufReader::new(stream).lines();
        let mut received = 0u64;
        loop {
            tokio::select! {
                _ = stop_requested(&mut stop) => {
                    info!("Heartbeat supervision stopped after {received} heartbeats");
                    return Ok(HeartbeatOutcome::Stopped);
                }
                line = tokio::time::timeout(self.timeout, lines.next_line()) => match line {
                    Err(_) => {
                        warn!("No heartbeat from {peer} for {:?}", self.timeout);
                        return Ok(HeartbeatOutcome::TimedOut);
                    }
                    Ok(Ok(None)) => {
                        warn!("Heartbeat client {peer} disconnected");
                        return Ok(HeartbeatOutcome::Disconnected);
                    }
                    Ok(Ok(Some(line))) if line.trim() == HEARTBEAT_MESSAGE => received += 1,
                    Ok(Ok(Some(line))) => debug!("Ignoring message from {peer}: {line:?}"),
                    Ok(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

/// Send heartbeats to `addr` every `interval` until stopped or disconnected
///
/// Returns the number of heartbeats written. Losing the connection ends the
/// loop normally.
pub async fn run_heartbeat_client(
    addr: &str,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> Result<u64, HeartbeatError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| HeartbeatError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    info!("Connected to {addr}, sending heartbeats every {interval:?}");

    let message = format!("{HEARTBEAT_MESSAGE}\n");
    let mut sent = 0u64;
    loop {
        match stream.write_all(message.as_bytes()).await {
            Ok(()) => sent += 1,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                ) =>
            {
                info!("Lost connection to {addr}, exiting");
                return Ok(sent);
            }
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            _ = stop_requested(&mut stop) => return Ok(sent),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
