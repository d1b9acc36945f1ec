//! CONNECT tunnel establishment and relay
//!
//! A tunnel is a handshake with the egress proxy followed by two byte pumps.
//! When either pump stops, the other is cancelled and both sockets close.

use std::time::Duration;

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::models::ProxyEndpoint;
use crate::proxy::egress;

/// Default size of each pump buffer and of the egress socket buffers
pub const DEFAULT_RELAY_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_RELAY_BUFFER,
        }
    }
}

/// Handles CONNECT tunnel requests
pub struct TunnelHandler {
    config: TunnelConfig,
}

impl TunnelHandler {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Dial the egress proxy and complete the CONNECT handshake for `target`
    #[instrument(skip(self, proxy), fields(proxy = %proxy.address()))]
    pub async fn establish(&self, proxy: &ProxyEndpoint, target: &str) -> Result<TcpStream> {
        let mut stream =
            egress::dial(proxy, self.config.dial_timeout, self.config.buffer_size).await?;
        egress::handshake(&mut stream, proxy, target, self.config.handshake_timeout).await?;

        debug!("Egress tunnel established");
        Ok(stream)
    }

    /// Relay an upgraded client connection over an established egress tunnel
    pub async fn handle_upgraded(upgraded: Upgraded, server: TcpStream, buffer_size: usize) -> (u64, u64) {
        // Wrap Upgraded with TokioIo to get tokio AsyncRead/AsyncWrite traits
        let client = TokioIo::new(upgraded);
        Self::relay(client, server, buffer_size).await
    }

    /// Copy bytes both ways until either side finishes, then tear both down.
    ///
    /// Returns `(client_to_server, server_to_client)` byte counts.
    #[instrument(skip(client, server))]
    pub async fn relay<C, S>(client: C, server: S, buffer_size: usize) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let collapse = CancellationToken::new();

        let upstream = tokio::spawn(pump(
            client_read,
            server_write,
            buffer_size,
            collapse.clone(),
        ));
        let downstream = tokio::spawn(pump(
            server_read,
            client_write,
            buffer_size,
            collapse.clone(),
        ));

        let (sent, received) = tokio::join!(upstream, downstream);

        let bytes_sent = sent.unwrap_or_else(|e| {
            debug!("Client to server pump aborted: {}", e);
            0
        });
        let bytes_received = received.unwrap_or_else(|e| {
            debug!("Server to client pump aborted: {}", e);
            0
        });

        debug!(
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            "Tunnel closed"
        );

        (bytes_sent, bytes_received)
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, buffer_size: usize, collapse: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = collapse.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Tunnel read ended: {}", e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = collapse.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("Tunnel write ended: {}", e);
            break;
        }
        copied += n as u64;
    }

    let _ = writer.shutdown().await;
    collapse.cancel();
    copied
}
