use std::io;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{GatewayError, Result};
use crate::models::ProxyEndpoint;

/// Most bytes read back from the egress proxy while waiting for its CONNECT reply
pub const HANDSHAKE_READ_LIMIT: usize = 1024;

/// Open a raw TCP connection to an egress proxy with sized socket buffers.
#[instrument(skip(proxy), fields(proxy = %proxy.address()))]
pub async fn dial(
    proxy: &ProxyEndpoint,
    connect_timeout: Duration,
    buffer_size: usize,
) -> Result<TcpStream> {
    let address = proxy.address();

    let stream = timeout(connect_timeout, open_socket(&address, buffer_size))
        .await
        .map_err(|_| {
            GatewayError::EgressDial(format!(
                "{}: timed out after {}ms",
                address,
                connect_timeout.as_millis()
            ))
        })?
        .map_err(|e| GatewayError::EgressDial(format!("{}: {}", address, e)))?;

    debug!("Connected to egress proxy");
    Ok(stream)
}

async fn open_socket(address: &str, buffer_size: usize) -> io::Result<TcpStream> {
    let buffer_size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
    let mut last_err = None;

    for addr in lookup_host(address).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(buffer_size)?;
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_nodelay(true)?;

        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address did not resolve")
    }))
}

/// Ask the egress proxy to open a tunnel to `target` (`host:port`).
///
/// The whole exchange runs under `read_timeout`. A reply is accepted when it
/// contains `200` anywhere in the first read.
pub async fn handshake<S>(
    stream: &mut S,
    proxy: &ProxyEndpoint,
    target: &str,
    read_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(read_timeout, exchange_connect(stream, proxy, target)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GatewayError::EgressHandshake(format!(
            "{} -> {}: {}",
            proxy.address(),
            target,
            e
        ))),
        Err(_) => Err(GatewayError::EgressHandshake(format!(
            "{} -> {}: no reply within {}ms",
            proxy.address(),
            target,
            read_timeout.as_millis()
        ))),
    }
}

async fn exchange_connect<S>(
    stream: &mut S,
    proxy: &ProxyEndpoint,
    target: &str,
) -> std::result::Result<(), anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(connect_request(proxy, target).as_bytes()).await?;
    stream.flush().await?;

    let mut response = vec![0u8; HANDSHAKE_READ_LIMIT];
    let n = stream.read(&mut response).await?;
    if n == 0 {
        anyhow::bail!("connection closed before CONNECT reply");
    }

    let response_str = String::from_utf8_lossy(&response[..n]);
    if !response_str.contains("200") {
        anyhow::bail!(
            "CONNECT rejected: {}",
            response_str.lines().next().unwrap_or("empty reply")
        );
    }

    Ok(())
}

fn connect_request(proxy: &ProxyEndpoint, target: &str) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

    if let Some((username, password)) = proxy.credentials() {
        let credentials = format!("{}:{}", username, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyRecord;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    fn endpoint(port: u16, user: Option<&str>, pass: Option<&str>) -> ProxyEndpoint {
        ProxyEndpoint::from_record(&ProxyRecord {
            host: "127.0.0.1".to_string(),
            port,
            user: user.map(str::to_string),
            pass: pass.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn connect_request_without_credentials() {
        let proxy = endpoint(8080, None, None);
        assert_eq!(
            connect_request(&proxy, "example.com:443"),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_skips_partial_credentials() {
        let proxy = endpoint(8080, Some("user"), None);
        assert!(!connect_request(&proxy, "example.com:443").contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn handshake_accepts_200_reply() {
        let proxy = endpoint(8080, Some("user"), Some("pass"));
        let mut stream = Builder::new()
            .write(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\
                  Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
            )
            .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .build();

        handshake(&mut stream, &proxy, "example.com:443", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handshake_accepts_200_anywhere_in_reply() {
        let proxy = endpoint(8080, None, None);
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.0 200 OK\r\n\r\n")
            .build();

        assert!(
            handshake(&mut stream, &proxy, "example.com:443", Duration::from_secs(1))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn handshake_rejects_407() {
        let proxy = endpoint(8080, None, None);
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .build();

        let err = handshake(&mut stream, &proxy, "example.com:443", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EgressHandshake(ref msg) if msg.contains("407")));
    }

    #[tokio::test]
    async fn handshake_rejects_closed_connection() {
        let proxy = endpoint(8080, None, None);
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);

        let err = handshake(&mut client, &proxy, "example.com:443", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EgressHandshake(_)));
    }

    #[tokio::test]
    async fn handshake_times_out_on_silent_proxy() {
        let proxy = endpoint(8080, None, None);
        let (mut client, _server) = tokio::io::duplex(4096);

        let err = handshake(
            &mut client,
            &proxy,
            "example.com:443",
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::EgressHandshake(ref msg) if msg.contains("no reply")));
    }

    #[tokio::test]
    async fn dial_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = dial(&endpoint(port, None, None), Duration::from_secs(1), 256 * 1024)
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial(&endpoint(port, None, None), Duration::from_secs(1), 256 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EgressDial(_)));
        assert!(err.is_egress_failure());
    }
}
