//! Proxy server implementation using hyper
//!
//! Accepts client connections, answers the liveness and favicon paths
//! directly and hands everything else to the worker pool.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::models::HealthStatus;
use crate::proxy::handler::{empty_body, error_response, full_body, ProxyBody};
use crate::proxy::rotation::ProxySelector;
use crate::proxy::worker::WorkerPool;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every connection
struct ServerContext {
    workers: Arc<WorkerPool<Incoming>>,
    selector: Arc<dyn ProxySelector>,
    metrics: Arc<Metrics>,
}

/// Bind a listener, naming the address when it is unavailable
#[instrument]
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::InvalidConfig(format!("cannot listen on {}: {}", addr, e)))
}

/// Proxy server
pub struct ProxyServer {
    context: Arc<ServerContext>,
}

impl ProxyServer {
    pub fn new(
        workers: Arc<WorkerPool<Incoming>>,
        selector: Arc<dyn ProxySelector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            context: Arc::new(ServerContext {
                workers,
                selector,
                metrics,
            }),
        }
    }

    /// Accept connections on a bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let context = self.context.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, context).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        context: Arc<ServerContext>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        debug!(client = %client_addr, "Accepted connection");

        let service = service_fn(move |req: Request<Incoming>| {
            let context = context.clone();
            async move { Ok::<_, Infallible>(dispatch(req, &context).await) }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(GatewayError::from)?;

        Ok(())
    }
}

async fn dispatch(req: Request<Incoming>, context: &ServerContext) -> Response<ProxyBody> {
    if req.method() != Method::CONNECT {
        match req.uri().path() {
            "/health" => return health_response(context),
            "/favicon.ico" => {
                let mut response = Response::new(empty_body());
                *response.status_mut() = StatusCode::NO_CONTENT;
                return response;
            }
            _ => {}
        }
    }

    let done = match context.workers.submit(req) {
        Ok(done) => done,
        Err(e) => {
            if matches!(e, GatewayError::QueueFull) {
                context.metrics.increment_failed();
                debug!("Admission queue full, rejecting request");
            }
            return error_response(e.status_code(), &e.to_string());
        }
    };

    match done.await {
        Ok(response) => response,
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "request was dropped before completion",
        ),
    }
}

fn health_response(context: &ServerContext) -> Response<ProxyBody> {
    let total = context.selector.total_count();
    let status = HealthStatus {
        status: "ok".to_string(),
        active_proxies: total,
        total_proxies: total,
        workers: context.workers.workers(),
        queue_size: context.workers.queue_len(),
    };

    match serde_json::to_vec(&status) {
        Ok(body) => {
            let mut response = Response::new(full_body(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EgressProxy, ProxyEndpoint, ProxyRecord};
    use crate::proxy::endpoints::EndpointTable;
    use crate::proxy::handler::{GatewayHandler, GatewayHandlerConfig};
    use crate::proxy::rotation::LeastRecentlyUsedSelector;
    use crate::proxy::transport::{TransportCache, TransportConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct TestGateway {
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        selector: Arc<LeastRecentlyUsedSelector>,
        _shutdown: watch::Sender<bool>,
    }

    async fn start_gateway(proxy_port: u16) -> TestGateway {
        start_gateway_with(proxy_port, 2, GatewayHandlerConfig::default()).await
    }

    async fn start_gateway_with(
        proxy_port: u16,
        worker_count: usize,
        config: GatewayHandlerConfig,
    ) -> TestGateway {
        let record = ProxyRecord {
            host: "127.0.0.1".to_string(),
            port: proxy_port,
            user: None,
            pass: None,
        };
        let selector = Arc::new(
            LeastRecentlyUsedSelector::new(vec![EgressProxy::new(
                ProxyEndpoint::from_record(&record).unwrap(),
            )])
            .unwrap(),
        );
        let metrics = Arc::new(Metrics::new());
        let handler = Arc::new(GatewayHandler::new(
            selector.clone(),
            Arc::new(TransportCache::new(TransportConfig::default())),
            Arc::new(EndpointTable::new([("svc", "http://upstream.test")])),
            metrics.clone(),
            config,
        ));
        let workers = Arc::new(WorkerPool::start(handler, worker_count, worker_count * 2));

        let server = ProxyServer::new(workers, selector.clone(), metrics.clone());
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

        TestGateway {
            addr,
            metrics,
            selector,
            _shutdown: shutdown_tx,
        }
    }

    fn direct_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    /// Egress proxy stand-in that accepts one CONNECT and then echoes bytes
    async fn spawn_tunnel_proxy() -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(m) => {
                        if stream.write_all(&buf[..m]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            request
        });
        (port, task)
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        while !data.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "connection closed before response head");
            data.push(byte[0]);
        }
        String::from_utf8_lossy(&data).to_string()
    }

    #[tokio::test]
    async fn test_health_bypasses_selection() {
        let gateway = start_gateway(9).await;

        let response = direct_client()
            .get(format!("http://{}/health", gateway.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let body = response.bytes().await.unwrap();
        let health: HealthStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.total_proxies, 1);
        assert_eq!(health.active_proxies, 1);
        assert_eq!(health.workers, 2);
        assert_eq!(health.queue_size, 0);

        assert_eq!(gateway.metrics.total_requests(), 0);
        assert_eq!(gateway.selector.stats()[0].usage_count, 0);
    }

    #[tokio::test]
    async fn test_favicon_returns_no_content() {
        let gateway = start_gateway(9).await;

        let response = direct_client()
            .get(format!("http://{}/favicon.ico", gateway.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(gateway.metrics.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_through_listener() {
        let gateway = start_gateway(9).await;

        let response = direct_client()
            .get(format!("http://{}/jitoMARS/api/v1", gateway.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(gateway.metrics.failed_requests(), 1);
        assert_eq!(gateway.selector.stats()[0].usage_count, 0);
    }

    #[tokio::test]
    async fn test_connect_tunnel_end_to_end() {
        let (proxy_port, proxy_task) = spawn_tunnel_proxy().await;
        let gateway = start_gateway(proxy_port).await;

        let mut client = TcpStream::connect(gateway.addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let head = read_head(&mut client).await;
        assert!(
            head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
            "unexpected head: {}",
            head
        );

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(1), client.read_exact(&mut buf))
            .await
            .expect("no bytes through tunnel")
            .unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(gateway.metrics.successful_requests(), 1);
        assert_eq!(gateway.selector.stats()[0].usage_count, 1);
        assert_eq!(gateway.metrics.active_connections(), 1);

        // Closing the client must tear down the egress side too
        drop(client);
        let request = timeout(Duration::from_secs(1), proxy_task)
            .await
            .expect("egress side stayed open")
            .unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));

        timeout(Duration::from_secs(1), async {
            while gateway.metrics.active_connections() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tunnel still counted after both sides closed");
    }

    #[tokio::test]
    async fn test_open_tunnel_holds_its_worker() {
        let (proxy_port, _proxy_task) = spawn_tunnel_proxy().await;
        let gateway = start_gateway_with(proxy_port, 1, GatewayHandlerConfig::default()).await;

        let mut client = TcpStream::connect(gateway.addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 "), "unexpected head: {}", head);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gateway.metrics.active_connections(), 1);

        // The only worker is relaying, so a routed request waits in the queue
        let queued = tokio::spawn(
            direct_client()
                .get(format!("http://{}/jitoMARS/api", gateway.addr))
                .send(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!queued.is_finished());

        drop(client);
        let response = timeout(Duration::from_secs(2), queued)
            .await
            .expect("worker was not released when the tunnel closed")
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stalled_body_releases_worker() {
        let config = GatewayHandlerConfig {
            request_timeout: Duration::from_secs(1),
            ..GatewayHandlerConfig::default()
        };
        let gateway = start_gateway_with(9, 1, config).await;

        let mut stalled = TcpStream::connect(gateway.addr).await.unwrap();
        stalled
            .write_all(b"POST /svc/x HTTP/1.1\r\nHost: gw\r\nContent-Length: 10\r\n\r\n")
            .await
            .unwrap();

        let head = timeout(Duration::from_secs(3), read_head(&mut stalled))
            .await
            .expect("stalled body was never cut off");
        assert!(head.starts_with("HTTP/1.1 408 "), "unexpected head: {}", head);

        let response = timeout(
            Duration::from_secs(3),
            direct_client()
                .get(format!("http://{}/jitoMARS/api", gateway.addr))
                .send(),
        )
        .await
        .expect("worker still held by the stalled body")
        .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(gateway.metrics.failed_requests(), 2);
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let taken = bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = bind(&addr).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
        assert!(err.to_string().contains(&addr));
    }
}
