//! Gateway request handler
//!
//! Resolves the logical endpoint, picks an egress proxy and relays the
//! request through it, either as plain HTTP or as a CONNECT tunnel.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, instrument, warn};

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::proxy::endpoints::EndpointTable;
use crate::proxy::rotation::ProxySelector;
use crate::proxy::transport::TransportCache;
use crate::proxy::tunnel::{TunnelConfig, TunnelHandler, DEFAULT_RELAY_BUFFER};
use crate::proxy::worker::{RequestProcessor, Responder};

/// Response body type produced by the gateway
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Configuration for the gateway handler
#[derive(Debug, Clone)]
pub struct GatewayHandlerConfig {
    /// Deadline for dialing, handshaking and executing relayed requests
    pub request_timeout: Duration,
    /// Buffer used for streaming bodies and tunnel pumps
    pub relay_buffer_size: usize,
}

impl Default for GatewayHandlerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            relay_buffer_size: DEFAULT_RELAY_BUFFER,
        }
    }
}

/// Gateway request handler
pub struct GatewayHandler {
    selector: Arc<dyn ProxySelector>,
    transports: Arc<TransportCache>,
    endpoints: Arc<EndpointTable>,
    metrics: Arc<Metrics>,
    tunnel: TunnelHandler,
    request_timeout: Duration,
    relay_buffer_size: usize,
}

impl GatewayHandler {
    pub fn new(
        selector: Arc<dyn ProxySelector>,
        transports: Arc<TransportCache>,
        endpoints: Arc<EndpointTable>,
        metrics: Arc<Metrics>,
        config: GatewayHandlerConfig,
    ) -> Self {
        let tunnel = TunnelHandler::new(TunnelConfig {
            dial_timeout: config.request_timeout,
            handshake_timeout: config.request_timeout,
            buffer_size: config.relay_buffer_size,
        });

        Self {
            selector,
            transports,
            endpoints,
            metrics,
            tunnel,
            request_timeout: config.request_timeout,
            relay_buffer_size: config.relay_buffer_size,
        }
    }

    /// Handle one admitted request, translating every failure into a response.
    ///
    /// The response goes out through `responder`. An established tunnel is
    /// then relayed here, so the connection stays counted until both pumps
    /// have stopped.
    #[instrument(skip(self, req, responder), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>, responder: Responder)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let _connection = self.metrics.track_connection();
        self.metrics.increment_total();

        if req.method() == Method::CONNECT {
            match self.handle_connect(req).await {
                Ok(tunnel) => {
                    self.metrics.increment_successful();
                    responder.send(connection_established());
                    tunnel.run().await;
                }
                Err(e) => responder.send(self.failure_response(e)),
            }
        } else {
            let response = match self.handle_http(req).await {
                Ok(response) => {
                    self.metrics.increment_successful();
                    response
                }
                Err(e) => self.failure_response(e),
            };
            responder.send(response);
        }
    }

    fn failure_response(&self, e: GatewayError) -> Response<ProxyBody> {
        self.metrics.increment_failed();
        if e.is_server_error() {
            warn!("Request failed: {}", e);
        } else {
            debug!("Request rejected: {}", e);
        }
        error_response(e.status_code(), &e.to_string())
    }

    /// Open the egress side of a CONNECT tunnel
    async fn handle_connect<B>(&self, mut req: Request<B>) -> Result<PendingTunnel> {
        let target = connect_target(req.uri())?;
        let proxy = self.selector.select()?;

        let server = match self.tunnel.establish(&proxy, &target).await {
            Ok(server) => server,
            Err(e) => {
                self.selector.record_error(&proxy.identity);
                return Err(e);
            }
        };

        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(GatewayError::HijackUnsupported)?;

        info!(proxy = %proxy.address(), target = %target, "CONNECT tunnel established");

        Ok(PendingTunnel {
            on_upgrade,
            server,
            buffer_size: self.relay_buffer_size,
        })
    }

    /// Handle a request addressed to a logical endpoint
    async fn handle_http<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let target = self
            .endpoints
            .resolve(req.uri().path(), req.uri().query())?;
        let target = url::Url::parse(&target)?;

        let (parts, body) = req.into_parts();
        let body_bytes = timeout(self.request_timeout, body.collect())
            .await
            .map_err(|_| GatewayError::RequestTimeout)?
            .map_err(|e| GatewayError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();

        let proxy = self.selector.select()?;
        debug!(proxy = %proxy.address(), target = %target, "Forwarding request");

        let start = Instant::now();
        let result = match self.transports.get(&proxy) {
            Ok(transport) => {
                self.forward_request(transport.client(), parts, body_bytes, target)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                self.metrics.record_response_time(start.elapsed());
                Ok(response)
            }
            Err(e) => {
                if e.is_egress_failure() {
                    self.selector.record_error(&proxy.identity);
                }
                Err(e)
            }
        }
    }

    /// Send the request upstream and stream the reply back
    async fn forward_request(
        &self,
        client: reqwest::Client,
        parts: http::request::Parts,
        body: Bytes,
        target: url::Url,
    ) -> Result<Response<ProxyBody>> {
        let mut headers = parts.headers;
        // The inbound Host names the gateway; reqwest derives it from the target.
        headers.remove(HOST);

        let upstream = client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut response = Response::new(empty_body());
        *response.status_mut() = upstream.status();
        let response_headers = response.headers_mut();
        for (name, value) in upstream.headers() {
            response_headers.append(name.clone(), value.clone());
        }

        let stream = upstream
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader = StreamReader::new(stream);
        let frames = ReaderStream::with_capacity(reader, self.relay_buffer_size).map_ok(Frame::data);
        *response.body_mut() = StreamBody::new(frames).boxed_unsync();

        Ok(response)
    }
}

#[async_trait]
impl<B> RequestProcessor<B> for GatewayHandler
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
{
    async fn process(&self, request: Request<B>, responder: Responder) {
        self.handle(request, responder).await
    }
}

/// A tunnel whose egress side is ready, waiting for the client upgrade
struct PendingTunnel {
    on_upgrade: OnUpgrade,
    server: TcpStream,
    buffer_size: usize,
}

impl PendingTunnel {
    /// Relay until both directions have stopped
    async fn run(self) {
        match self.on_upgrade.await {
            Ok(upgraded) => {
                TunnelHandler::handle_upgraded(upgraded, self.server, self.buffer_size).await;
            }
            Err(e) => {
                debug!("CONNECT upgrade failed: {}", e);
            }
        }
    }
}

/// `200 Connection Established` reply to a CONNECT
fn connection_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// The raw `host:port` authority of a CONNECT request
fn connect_target(uri: &Uri) -> Result<String> {
    uri.authority()
        .map(|authority| authority.as_str().to_string())
        .ok_or_else(|| {
            GatewayError::InvalidRequest(format!("CONNECT target must be host:port, got '{}'", uri))
        })
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create a plain-text error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
