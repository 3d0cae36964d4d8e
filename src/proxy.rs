use crate::container::ServiceStatus;
use crate::error::{GateError, ProxyErrorCode};
use crate::extract::ServiceNameExtractor;
use crate::orchestrator::Orchestrator;
use crate::pages::{loading_page, problem_page, retry_redirect, shutdown_page, wants_json};
use crate::pool::{strip_hop_by_hop, ConnectionPool, PoolConfig};
use dashmap::DashMap;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Largest upgrade response head accepted from an upstream
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// A forwarding target bound to a running service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub service: String,
    pub group: String,
    pub upstream: SocketAddr,
}

/// Service name -> forwarding target, built lazily from orchestrator resolution.
///
/// A route is only built for a `Running` service. Cached routes are used
/// without re-resolving; a route whose upstream stops answering is evicted
/// and the next request resolves the service again.
pub struct RouteCache {
    routes: DashMap<String, Arc<Route>>,
    orchestrator: Arc<Orchestrator>,
    pool: Arc<ConnectionPool>,
}

impl RouteCache {
    pub fn new(orchestrator: Arc<Orchestrator>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            routes: DashMap::new(),
            orchestrator,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Cached route for `service`, resolving and caching it if absent
    pub async fn route(&self, service: &str) -> Result<Arc<Route>, GateError> {
        if let Some(route) = self.routes.get(service) {
            return Ok(Arc::clone(route.value()));
        }

        let resolved = self.orchestrator.resolve(service).await?;
        if resolved.status != ServiceStatus::Running {
            return Err(GateError::WrongStatus {
                service: service.to_string(),
                group: resolved.container.group_name,
                status: resolved.status,
            });
        }

        let upstream = resolved
            .access_addr()
            .ok_or_else(|| GateError::NotAccessible(service.to_string()))?;

        let route = Arc::new(Route {
            service: service.to_string(),
            group: resolved.container.group_name,
            upstream,
        });

        debug!(service, group = %route.group, upstream = %upstream, "Route created");
        self.routes.insert(service.to_string(), Arc::clone(&route));
        Ok(route)
    }

    /// Forward `req` to the service, recording access for its group.
    ///
    /// Upgrade requests are tunnelled to the upstream over a dedicated
    /// connection. `WrongStatus` is returned untouched so the caller can
    /// render the matching interim page.
    pub async fn handle(
        &self,
        service: &str,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GateError> {
        let route = self.route(service).await?;
        self.orchestrator.notify_access(&route.group);

        if is_upgrade_request(&req) {
            return self.tunnel(&route, req).await;
        }

        self.pool
            .send_request(req, route.upstream)
            .await
            .map_err(|e| self.unavailable(service, e.to_string()))
    }

    /// Relay an upgrade handshake to the upstream and, once it answers
    /// `101`, splice the client and upstream connections together
    async fn tunnel(
        &self,
        route: &Route,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GateError> {
        let service = route.service.as_str();
        let protocol = req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        debug!(service, protocol, upstream = %route.upstream, "Handling upgrade request");

        let mut backend = TcpStream::connect(route.upstream)
            .await
            .map_err(|e| self.unavailable(service, format!("connect failed: {}", e)))?;

        let raw_request = build_upgrade_request(&req, route.upstream);
        backend
            .write_all(&raw_request)
            .await
            .map_err(|e| self.unavailable(service, format!("failed to send upgrade request: {}", e)))?;

        let (head, pending) = read_response_head(&mut backend)
            .await
            .map_err(|e| self.unavailable(service, format!("failed to read upgrade response: {}", e)))?;

        let (status, headers) = parse_upgrade_response(&head)
            .ok_or_else(|| self.unavailable(service, "invalid upgrade response".to_string()))?;

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(service, status = %status, "Upstream declined upgrade");
            let mut headers = headers;
            strip_hop_by_hop(&mut headers);
            headers.remove(hyper::header::CONTENT_LENGTH);
            let mut response = Response::builder().status(status);
            for (name, value) in headers.iter() {
                response = response.header(name, value);
            }
            return Ok(response
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .expect("valid response builder"));
        }

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in headers.iter() {
            if name == hyper::header::CONTENT_LENGTH || name == hyper::header::TRANSFER_ENCODING {
                continue;
            }
            response = response.header(name, value);
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");

        let service = service.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => forward_bidirectional(upgraded, backend, pending, &service).await,
                Err(e) => warn!(service, error = %e, "Failed to upgrade client connection"),
            }
        });

        Ok(response)
    }

    /// Evict the route for a service whose upstream stopped answering
    fn unavailable(&self, service: &str, reason: String) -> GateError {
        self.invalidate(service);
        GateError::BackendUnavailable {
            service: service.to_string(),
            reason,
        }
    }

    /// Drop the cached route for `service`
    pub fn invalidate(&self, service: &str) -> bool {
        let removed = self.routes.remove(service).is_some();
        if removed {
            debug!(service, "Route invalidated");
        }
        removed
    }

    pub fn contains(&self, service: &str) -> bool {
        self.routes.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The public HTTP front door
pub struct ProxyServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteCache>,
    extractor: ServiceNameExtractor,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        extractor: ServiceNameExtractor,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, orchestrator, extractor, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        extractor: ServiceNameExtractor,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            routes: Arc::new(RouteCache::new(orchestrator, pool)),
            extractor,
            shutdown_rx,
        }
    }

    /// Get the route cache (for inspection and statistics)
    pub fn routes(&self) -> &Arc<RouteCache> {
        &self.routes
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            extractor = %self.extractor,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let extractor = self.extractor;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes, extractor).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender means nobody can ask for shutdown any more
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RouteCache>,
    extractor: ServiceNameExtractor,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        async move { handle_request(req, routes, extractor, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    routes: Arc<RouteCache>,
    extractor: ServiceNameExtractor,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let json = wants_json(req.headers());
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let service = match extractor.extract(req.uri(), req.headers()) {
        Some(service) => service,
        None => {
            debug!(method = %method, uri = %path_and_query, extractor = %extractor, "No service name in request");
            return Ok(problem_page(
                ProxyErrorCode::MissingServiceName,
                &format!("no service name found in request (extractor: {})", extractor),
                json,
            ));
        }
    };

    let request_id = apply_forwarded_headers(req.headers_mut(), client_addr);

    let response = match routes.handle(&service, req).await {
        Ok(response) => response,
        Err(e) => error_response(&service, e, &path_and_query, json),
    };

    debug!(
        method = %method,
        uri = %path_and_query,
        service,
        request_id,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );

    Ok(response)
}

/// Set request ID and X-Forwarded-* headers, returning the request ID.
///
/// Client-supplied X-Forwarded-* values are overwritten; this proxy is the
/// first trusted hop.
fn apply_forwarded_headers(headers: &mut HeaderMap, client_addr: SocketAddr) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

/// True for requests asking to switch protocols (WebSocket and friends)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the upstream.
///
/// Hop-by-hop headers are dropped and the upgrade pair is re-added, so only
/// the requested protocol switch reaches the upstream.
fn build_upgrade_request<B>(req: &Request<B>, upstream: SocketAddr) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let protocol = req.headers().get(hyper::header::UPGRADE).cloned();

    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    let host = headers
        .remove(hyper::header::HOST)
        .and_then(|v| v.to_str().ok().map(String::from))
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| upstream.to_string());

    let mut request = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method(), path, host);
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if let Some(protocol) = protocol.as_ref().and_then(|v| v.to_str().ok()) {
        request.push_str(&format!("Connection: Upgrade\r\nUpgrade: {}\r\n", protocol));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read up to the end of a response head, returning the head and any bytes
/// the upstream already sent past it
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let pending = buf.split_off(pos + 4);
            return Ok((buf, pending));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Status and headers of an upstream response head
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let code = status_line.split_whitespace().nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }

    Some((status, headers))
}

async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, pending: Vec<u8>, service: &str) {
    let mut client = TokioIo::new(client);

    if !pending.is_empty() {
        if let Err(e) = client.write_all(&pending).await {
            debug!(service, error = %e, "Tunnel closed before forwarding started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_upstream, to_client)) => {
            debug!(service, to_upstream, to_client, "Tunnel closed");
        }
        Err(e) => {
            debug!(service, error = %e, "Tunnel closed with error");
        }
    }
}

fn error_response(
    service: &str,
    err: GateError,
    path_and_query: &str,
    json: bool,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match err {
        GateError::WrongStatus { group, status, .. } => match status {
            ServiceStatus::ShuttingDown => shutdown_page(&group, json),
            _ => loading_page(&group, json),
        },
        GateError::BackendUnavailable { reason, .. } => {
            warn!(service, reason, "Upstream unavailable, route dropped, redirecting client to retry");
            retry_redirect(path_and_query)
        }
        other => {
            let code = other.code();
            if code == ProxyErrorCode::InternalError {
                error!(service, error = %other, "Failed to handle request");
            } else {
                debug!(service, error = %other, "Request rejected");
            }
            problem_page(code, &other.to_string(), json)
        }
    }
}
