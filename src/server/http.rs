use axum::{
    Router,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::Stream;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::{CasterError, Result};
use super::range::{parse_range, RangeRequest};

/// Serves one directory over HTTP with byte-range support so a receiver can
/// seek in a file it does not have locally.
///
/// Trust boundary: every regular file beneath the served root is readable by
/// anyone on the network, without authentication, for as long as the server
/// is bound. It is meant for a trusted LAN only.
pub struct RangeFileServer {
    ports: Vec<u16>,
    chunk_size: usize,
    advertised_host: Option<IpAddr>,
    running: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    port: u16,
    root: PathBuf,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct ServeState {
    root: Arc<PathBuf>,
    chunk_size: usize,
}

impl RangeFileServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            ports: config.ports.clone(),
            chunk_size: config.chunk_size.max(1),
            advertised_host: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_ports(ports: Vec<u16>) -> Self {
        Self::new(&ServerConfig {
            ports,
            ..ServerConfig::default()
        })
    }

    /// Host put into URLs instead of the detected LAN address.
    pub fn with_advertised_host(mut self, host: IpAddr) -> Self {
        self.advertised_host = Some(host);
        self
    }

    /// Binds the first free candidate port and serves `directory`.
    /// A previous bind is always released first.
    pub async fn start(&self, directory: impl AsRef<Path>) -> Result<u16> {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running, directory.as_ref()).await
    }

    /// URL for `file`, starting (or re-rooting) the server at the file's
    /// directory when needed.
    pub async fn get_url(&self, file: impl AsRef<Path>) -> Result<String> {
        let file = tokio::fs::canonicalize(file.as_ref()).await
            .map_err(|e| CasterError::NotFound(format!("{}: {}", file.as_ref().display(), e)))?;
        if !file.is_file() {
            return Err(CasterError::NotFound(format!("{} is not a file", file.display())));
        }

        let dir = file.parent()
            .ok_or_else(|| CasterError::NotFound(format!("{} has no parent directory", file.display())))?;
        let name = file.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CasterError::Validation(format!("{} has no UTF-8 file name", file.display())))?;

        let mut running = self.running.lock().await;
        let port = match running.as_ref() {
            Some(server) if server.root == dir => server.port,
            _ => self.start_locked(&mut running, dir).await?,
        };

        let host = self.advertised_host.unwrap_or_else(local_ip);
        Ok(format!("http://{}:{}/{}", host, port, urlencoding::encode(name)))
    }

    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        Self::stop_locked(&mut running).await;
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|s| s.port)
    }

    pub async fn root(&self) -> Option<PathBuf> {
        self.running.lock().await.as_ref().map(|s| s.root.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn start_locked(&self, running: &mut Option<RunningServer>, directory: &Path) -> Result<u16> {
        Self::stop_locked(running).await;

        let root = tokio::fs::canonicalize(directory).await
            .map_err(|e| CasterError::NotFound(format!("{}: {}", directory.display(), e)))?;
        if !root.is_dir() {
            return Err(CasterError::NotFound(format!("{} is not a directory", root.display())));
        }

        for &port in &self.ports {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Port {} unavailable ({}), trying next", port, e);
                    continue;
                }
            };

            let app = router(ServeState {
                root: Arc::new(root.clone()),
                chunk_size: self.chunk_size,
            });

            let (shutdown, shutdown_rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
                if let Err(e) = result {
                    error!("Stream server error: {}", e);
                }
            });

            info!("Stream server listening on http://{} serving {}", addr, root.display());
            *running = Some(RunningServer { port, root, shutdown, handle });
            return Ok(port);
        }

        Err(CasterError::NoAvailablePort { tried: self.ports.clone() })
    }

    async fn stop_locked(running: &mut Option<RunningServer>) {
        let Some(server) = running.take() else {
            return;
        };

        let RunningServer { port, shutdown, mut handle, .. } = server;
        let _ = shutdown.send(());

        // Graceful shutdown waits for open transfers; a receiver holding a
        // stream open must not keep the port bound.
        if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
            handle.abort();
            let _ = handle.await;
        }

        info!("Stream server on port {} stopped", port);
    }
}

impl Drop for RangeFileServer {
    fn drop(&mut self) {
        if let Some(server) = self.running.get_mut().take() {
            server.handle.abort();
        }
    }
}

fn router(state: ServeState) -> Router {
    Router::new()
        .route("/*path", get(serve_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// LAN address receivers can reach us on.
pub fn local_ip() -> IpAddr {
    local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn serve_file(
    State(state): State<ServeState>,
    UrlPath(path): UrlPath<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(file_path) = resolve_path(&state.root, &path).await else {
        debug!("Rejected request for {:?}", path);
        return StatusCode::NOT_FOUND.into_response();
    };

    match respond(&file_path, &headers, method == Method::HEAD, state.chunk_size).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Failed to serve {}: {}", file_path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Maps a request path onto a regular file strictly beneath `root`.
async fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path);
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }

    let candidate = tokio::fs::canonicalize(root.join(relative)).await.ok()?;
    if !candidate.starts_with(root) || candidate == root {
        return None;
    }

    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    metadata.is_file().then_some(candidate)
}

async fn respond(path: &Path, headers: &HeaderMap, head_only: bool, chunk_size: usize) -> Result<Response> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = parse_range(range_header, len);

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut builder = Response::builder()
        .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(content_range) = range.content_range(len) {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    let (status, start) = match range {
        RangeRequest::Full => (StatusCode::OK, 0),
        RangeRequest::Partial { start, .. } => (StatusCode::PARTIAL_CONTENT, start),
        RangeRequest::Unsatisfiable => {
            debug!("Unsatisfiable range {:?} for {} ({} bytes)", range_header, path.display(), len);
            return builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .body(Body::empty())
                .map_err(|e| CasterError::Network(e.to_string()));
        }
    };

    let body_len = range.body_len(len);
    let body = if head_only || body_len == 0 {
        Body::empty()
    } else {
        file.seek(std::io::SeekFrom::Start(start)).await?;
        Body::from_stream(file_chunks(file, body_len, chunk_size))
    };

    builder
        .status(status)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, body_len)
        .body(body)
        .map_err(|e| CasterError::Network(e.to_string()))
}

/// Reads exactly `remaining` bytes in `chunk_size` pieces. If the client goes
/// away hyper drops this stream and the file handle with it.
fn file_chunks(
    file: tokio::fs::File,
    remaining: u64,
    chunk_size: usize,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::try_unfold((file, remaining), move |(mut file, remaining)| async move {
        if remaining == 0 {
            return Ok(None);
        }

        let want = remaining.min(chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            // File shrank underneath us
            return Ok(None);
        }
        buf.truncate(n);

        Ok(Some((Bytes::from(buf), (file, remaining - n as u64))))
    })
}
