//! Per-camera HTTP server
//!
//! Routes:
//! - `GET /` → 301 to `/index.html` (built-in camera only)
//! - `GET /index.html` → viewer page
//! - `GET /stream.mjpg` → endless `multipart/x-mixed-replace` stream
//! - `GET /record/current.jpg` → next frame as a single JPEG (built-in camera only)
//!
//! Every connection is its own task and its own [`FrameReceiver`], so a
//! stalled client only stalls itself.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::{CameraConfig, Resolution};
use crate::frame_buffer::{FrameBuffer, FrameReceiver};

/// Multipart boundary token
pub const BOUNDARY: &str = "FRAME";

const NO_CACHE: &str = "no-cache, private";

/// Shared state for one camera's server
#[derive(Clone)]
pub struct AppState {
    camera: Arc<CameraConfig>,
    buffer: Arc<FrameBuffer>,
}

/// HTTP front end for one stream unit
pub struct StreamingServer {
    state: AppState,
}

impl StreamingServer {
    pub fn new(camera: CameraConfig, buffer: Arc<FrameBuffer>) -> Self {
        Self {
            state: AppState {
                camera: Arc::new(camera),
                buffer,
            },
        }
    }

    /// Build the router for this camera
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/index.html", get(index_handler))
            .route("/stream.mjpg", get(stream_handler));

        if self.state.camera.kind.is_builtin() {
            router = router
                .route("/", get(redirect_handler))
                .route("/record/current.jpg", get(snapshot_handler));
        }

        router
            .fallback(not_found_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            camera = %self.state.camera.name,
            "MJPEG streaming at http://{}/stream.mjpg", addr
        );

        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

/// Viewer page embedding the stream at the camera's resolution
pub fn index_page(name: &str, resolution: Resolution) -> String {
    format!(
        r#"<html>
<head>
<title>{name} Stream</title>
</head>
<body>
<center><h1>{name} Stream</h1></center>
<center><img src="stream.mjpg" width="{width}" height="{height}"></center>
</body>
</html>
"#,
        name = name,
        width = resolution.width,
        height = resolution.height,
    )
}

/// Header block that precedes each JPEG part
pub fn part_header(len: usize) -> Bytes {
    Bytes::from(format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY, len
    ))
}

async fn redirect_handler() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
        .into_response()
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(index_page(&state.camera.name, state.camera.resolution))
}

async fn snapshot_handler(State(state): State<AppState>) -> Response {
    // Blocks until the capture loop publishes; a dead loop means the client
    // waits until it gives up.
    let Some(frame) = state.buffer.await_next().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let len = frame.data.len();
    let mut response = Response::new(Body::from(frame.data));
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response
}

async fn stream_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let client_id = peer
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(camera = %state.camera.name, client = %client_id, "Streaming client connected");

    let client = StreamClient {
        rx: state.buffer.subscribe(client_id),
        camera: state.camera.name.clone(),
    };

    // Each frame becomes three chunks so the JPEG bytes are never copied.
    let parts = stream::unfold(client, |mut client| async move {
        let frame = client.rx.next().await?;
        let chunks = [
            part_header(frame.data.len()),
            frame.data,
            Bytes::from_static(b"\r\n"),
        ];
        Some((stream::iter(chunks.map(Ok::<_, std::io::Error>)), client))
    })
    .flatten();

    let mut response = Response::new(Body::from_stream(parts));
    let headers = response.headers_mut();
    headers.insert(header::AGE, HeaderValue::from_static("0"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=FRAME"),
    );
    response
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Reader side of one multipart connection
///
/// Hyper drops the body stream when a write fails or the peer goes away,
/// which drops this and unsubscribes from the buffer.
struct StreamClient {
    rx: FrameReceiver,
    camera: String,
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        let stats = self.rx.stats();
        debug!(
            camera = %self.camera,
            client = %stats.client_id,
            frames = stats.frames_received,
            skipped = stats.frames_skipped,
            "Removed streaming client"
        );
    }
}
