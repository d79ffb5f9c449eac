//! Development server with live reload.
//!
//! Serves the output root with `tower-http`'s `ServeDir` and keeps a
//! Server-Sent-Events stream open for every connected page:
//!
//! ```text
//! GET /                      dist/index.html (+ reload script)
//! GET /css/style.css         dist/css/style.css
//! GET /__assetflow/reload    text/event-stream
//!     event: reload          full page reload
//!     event: css             stylesheet-only refresh
//!     event: build-error     failed watch cycle, logged in the console
//! ```
//!
//! The reload script is injected into every served HTML page, so sources
//! need no changes. Notifications are fire-and-forget: with no page
//! connected they go nowhere.
//!
//! The rest of the crate is synchronous; the server runs its own tokio
//! runtime on a background thread and is reached through [`DevServer`].

use crate::types::AssetClass;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Path of the event stream endpoint.
pub const RELOAD_ENDPOINT: &str = "/__assetflow/reload";

const KEEPALIVE: Duration = Duration::from_secs(15);

/// Reload messages buffered per client before a slow one starts skipping.
const CHANNEL_CAPACITY: usize = 16;

const RELOAD_SCRIPT: &str = r#"<script>
(function () {
  var source = new EventSource("/__assetflow/reload");
  source.addEventListener("reload", function () { location.reload(); });
  source.addEventListener("css", function () {
    document.querySelectorAll('link[rel="stylesheet"]').forEach(function (link) {
      var url = new URL(link.href);
      url.searchParams.set("assetflow", Date.now());
      link.href = url.href;
    });
  });
  source.addEventListener("build-error", function (e) {
    console.error("[assetflow] " + e.data);
  });
})();
</script>
"#;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The dev-server collaborator as seen by tasks and the dev session.
pub trait DevServer: Send + Sync {
    /// Begin serving `root` in the background. Returns the bound address.
    fn start(&self, root: &Path) -> Result<SocketAddr, ServeError>;

    /// Refresh connected clients after `class` was rebuilt.
    fn notify(&self, class: AssetClass);

    /// Tell connected clients that a rebuild failed.
    fn report_error(&self, message: &str);
}

/// What a connected page is told to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reload {
    Page,
    Css,
    BuildError(String),
}

impl Reload {
    /// Refresh scope for a rebuilt class: stylesheets swap in place,
    /// everything else reloads the page.
    pub fn for_class(class: AssetClass) -> Self {
        match class {
            AssetClass::Styles => Self::Css,
            _ => Self::Page,
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            Self::Page => "reload",
            Self::Css => "css",
            Self::BuildError(_) => "build-error",
        }
    }

    /// SSE form. Browsers drop events without data, so every event has some.
    fn to_event(&self) -> Event {
        let event = Event::default().event(self.event_name());
        match self {
            // SSE data cannot carry carriage returns.
            Self::BuildError(message) => {
                event.data(message.replace("\r\n", "\n").replace('\r', "\n"))
            }
            _ => event.data(self.event_name()),
        }
    }
}

/// Static file server with an SSE reload channel.
pub struct LiveServer {
    host: String,
    port: u16,
    events: broadcast::Sender<Reload>,
}

impl LiveServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            host: host.into(),
            port,
            events,
        }
    }

    /// Number of pages currently listening for reloads.
    pub fn client_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn broadcast(&self, message: Reload) {
        let event = message.event_name();
        // An error only means no page is connected.
        let clients = self.events.send(message).unwrap_or(0);
        debug!(event, clients, "broadcast");
    }
}

impl DevServer for LiveServer {
    fn start(&self, root: &Path) -> Result<SocketAddr, ServeError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = std::net::TcpListener::bind(&addr).map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dev-server")
            .enable_all()
            .build()?;
        let router = build_router(root, self.events.clone());

        thread::Builder::new()
            .name("dev-server".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!(error = %e, "dev server cannot use its socket");
                            return;
                        }
                    };
                    if let Err(e) = axum::serve(listener, router).await {
                        warn!(error = %e, "dev server stopped");
                    }
                });
            })?;

        info!(%local, "dev server listening");
        Ok(local)
    }

    fn notify(&self, class: AssetClass) {
        self.broadcast(Reload::for_class(class));
    }

    fn report_error(&self, message: &str) {
        self.broadcast(Reload::BuildError(message.to_string()));
    }
}

/// Reload stream first, every other path from the output root.
fn build_router(root: &Path, events: broadcast::Sender<Reload>) -> Router {
    Router::new()
        .route(RELOAD_ENDPOINT, get(reload_events))
        .fallback_service(ServeDir::new(root))
        .layer(middleware::from_fn(with_reload_script))
        .layer(TraceLayer::new_for_http())
        .with_state(events)
}

async fn reload_events(
    State(events): State<broadcast::Sender<Reload>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = events.subscribe();
    debug!(clients = events.receiver_count(), "reload client connected");
    Sse::new(reload_stream(rx)).keep_alive(KeepAlive::new().interval(KEEPALIVE).text("ping"))
}

fn reload_stream(
    rx: broadcast::Receiver<Reload>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => return Some((Ok(message.to_event()), rx)),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "reload client lagging"),
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// Disable caching everywhere and add the reload script to full HTML
/// responses.
async fn with_reload_script(request: Request, next: Next) -> Response {
    let head = request.method() == Method::HEAD;
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));
    if head || !is_html || response.status() != StatusCode::OK {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    match to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(inject_reload_script(&bytes)))
        }
        Err(e) => {
            warn!(error = %e, "cannot read HTML response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Insert the reload script before the last `</body>`, or append it.
/// Works on bytes so pages in any encoding pass through untouched.
fn inject_reload_script(html: &[u8]) -> Vec<u8> {
    const BODY_END: &[u8] = b"</body>";
    let at = html
        .windows(BODY_END.len())
        .rposition(|w| w.eq_ignore_ascii_case(BODY_END))
        .unwrap_or(html.len());
    let mut out = Vec::with_capacity(html.len() + RELOAD_SCRIPT.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(RELOAD_SCRIPT.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;
    use tempfile::TempDir;

    fn request(addr: SocketAddr, method: &str, path: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(
            stream,
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        String::from_utf8_lossy(&request(addr, "GET", path)).into_owned()
    }

    fn started(tmp: &TempDir) -> (LiveServer, SocketAddr) {
        let server = LiveServer::new("127.0.0.1", 0);
        let addr = server.start(tmp.path()).unwrap();
        (server, addr)
    }

    #[test]
    fn serves_index_with_reload_script() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("index.html"),
            "<html><body><p>hi</p></body></html>",
        )
        .unwrap();
        let (_server, addr) = started(&tmp);

        let response = get(addr, "/");
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("text/html"));
        assert!(response.to_ascii_lowercase().contains("cache-control: no-store"));
        let script = response.find(RELOAD_ENDPOINT).unwrap();
        assert!(script < response.find("</body>").unwrap());
        assert!(response.ends_with("</body></html>"));
    }

    #[test]
    fn head_request_gets_no_body() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.html"), "<body></body>").unwrap();
        let (_server, addr) = started(&tmp);

        let response = String::from_utf8(request(addr, "HEAD", "/index.html")).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("\r\n\r\n"), "{response}");
    }

    #[test]
    fn serves_static_files_untouched() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("css")).unwrap();
        std::fs::write(tmp.path().join("css/style.css"), "a{color:red}").unwrap();
        let (_server, addr) = started(&tmp);

        let response = get(addr, "/css/style.css?v=1");
        assert!(response.contains("text/css"));
        assert!(response.ends_with("a{color:red}"));
    }

    #[test]
    fn missing_escaping_and_undecodable_paths_are_not_found() {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("dist");
        std::fs::create_dir_all(&site).unwrap();
        std::fs::write(tmp.path().join("secret"), "s").unwrap();
        let server = LiveServer::new("127.0.0.1", 0);
        let addr = server.start(&site).unwrap();

        for path in ["/nope.html", "/../secret", "/%2e%2e/secret", "/%ff.html"] {
            let response = get(addr, path);
            assert!(response.starts_with("HTTP/1.1 404"), "{path}: {response}");
        }
    }

    #[test]
    fn percent_encoded_names_are_decoded() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a b.txt"), "spaced").unwrap();
        let (_server, addr) = started(&tmp);

        assert!(get(addr, "/a%20b.txt").ends_with("spaced"));
    }

    #[test]
    fn other_methods_are_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.html"), "<body></body>").unwrap();
        let (_server, addr) = started(&tmp);

        let response = String::from_utf8_lossy(&request(addr, "POST", "/index.html"))
            .into_owned();
        assert!(response.starts_with("HTTP/1.1 405"), "{response}");
    }

    #[test]
    fn bind_failure_names_address() {
        let tmp = TempDir::new().unwrap();
        let (_first, addr) = started(&tmp);
        let second = LiveServer::new("127.0.0.1", addr.port());
        match second.start(tmp.path()) {
            Err(ServeError::Bind { addr: shown, .. }) => {
                assert!(shown.ends_with(&addr.port().to_string()))
            }
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[test]
    fn event_stream_receives_scoped_reloads() {
        let tmp = TempDir::new().unwrap();
        let (server, addr) = started(&tmp);

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(stream, "GET {RELOAD_ENDPOINT} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.client_count(), 1);
        server.notify(AssetClass::Styles);
        server.report_error("styles: boom\r\nat line 2");

        let mut received = String::new();
        let mut buf = [0u8; 1024];
        while !received.contains("at line 2") && Instant::now() < deadline {
            let n = stream.read(&mut buf).unwrap();
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(received.contains("text/event-stream"), "{received}");
        assert!(received.contains("event: css\n"), "{received}");
        assert!(received.contains("event: build-error\n"), "{received}");
        assert!(received.contains("data: styles: boom\ndata: at line 2\n"), "{received}");
    }

    #[test]
    fn notify_without_clients_is_silent() {
        let server = LiveServer::new("127.0.0.1", 0);
        server.notify(AssetClass::Markup);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn reload_scope_per_class() {
        assert_eq!(Reload::for_class(AssetClass::Styles), Reload::Css);
        assert_eq!(Reload::for_class(AssetClass::Images), Reload::Page);
        assert_eq!(Reload::for_class(AssetClass::Markup), Reload::Page);
    }

    #[test]
    fn script_is_appended_without_body_tag() {
        let out = String::from_utf8(inject_reload_script(b"<p>fragment</p>")).unwrap();
        assert!(out.starts_with("<p>fragment</p><script>"));
    }

    #[test]
    fn script_goes_before_last_body_tag_in_any_case() {
        let out = inject_reload_script(b"<BODY>x</BODY>");
        assert!(out.starts_with(b"<BODY>x<script>"));
        assert!(out.ends_with(b"</script>\n</BODY>"));
    }

    #[test]
    fn non_utf8_pages_keep_their_bytes() {
        let html = b"<body>caf\xe9</body>";
        let out = inject_reload_script(html);
        assert!(out.starts_with(b"<body>caf\xe9<script>"));
        assert!(out.ends_with(b"</body>"));
    }
}
