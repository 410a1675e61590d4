//! HTTP front door: serves the page, executes commands, accepts uploads and
//! streams live output.

use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server};
use tokio::sync::{Notify, mpsc};
use tungstenite::Message;

use crate::commands::command::Command;
use crate::config_file::{ConfigError, ServerConfig};
use crate::dispatch::{Dispatcher, ExecRequest};
use crate::live::LiveHub;
use crate::render::{RenderOptions, render_gui, render_page};
use crate::upload::{UploadError, UploadStore, parse_upload};

/// Longest request head inspected when telling websocket upgrades apart
const MAX_HEAD: usize = 8 * 1024;
/// How long a new connection may take to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a live viewer waits for a frame from the browser before checking for output
const LIVE_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed binding {address}: {reason}")]
    Bind { address: String, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Behaviour switches taken from the `server` config section
#[derive(Debug, Clone)]
pub struct Settings {
    pub allow_cors: bool,
    pub legacy_status_codes: bool,
    pub max_upload_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Settings {
            allow_cors: defaults.allow_cors,
            legacy_status_codes: defaults.legacy_status_codes,
            max_upload_bytes: defaults.max_upload_bytes,
        }
    }
}

/// Everything a request handler needs, shared by all handlers
pub struct App {
    dispatcher: Dispatcher,
    uploads: UploadStore,
    /// Rendered once; the tree never changes after startup
    page: Option<String>,
    settings: Settings,
}

impl App {
    #[must_use]
    pub fn new(dispatcher: Dispatcher, uploads: UploadStore) -> Self {
        App {
            dispatcher,
            uploads,
            page: None,
            settings: Settings::default(),
        }
    }

    /// Serve `GET /` from `template` with the GUI substituted in
    #[must_use]
    pub fn with_page(mut self, template: &str, options: &RenderOptions) -> Self {
        let gui = render_gui(self.dispatcher.root(), options);
        self.page = Some(render_page(template, &gui));
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the app described by a `server` config section.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the tree is invalid, the page template cannot be
    /// read, or the upload directory cannot be created.
    pub fn from_config(root: Arc<Command>, config: &ServerConfig) -> Result<Self, ServerError> {
        let mut dispatcher = Dispatcher::new(root)?;
        if config.live_output {
            dispatcher = dispatcher.with_live(LiveHub::new());
        }
        let uploads = match &config.upload_dir {
            Some(dir) => UploadStore::in_dir(dir)?,
            None => UploadStore::temporary()?,
        };
        let mut app = App::new(dispatcher, uploads).with_settings(Settings {
            allow_cors: config.allow_cors,
            legacy_status_codes: config.legacy_status_codes,
            max_upload_bytes: config.max_upload_bytes,
        });
        if let Some(template) = config.read_page()? {
            let options = RenderOptions {
                server_address: config.public_address.clone(),
                live_output: config.live_output,
            };
            app = app.with_page(&template, &options);
        }
        Ok(app)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// A request with its body already read
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub target: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl IncomingRequest {
    #[must_use]
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        IncomingRequest {
            method,
            target: target.into(),
            content_type: None,
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    fn has_content_type(&self, expected: &str) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(expected))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Reply {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Reply {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    fn html(body: &str) -> Self {
        Reply {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    fn json(body: Vec<u8>) -> Self {
        Reply {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    fn empty(status: u16) -> Self {
        Reply {
            status,
            content_type: "text/plain; charset=utf-8",
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Answer one request whose body has already been read
#[must_use]
pub fn route(app: &App, request: &IncomingRequest) -> Reply {
    match (&request.method, request.path()) {
        (Method::Options, _) if app.settings.allow_cors => Reply::empty(204),
        (Method::Get, "/") => match &app.page {
            Some(page) => Reply::html(page),
            None => Reply::text(404, "no page template configured"),
        },
        (Method::Post, "/upload") => upload(app, request),
        (_, "/ws") => match app.dispatcher.live() {
            Some(_) => Reply::text(400, "expected a websocket upgrade"),
            None => Reply::text(404, "live output is disabled"),
        },
        (Method::Get | Method::Post, _) => execute(app, request),
        _ => Reply::text(404, "not found"),
    }
}

fn upload(app: &App, request: &IncomingRequest) -> Reply {
    let content_type = request.content_type.as_deref().unwrap_or_default();
    let result = parse_upload(content_type, request.body.clone())
        .and_then(|form| app.uploads.accept(&form));
    match result {
        Ok(response) => match serde_json::to_vec(&response) {
            Ok(body) => Reply::json(body),
            Err(e) => Reply::text(500, e.to_string()),
        },
        Err(e) => {
            warn!("Upload failed: {e}");
            Reply::text(e.status(app.settings.legacy_status_codes), e.to_string())
        }
    }
}

fn execute(app: &App, request: &IncomingRequest) -> Reply {
    let form = (request.method == Method::Post
        && request.has_content_type("application/x-www-form-urlencoded"))
    .then_some(request.body.as_slice());
    let result = ExecRequest::from_target(&request.target, form)
        .and_then(|exec| app.dispatcher.dispatch(&exec));
    match result {
        Ok(execution) => Reply::text(200, execution.output),
        Err(e) => Reply::text(e.status(app.settings.legacy_status_codes), e.to_string()),
    }
}

/// Handle for stopping a running server
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.notify.notify_one();
    }
}

/// Public listener in front of the HTTP handler. Websocket upgrades for `/ws`
/// are served straight off the accepted socket; every other connection is
/// relayed to a `tiny_http` server bound on loopback.
pub struct GuiServer {
    listener: TcpListener,
    backend: Arc<Server>,
    backend_addr: SocketAddr,
    app: Arc<App>,
    shutdown: ShutdownHandle,
}

impl GuiServer {
    /// Listen on `address` (`host:port`, port 0 picks a free one).
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Bind` if the address cannot be bound.
    pub fn bind(address: &str, app: App) -> Result<Self, ServerError> {
        let bind_error = |reason: String| ServerError::Bind {
            address: address.to_string(),
            reason,
        };
        let listener = TcpListener::bind(address).map_err(|e| bind_error(e.to_string()))?;
        let backend = Server::http("127.0.0.1:0").map_err(|e| bind_error(e.to_string()))?;
        let backend_addr = backend
            .server_addr()
            .to_ip()
            .ok_or_else(|| bind_error("request handler has no IP address".to_string()))?;
        Ok(GuiServer {
            listener,
            backend: Arc::new(backend),
            backend_addr,
            app: Arc::new(app),
            shutdown: ShutdownHandle {
                notify: Arc::new(Notify::new()),
            },
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve requests until the shutdown handle fires. Each request is handled
    /// on the blocking pool, so long-running commands do not hold up others.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; handler failures are answered per request.
    pub async fn run(self) -> Result<(), ServerError> {
        let GuiServer {
            listener,
            backend,
            backend_addr,
            app,
            shutdown,
        } = self;
        let public_addr = listener.local_addr().ok();
        if let Some(addr) = public_addr {
            info!("Listening on http://{addr}");
        }

        let stopping = Arc::new(AtomicBool::new(false));
        {
            let app = app.clone();
            let stopping = stopping.clone();
            thread::spawn(move || accept_connections(&listener, backend_addr, &app, &stopping));
        }

        let (tx, mut rx) = mpsc::channel::<Request>(16);
        let receiver = backend.clone();
        thread::spawn(move || {
            while let Ok(request) = receiver.recv() {
                if tx.blocking_send(request).is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                () = shutdown.notify.notified() => {
                    info!("Shutting down");
                    break;
                }
                maybe_req = rx.recv() => {
                    let Some(request) = maybe_req else {
                        break;
                    };
                    let app = app.clone();
                    tokio::task::spawn_blocking(move || handle(&app, request));
                }
            }
        }

        stopping.store(true, Ordering::SeqCst);
        if let Some(addr) = public_addr {
            wake_listener(addr);
        }
        backend.unblock();
        Ok(())
    }
}

fn accept_connections(
    listener: &TcpListener,
    backend: SocketAddr,
    app: &Arc<App>,
    stopping: &AtomicBool,
) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let app = app.clone();
                thread::spawn(move || serve_connection(stream, backend, &app));
            }
            Err(e) => debug!("Failed to accept connection: {e}"),
        }
    }
    debug!("Stopped accepting connections");
}

/// Unblock `accept` so the listener thread sees the stop flag
fn wake_listener(mut addr: SocketAddr) {
    if addr.ip().is_unspecified() {
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
    }
    if let Err(e) = TcpStream::connect_timeout(&addr, Duration::from_secs(2)) {
        debug!("Failed to wake listener at {addr}: {e}");
    }
}

fn serve_connection(stream: TcpStream, backend: SocketAddr, app: &App) {
    let head = match peek_head(&stream) {
        Ok(head) if head.is_empty() => return,
        Ok(head) => head,
        Err(e) => {
            debug!("Dropping connection before a request arrived: {e}");
            return;
        }
    };
    match app.dispatcher.live() {
        Some(live) if is_websocket_request(&head) => stream_live(stream, live),
        _ => {
            if let Err(e) = relay(stream, backend) {
                debug!("Connection ended: {e}");
            }
        }
    }
}

/// Look at the request head without consuming it
fn peek_head(stream: &TcpStream) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(HEAD_TIMEOUT))?;
    let started = Instant::now();
    let mut buf = vec![0; MAX_HEAD];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf)?;
        if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            buf.truncate(n);
            break;
        }
        if started.elapsed() > HEAD_TIMEOUT {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "request head did not arrive in time",
            ));
        }
        if n == seen {
            thread::sleep(Duration::from_millis(5));
        }
        seen = n;
    }
    stream.set_read_timeout(None)?;
    Ok(buf)
}

/// `GET /ws` carrying `Upgrade: websocket`
fn is_websocket_request(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();
    let Some(target) = lines.next().and_then(|line| line.strip_prefix("GET ")) else {
        return false;
    };
    if target.split([' ', '?']).next() != Some("/ws") {
        return false;
    }
    lines.any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

/// Pipe a plain HTTP connection through the request handler
fn relay(client: TcpStream, backend: SocketAddr) -> io::Result<()> {
    let upstream = TcpStream::connect(backend)?;
    let mut requests = client.try_clone()?;
    let mut upstream_in = upstream.try_clone()?;
    let pump = thread::spawn(move || {
        let _ = io::copy(&mut requests, &mut upstream_in);
        let _ = upstream_in.shutdown(Shutdown::Write);
    });
    let (mut responses, mut client_out) = (upstream, client);
    let copied = io::copy(&mut responses, &mut client_out);
    let _ = client_out.shutdown(Shutdown::Both);
    let _ = pump.join();
    copied.map(|_| ())
}

fn header<'a>(request: &'a Request, name: &'static str) -> Option<&'a str> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str())
}

fn read_body(request: &mut Request, limit: u64) -> io::Result<Option<Vec<u8>>> {
    if request
        .body_length()
        .is_some_and(|len| len as u64 > limit)
    {
        return Ok(None);
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(limit.saturating_add(1))
        .read_to_end(&mut body)?;
    Ok((body.len() as u64 <= limit).then_some(body))
}

fn handle(app: &App, mut request: Request) {
    let target = request.url().to_string();
    let method = request.method().clone();
    debug!("{method} {target}");

    let reply = match read_body(&mut request, app.settings.max_upload_bytes) {
        Ok(Some(body)) => {
            let incoming = IncomingRequest {
                method,
                target,
                content_type: header(&request, "Content-Type").map(str::to_string),
                body,
            };
            route(app, &incoming)
        }
        Ok(None) => Reply::text(
            413,
            format!(
                "request body exceeds {} bytes",
                app.settings.max_upload_bytes
            ),
        ),
        Err(e) => Reply::text(400, format!("failed reading request body: {e}")),
    };

    let mut response = Response::from_data(reply.body).with_status_code(reply.status);
    let mut headers = vec![("Content-Type", reply.content_type)];
    if app.settings.allow_cors {
        headers.extend([
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
            ("Access-Control-Allow-Headers", "Content-Type"),
        ]);
    }
    for (field, value) in headers {
        if let Ok(header) = Header::from_bytes(field.as_bytes(), value.as_bytes()) {
            response.add_header(header);
        }
    }
    if let Err(e) = request.respond(response) {
        debug!("Failed to send response: {e}");
    }
}

/// Forward live output to one browser until it closes the connection or a send fails
fn stream_live(stream: TcpStream, live: &LiveHub) {
    // Subscribed before the handshake completes, so nothing published after
    // the viewer sees the upgrade is missed
    let output = live.subscribe();
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Live output handshake failed: {e}");
            return;
        }
    };
    if let Err(e) = socket.get_ref().set_read_timeout(Some(LIVE_POLL)) {
        warn!("Failed to configure live output socket: {e}");
        return;
    }
    info!("Live output viewer connected");
    'viewer: loop {
        for chunk in output.try_iter() {
            if let Err(e) = socket.send(Message::text(chunk)) {
                debug!("Live output viewer went away: {e}");
                break 'viewer;
            }
        }
        match socket.read() {
            Ok(Message::Close(_)) => {
                // Sends the queued close reply
                let _ = socket.flush();
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                debug!("Live output viewer went away: {e}");
                break;
            }
        }
    }
    info!("Live output viewer disconnected");
}
