//! Worker process: serves HTTP on the inherited listening socket
//!
//! A worker is the same binary started by the supervisor with the listening
//! socket on a fixed descriptor. It loads every configured service, routes
//! each request to the first service whose prefix matches, and reacts to
//! newline-delimited commands (`stop`, `reconfigure`) read from stdin. It
//! also polls the config file and each service's touch-reload files.

use crate::app::ApplicationRegistry;
use crate::config::{modified_time, GlobalConfig};
use crate::error::{error_response, json_error_response, RouteErrorCode};
use crate::service::{PendingResponse, Service};
use anyhow::Context;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variable naming the inherited listening descriptor
pub const LISTEN_FD_ENV: &str = "MULTISERVER_LISTEN_FD";

/// Environment variable carrying the worker's slot number
pub const WORKER_SLOT_ENV: &str = "MULTISERVER_WORKER_SLOT";

/// Descriptor the listening socket is placed on in every worker
pub const INHERITED_LISTEN_FD: i32 = 3;

/// How often the config file and touch-reload files are checked
pub const CHECK_CONFIG_INTERVAL: Duration = Duration::from_secs(5);

/// Request id header, generated when the client did not send one
pub const X_REQUEST_ID: &str = "x-request-id";

/// Extra time granted to in-flight requests on shutdown, beyond the longest service timeout
const DRAIN_GRACE: Duration = Duration::from_secs(1);
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Commands the supervisor sends over the worker's stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Reconfigure,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Stop => "stop",
            Command::Reconfigure => "reconfigure",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stop" => Ok(Command::Stop),
            "reconfigure" => Ok(Command::Reconfigure),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// Read commands line by line from `reader`; end of input means stop.
pub fn forward_commands<R>(reader: R, tx: mpsc::Sender<Command>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(command) => {
                        if tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring command from supervisor"),
                },
                Ok(None) => {
                    debug!("Command channel closed");
                    let _ = tx.send(Command::Stop).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read command channel");
                    let _ = tx.send(Command::Stop).await;
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Services in configuration order; the first prefix match wins.
#[derive(Default)]
pub struct ServiceTable {
    services: Vec<Arc<Service>>,
}

impl ServiceTable {
    pub fn new(services: Vec<Arc<Service>>) -> Self {
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Longest request timeout of any service
    pub fn max_timeout(&self) -> Duration {
        self.services
            .iter()
            .map(|s| s.pool().timeout())
            .max()
            .unwrap_or_default()
    }

    /// Offer the request to each service in order
    pub fn route(&self, request: Request<Bytes>) -> PendingResponse {
        let mut request = request;
        for service in &self.services {
            match service.accept(request) {
                Ok(pending) => return pending,
                Err(unclaimed) => request = unclaimed,
            }
        }

        debug!(uri = %request.uri(), "No service matches request");
        PendingResponse::ready(error_response(
            RouteErrorCode::NoRoute,
            format!("no service matches {}", request.uri().path()),
        ))
    }
}

type SharedTable = Arc<RwLock<Arc<ServiceTable>>>;

pub struct WorkerProcess {
    config_path: PathBuf,
    registry: ApplicationRegistry,
    table: SharedTable,
    reconfigured_at: Option<SystemTime>,
    state: WorkerState,
    connections: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerProcess {
    pub fn new(config_path: impl Into<PathBuf>, registry: ApplicationRegistry) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config_path: config_path.into(),
            registry,
            table: Arc::new(RwLock::new(Arc::new(ServiceTable::default()))),
            reconfigured_at: None,
            state: WorkerState::Starting,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Snapshot of the current routing table
    pub fn services(&self) -> Arc<ServiceTable> {
        self.table.read().clone()
    }

    /// Number of open client connections
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Reload the config file and bring the service set in line with it.
    ///
    /// Every service is loaded before any is installed, so a failure leaves
    /// the running set untouched.
    pub fn reconfigure(&mut self) -> anyhow::Result<()> {
        // Recorded before reading so a broken file is not retried every check.
        self.reconfigured_at = modified_time(&self.config_path);
        let config = GlobalConfig::load(&self.config_path)?;
        let current = self.services();

        enum Staged {
            Existing(Arc<Service>, crate::service::PreparedService),
            New(Arc<Service>),
        }

        let mut staged = Vec::with_capacity(config.services.len());
        for service_config in config.services {
            let name = service_config.name.clone();
            let stage = match current.get(&name) {
                Some(existing) => Staged::Existing(
                    Arc::clone(existing),
                    existing
                        .prepare(service_config)
                        .with_context(|| format!("failed to reload service '{}'", name))?,
                ),
                None => Staged::New(Arc::new(
                    Service::new(service_config, self.registry.clone())
                        .with_context(|| format!("failed to load service '{}'", name))?,
                )),
            };
            staged.push(stage);
        }

        let services: Vec<Arc<Service>> = staged
            .into_iter()
            .map(|stage| match stage {
                Staged::Existing(service, prepared) => {
                    service.install(prepared);
                    service
                }
                Staged::New(service) => service,
            })
            .collect();

        let table = Arc::new(ServiceTable::new(services));
        for name in current.names() {
            if table.get(&name).is_none() {
                info!(service = %name, "Service removed; in-flight requests will finish");
            }
        }
        info!(services = ?table.names(), "Worker reconfigured");
        *self.table.write() = table;
        Ok(())
    }

    pub fn handle_command(&mut self, command: Command) {
        debug!(%command, "Command from supervisor");
        match command {
            Command::Stop => {
                info!("Stop requested");
                self.state = WorkerState::Stopping;
            }
            Command::Reconfigure => {
                if let Err(e) = self.reconfigure() {
                    error!(error = %format!("{:#}", e), "Reconfigure failed; keeping current services");
                }
            }
        }
    }

    /// Periodic check: reconfigure when the config file changed, otherwise
    /// give each service a chance to reload on its touch files.
    pub fn check_config(&mut self) {
        let modified = modified_time(&self.config_path);
        if modified.is_some() && modified > self.reconfigured_at {
            info!(path = %self.config_path.display(), "Config file changed");
            if let Err(e) = self.reconfigure() {
                error!(error = %format!("{:#}", e), "Reconfigure failed; keeping current services");
            }
            return;
        }

        for service in self.services().iter() {
            if let Err(e) = service.reload_if_needed() {
                error!(service = %service.name(), error = %e, "Service reload failed; keeping previous version");
            }
        }
    }

    /// Serve until told to stop, then drain open connections.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::Receiver<Command>,
    ) -> anyhow::Result<()> {
        if let Err(e) = self.reconfigure() {
            error!(error = %format!("{:#}", e), "Initial configuration failed; serving no services");
        }
        self.state = WorkerState::Running;
        info!(addr = %listener.local_addr()?, "Worker accepting connections");

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + CHECK_CONFIG_INTERVAL,
            CHECK_CONFIG_INTERVAL,
        );

        while self.state == WorkerState::Running {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                command = commands.recv() => {
                    self.handle_command(command.unwrap_or(Command::Stop));
                }
                _ = ticker.tick() => self.check_config(),
            }
        }

        drop(listener);
        self.drain().await;
        self.state = WorkerState::Stopped;
        info!("Worker stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let table = Arc::clone(&self.table);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let guard = ConnectionGuard::new(Arc::clone(&self.connections));

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = serve_connection(stream, addr, table, shutdown_rx).await {
                debug!(addr = %addr, error = %e, "Connection error");
            }
        });
    }

    async fn drain(&self) {
        let _ = self.shutdown_tx.send(true);
        let drain_timeout = self.services().max_timeout() + DRAIN_GRACE;
        let drain_start = Instant::now();

        while self.connections() > 0 {
            if drain_start.elapsed() > drain_timeout {
                warn!(
                    remaining = self.connections(),
                    "Drain timeout exceeded, closing remaining connections"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }

        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(drained_in_ms = drained_in.as_millis(), "Drained open connections");
        }
    }
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    table: SharedTable,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = table.read().clone();
        async move { handle_request(req, routes, addr).await }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result?,
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await?;
        }
    }
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    routes: Arc<ServiceTable>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(client = %client_addr, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                RouteErrorCode::BadRequest,
                "failed to read request body",
            ));
        }
    };

    let mut request = Request::from_parts(parts, body);
    if let Some(id) = &request_id {
        request.headers_mut().insert(X_REQUEST_ID, id.clone());
    }
    debug!(
        client = %client_addr,
        method = %request.method(),
        uri = %request.uri(),
        "Incoming request"
    );

    let mut response = routes.route(request).response().await;
    if let Some(id) = request_id {
        response.headers_mut().insert(X_REQUEST_ID, id);
    }
    Ok(response.map(Full::new))
}

/// Take ownership of the listening socket passed down by the supervisor
#[cfg(unix)]
pub fn inherited_listener() -> anyhow::Result<std::net::TcpListener> {
    use std::os::unix::io::FromRawFd;

    let fd: i32 = std::env::var(LISTEN_FD_ENV)
        .context("listening descriptor not provided")?
        .parse()
        .context("invalid listening descriptor")?;

    // Keep the socket out of programs the worker itself starts.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error()).context("inherited descriptor is not usable");
        }
    }

    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Worker entry point: serve on the inherited socket until stopped.
#[cfg(unix)]
pub async fn run_worker(config_path: &Path) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let slot = std::env::var(WORKER_SLOT_ENV).unwrap_or_default();
    let listener = TcpListener::from_std(inherited_listener()?)?;
    info!(slot = %slot, "Worker starting");

    let (tx, rx) = mpsc::channel(16);
    forward_commands(tokio::io::stdin(), tx.clone());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    let _ = tx.send(Command::Stop).await;
                }
                _ = sighup.recv() => {
                    let _ = tx.send(Command::Reconfigure).await;
                }
                // Interrupts reach the whole process group; the supervisor decides.
                _ = sigint.recv() => debug!("Ignoring SIGINT in worker"),
            }
        }
    });

    WorkerProcess::new(config_path, ApplicationRegistry::with_builtins())
        .run(listener, rx)
        .await
}
