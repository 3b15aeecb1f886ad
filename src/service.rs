//! Services: one hosted application behind a URI prefix
//!
//! Each service owns a bounded request pool. Admission is decided up front:
//! a request either gets one of `queue_capacity` slots (covering both queued
//! and running requests) or is refused at once with `SERVICE_BUSY`. Admitted
//! requests then wait for one of `max_workers` execution permits.
//!
//! Reconfiguration is two-phase. [`Service::prepare`] loads the application
//! without touching the live state; [`Service::install`] swaps it in and
//! resizes the pool. The pool itself lives as long as the service, so the
//! capacity bound holds across reloads. Requests already executing finish
//! against the handle they started with, queued requests pick up whichever
//! handle is live when they start.

use crate::app::{AppDescriptor, ApplicationRegistry, LoadedApp, ServiceTag};
use crate::config::{modified_time, ServiceConfig};
use crate::error::{error_response, LoadError, RouteErrorCode};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Request, Response, Uri};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Response header naming the service that handled a request
pub const X_MULTISERVER_SERVICE: &str = "x-multiserver-service";

/// The application handle requests execute against
type LiveApp = Arc<RwLock<LoadedApp>>;

#[derive(Debug)]
struct Limits {
    capacity: usize,
    max_workers: usize,
    timeout: Duration,
    // Permits still held by requests that must be forgotten on release
    // because the pool shrank underneath them.
    admission_debt: usize,
    worker_debt: usize,
}

/// Bounded executor shared by every generation of one service
#[derive(Debug)]
pub struct RequestPool {
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    limits: Mutex<Limits>,
}

impl RequestPool {
    pub fn new(max_workers: usize, queue_capacity: usize, timeout: Duration) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(queue_capacity)),
            workers: Arc::new(Semaphore::new(max_workers)),
            limits: Mutex::new(Limits {
                capacity: queue_capacity,
                max_workers,
                timeout,
                admission_debt: 0,
                worker_debt: 0,
            }),
        }
    }

    /// Requests admitted and not yet answered (queued plus running)
    pub fn pending(&self) -> usize {
        let limits = self.limits.lock();
        (limits.capacity + limits.admission_debt)
            .saturating_sub(self.admission.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.limits.lock().capacity
    }

    pub fn max_workers(&self) -> usize {
        self.limits.lock().max_workers
    }

    pub fn timeout(&self) -> Duration {
        self.limits.lock().timeout
    }

    /// Apply new limits without forgetting the requests already admitted.
    ///
    /// Shrinking takes idle permits out of circulation at once; permits held
    /// by running or queued requests are retired as those requests finish.
    pub fn resize(&self, max_workers: usize, queue_capacity: usize, timeout: Duration) {
        let mut limits = self.limits.lock();
        if limits.capacity == queue_capacity
            && limits.max_workers == max_workers
            && limits.timeout == timeout
        {
            return;
        }

        let Limits {
            capacity,
            max_workers: workers,
            admission_debt,
            worker_debt,
            ..
        } = &mut *limits;
        adjust(&self.admission, admission_debt, *capacity, queue_capacity);
        adjust(&self.workers, worker_debt, *workers, max_workers);

        debug!(
            from_capacity = limits.capacity,
            to_capacity = queue_capacity,
            from_workers = limits.max_workers,
            to_workers = max_workers,
            "Request pool resized"
        );
        limits.capacity = queue_capacity;
        limits.max_workers = max_workers;
        limits.timeout = timeout;
    }

    /// Hand permits back, retiring any the pool no longer owes out
    fn release(&self, worker: Option<OwnedSemaphorePermit>, admitted: OwnedSemaphorePermit) {
        let mut limits = self.limits.lock();
        if let Some(worker) = worker {
            if limits.worker_debt > 0 {
                limits.worker_debt -= 1;
                worker.forget();
            }
        }
        if limits.admission_debt > 0 {
            limits.admission_debt -= 1;
            admitted.forget();
        }
    }

    fn submit(
        self: &Arc<Self>,
        service: &str,
        request: Request<Bytes>,
        live: LiveApp,
    ) -> PendingResponse {
        let admitted = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let capacity = self.capacity();
                warn!(
                    service = %service,
                    capacity,
                    uri = %request.uri(),
                    "Service queue full, rejecting request"
                );
                return PendingResponse::ready(error_response(
                    RouteErrorCode::ServiceBusy,
                    format!("service '{}' is at capacity", service),
                ));
            }
        };

        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);
        let service = service.to_string();

        tokio::spawn(async move {
            let (response, slot) = match Arc::clone(&pool.workers).acquire_owned().await {
                Ok(slot) => {
                    let timeout = pool.timeout();
                    (execute(&service, request, &live, timeout).await, Some(slot))
                }
                Err(_) => (
                    error_response(RouteErrorCode::ServiceBusy, "service pool closed"),
                    None,
                ),
            };
            pool.release(slot, admitted);
            // The caller may have gone away (client disconnected).
            let _ = tx.send(response);
        });

        PendingResponse::waiting(rx)
    }
}

fn adjust(semaphore: &Semaphore, debt: &mut usize, from: usize, to: usize) {
    if to > from {
        let grow = to - from;
        let repaid = grow.min(*debt);
        *debt -= repaid;
        if grow > repaid {
            semaphore.add_permits(grow - repaid);
        }
    } else {
        *debt += from - to;
        while *debt > 0 {
            match semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    *debt -= 1;
                }
                Err(_) => break,
            }
        }
    }
}

async fn execute(
    service: &str,
    request: Request<Bytes>,
    live: &LiveApp,
    timeout: Duration,
) -> Response<Bytes> {
    let loaded = live.read().clone();
    let uri = request.uri().clone();
    let task = tokio::spawn(loaded.app.call(request));
    let abort = task.abort_handle();

    let mut response = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(response))) => response,
        Ok(Ok(Err(e))) => {
            error!(service = %service, uri = %uri, error = ?e, "Application failed to handle request");
            error_response(RouteErrorCode::ApplicationError, "application error")
        }
        Ok(Err(join_error)) => {
            error!(service = %service, uri = %uri, error = %join_error, "Application panicked while handling request");
            error_response(RouteErrorCode::ApplicationError, "application error")
        }
        Err(_) => {
            abort.abort();
            warn!(service = %service, uri = %uri, timeout_secs = timeout.as_secs(), "Request timed out");
            error_response(
                RouteErrorCode::RequestTimeout,
                format!("no response within {}s", timeout.as_secs()),
            )
        }
    };

    if let Ok(value) = HeaderValue::from_str(service) {
        response.headers_mut().insert(X_MULTISERVER_SERVICE, value);
    }
    response
}

/// A response that will be produced by the service pool
#[derive(Debug)]
pub struct PendingResponse {
    inner: Pending,
}

#[derive(Debug)]
enum Pending {
    Ready(Response<Bytes>),
    Waiting(oneshot::Receiver<Response<Bytes>>),
}

impl PendingResponse {
    pub fn ready(response: Response<Bytes>) -> Self {
        Self {
            inner: Pending::Ready(response),
        }
    }

    fn waiting(rx: oneshot::Receiver<Response<Bytes>>) -> Self {
        Self {
            inner: Pending::Waiting(rx),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner, Pending::Ready(_))
    }

    /// Wait for the response
    pub async fn response(self) -> Response<Bytes> {
        match self.inner {
            Pending::Ready(response) => response,
            Pending::Waiting(rx) => rx.await.unwrap_or_else(|_| {
                error_response(RouteErrorCode::ApplicationError, "request was abandoned")
            }),
        }
    }
}

/// Everything a service generation needs, built before it goes live
#[derive(Debug)]
pub struct PreparedService {
    config: ServiceConfig,
    app: LoadedApp,
    stamps: HashMap<PathBuf, Option<SystemTime>>,
}

impl PreparedService {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

pub struct Service {
    name: String,
    registry: ApplicationRegistry,
    config: RwLock<Arc<ServiceConfig>>,
    pool: Arc<RequestPool>,
    live: LiveApp,
    reload_stamps: Mutex<HashMap<PathBuf, Option<SystemTime>>>,
    configure_lock: Mutex<()>,
}

impl Service {
    /// Load the application and build the service
    pub fn new(config: ServiceConfig, registry: ApplicationRegistry) -> Result<Self, LoadError> {
        let prepared = prepare_with(&registry, config)?;
        Ok(Self::from_prepared(prepared, registry))
    }

    /// Build a service from an already loaded generation
    pub fn from_prepared(prepared: PreparedService, registry: ApplicationRegistry) -> Self {
        let config = prepared.config;
        info!(
            service = %config.name,
            prefix = %config.prefix,
            handler = %prepared.app.handler,
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            "Service configured"
        );
        let pool = RequestPool::new(
            config.max_workers,
            config.queue_capacity,
            config.request_timeout(),
        );
        Self {
            name: config.name.clone(),
            registry,
            pool: Arc::new(pool),
            live: Arc::new(RwLock::new(prepared.app)),
            reload_stamps: Mutex::new(prepared.stamps),
            config: RwLock::new(Arc::new(config)),
            configure_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> String {
        self.config.read().prefix.clone()
    }

    pub fn config(&self) -> ServiceConfig {
        ServiceConfig::clone(&self.config.read())
    }

    pub fn pool(&self) -> Arc<RequestPool> {
        Arc::clone(&self.pool)
    }

    pub fn handler(&self) -> String {
        self.live.read().handler.clone()
    }

    /// Load a new generation without affecting the live one
    pub fn prepare(&self, config: ServiceConfig) -> Result<PreparedService, LoadError> {
        prepare_with(&self.registry, config)
    }

    /// Make a prepared generation live
    pub fn install(&self, prepared: PreparedService) {
        let _guard = self.configure_lock.lock();
        self.swap(prepared);
    }

    fn swap(&self, prepared: PreparedService) {
        let config = prepared.config;
        self.pool.resize(
            config.max_workers,
            config.queue_capacity,
            config.request_timeout(),
        );
        *self.live.write() = prepared.app;
        *self.reload_stamps.lock() = prepared.stamps;
        *self.config.write() = Arc::new(config);
        debug!(service = %self.name, "Service generation installed");
    }

    /// Reload with `config`, or with the current config when `None`.
    ///
    /// Calls are serialized, so the last one to start is the one that stays
    /// live. On failure the previous generation stays live.
    pub fn configure(&self, config: Option<ServiceConfig>) -> Result<(), LoadError> {
        let _guard = self.configure_lock.lock();
        let config = config.unwrap_or_else(|| self.config());
        let prepared = self.prepare(config)?;
        self.swap(prepared);
        info!(service = %self.name, "Service reloaded");
        Ok(())
    }

    /// Claim `request` if its URI starts with this service's prefix.
    ///
    /// The prefix is stripped (and `replace_prefix` prepended) before the
    /// request is queued. Requests that do not match are handed back.
    pub fn accept(&self, mut request: Request<Bytes>) -> Result<PendingResponse, Request<Bytes>> {
        let config = self.config.read().clone();

        let original = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let Some(rest) = original.strip_prefix(config.prefix.as_str()) else {
            return Err(request);
        };

        let rewritten = rewrite_path(rest, config.replace_prefix.as_deref());
        match rewritten.parse::<Uri>() {
            Ok(uri) => *request.uri_mut() = uri,
            Err(e) => {
                return Ok(PendingResponse::ready(error_response(
                    RouteErrorCode::BadRequest,
                    format!("cannot rewrite request URI: {}", e),
                )))
            }
        }
        request
            .extensions_mut()
            .insert(ServiceTag(self.name.clone()));

        Ok(self.pool.submit(&self.name, request, Arc::clone(&self.live)))
    }

    /// Reconfigure if any touch-reload file changed since the last look.
    ///
    /// Returns whether a reload was attempted. A failed reload keeps the old
    /// generation, and the new timestamps are remembered either way so a
    /// broken application is not reloaded on every check.
    pub fn reload_if_needed(&self) -> Result<bool, LoadError> {
        let changed = {
            let mut stamps = self.reload_stamps.lock();
            let mut changed = None;
            for (path, seen) in stamps.iter_mut() {
                let current = modified_time(path);
                if current.is_some() && current != *seen {
                    *seen = current;
                    changed.get_or_insert_with(|| path.clone());
                }
            }
            changed
        };

        let Some(path) = changed else {
            return Ok(false);
        };

        info!(service = %self.name, file = %path.display(), "Reload file changed");
        self.configure(None)?;
        Ok(true)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        debug!(service = %self.name, "Service retired");
    }
}

fn prepare_with(
    registry: &ApplicationRegistry,
    config: ServiceConfig,
) -> Result<PreparedService, LoadError> {
    let stamps = config
        .touch_reload
        .iter()
        .map(|path| (path.clone(), modified_time(path)))
        .collect();

    let app = registry.load(&AppDescriptor::from(&config))?;

    Ok(PreparedService { config, app, stamps })
}

/// The path a service sees once its prefix has been stripped
fn rewrite_path(rest: &str, replace_prefix: Option<&str>) -> String {
    let rooted = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };
    match replace_prefix {
        Some(prefix) => format!("{}{}", prefix, rooted),
        None => rooted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppFuture, Application};
    use futures::FutureExt;
    use hyper::StatusCode;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Answers with its own label and the path it saw
    struct Labelled(String);

    impl Application for Labelled {
        fn call(&self, request: Request<Bytes>) -> AppFuture {
            let body = format!("{} {}", self.0, request.uri());
            async move { Ok(Response::new(Bytes::from(body))) }.boxed()
        }
    }

    /// Waits until released
    struct Gate(Arc<Notify>);

    impl Application for Gate {
        fn call(&self, _request: Request<Bytes>) -> AppFuture {
            let gate = Arc::clone(&self.0);
            async move {
                gate.notified().await;
                Ok(Response::new(Bytes::from("released")))
            }
            .boxed()
        }
    }

    struct Failing;

    impl Application for Failing {
        fn call(&self, request: Request<Bytes>) -> AppFuture {
            async move {
                if request.uri().path() == "/panic" {
                    panic!("handler blew up");
                }
                Err::<Response<Bytes>, _>(anyhow::anyhow!("handler error"))
            }
            .boxed()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        registry: ApplicationRegistry,
        loads: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    impl Fixture {
        fn new() -> Self {
            let loads = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Notify::new());
            let mut registry = ApplicationRegistry::empty();

            let counter = Arc::clone(&loads);
            registry.register("label", move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let label = ctx.get_str("label").unwrap_or("none").to_string();
                Ok(Arc::new(Labelled(label)) as Arc<dyn Application>)
            });
            let released = Arc::clone(&gate);
            registry.register("gate", move |_ctx| {
                Ok(Arc::new(Gate(Arc::clone(&released))) as Arc<dyn Application>)
            });
            registry.register("failing", |_ctx| Ok(Arc::new(Failing) as Arc<dyn Application>));
            registry.register("slow", |ctx| {
                let delay = ctx.get("delay_ms").and_then(|v| v.as_integer()).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(delay as u64));
                let label = ctx.get_str("label").unwrap_or("none").to_string();
                Ok(Arc::new(Labelled(label)) as Arc<dyn Application>)
            });

            Self {
                dir: tempfile::tempdir().unwrap(),
                registry,
                loads,
                gate,
            }
        }

        fn manifest(&self, body: &str) -> PathBuf {
            let path = self.dir.path().join("app.toml");
            std::fs::write(&path, body).unwrap();
            path
        }

        fn service(&self, config: ServiceConfig) -> Service {
            Service::new(config, self.registry.clone()).unwrap()
        }
    }

    fn request(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    async fn body_of(pending: PendingResponse) -> String {
        let response = pending.response().await;
        String::from_utf8(response.body().to_vec()).unwrap()
    }

    fn touch(path: &Path, offset_secs: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
            .unwrap();
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/items", None), "/items");
        assert_eq!(rewrite_path("", None), "/");
        assert_eq!(rewrite_path("?q=1", None), "/?q=1");
        assert_eq!(rewrite_path("x", Some("/api")), "/api/x");
        assert_eq!(rewrite_path("/x?y=2", Some("/v2")), "/v2/x?y=2");
    }

    #[tokio::test]
    async fn test_accept_strips_prefix() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"label\"\nlabel = \"one\"\n");
        let service = fx.service(ServiceConfig::new("svc", file).with_prefix("/hello"));

        let pending = service.accept(request("/hello/world?x=1")).unwrap();
        assert_eq!(body_of(pending).await, "one /world?x=1");

        let pending = service.accept(request("/hello")).unwrap();
        assert_eq!(body_of(pending).await, "one /");

        let rejected = service.accept(request("/other")).unwrap_err();
        assert_eq!(rejected.uri().path(), "/other");
    }

    #[tokio::test]
    async fn test_accept_replaces_prefix_and_tags_response() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"label\"\nlabel = \"one\"\n");
        let mut config = ServiceConfig::new("svc", file).with_prefix("/old");
        config.replace_prefix = Some("/new".to_string());
        let service = fx.service(config);

        let response = service
            .accept(request("/old/path"))
            .unwrap()
            .response()
            .await;
        assert_eq!(response.body(), &Bytes::from("one /new/path"));
        assert_eq!(response.headers()[X_MULTISERVER_SERVICE], "svc");
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"gate\"\n");
        let service = fx.service(ServiceConfig::new("svc", file).with_limits(1, 2));

        let first = service.accept(request("/a")).unwrap();
        let second = service.accept(request("/b")).unwrap();
        assert_eq!(service.pool().pending(), 2);

        let third = service.accept(request("/c")).unwrap();
        assert!(third.is_ready());
        let response = third.response().await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        fx.gate.notify_waiters();
        // Only one runs at a time; release until both have answered.
        let release = {
            let gate = Arc::clone(&fx.gate);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    gate.notify_waiters();
                }
            })
        };
        assert_eq!(body_of(first).await, "released");
        assert_eq!(body_of(second).await, "released");
        release.abort();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.pool().pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_frees_slot() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"gate\"\n");
        let mut config = ServiceConfig::new("svc", file).with_limits(1, 1);
        config.timeout = 1;
        let service = fx.service(config);

        let response = service.accept(request("/slow")).unwrap().response().await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.pool().pending(), 0);
        assert!(!service.accept(request("/again")).unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_application_errors_are_isolated() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"failing\"\n");
        let service = fx.service(ServiceConfig::new("svc", file));

        let response = service.accept(request("/error")).unwrap().response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = service.accept(request("/panic")).unwrap().response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // The service keeps working afterwards
        let response = service.accept(request("/error")).unwrap().response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_configure_swaps_handle() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"label\"\nlabel = \"one\"\n");
        let service = fx.service(ServiceConfig::new("svc", file.clone()));
        assert_eq!(body_of(service.accept(request("/x")).unwrap()).await, "one /x");

        fx.manifest("[application]\nhandler = \"label\"\nlabel = \"two\"\n");
        service.configure(None).unwrap();
        assert_eq!(body_of(service.accept(request("/x")).unwrap()).await, "two /x");

        let next = ServiceConfig::new("svc", file).with_prefix("/moved");
        service.configure(Some(next)).unwrap();
        assert_eq!(service.prefix(), "/moved");
        assert!(service.accept(request("/x")).is_err());
    }

    #[tokio::test]
    async fn test_failed_configure_keeps_old_handle() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"label\"\nlabel = \"one\"\n");
        let service = fx.service(ServiceConfig::new("svc", file));

        fx.manifest("[application]\nhandler = \"nonexistent\"\n");
        assert!(service.configure(None).is_err());
        assert_eq!(body_of(service.accept(request("/x")).unwrap()).await, "one /x");
    }

    #[tokio::test]
    async fn test_queued_requests_use_new_handle() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"gate\"\n");
        let service = fx.service(ServiceConfig::new("svc", file.clone()).with_limits(1, 5));

        let running = service.accept(request("/first")).unwrap();
        let queued = service.accept(request("/second")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.manifest("[application]\nhandler = \"label\"\nlabel = \"new\"\n");
        let prepared = service
            .prepare(ServiceConfig::new("svc", file).with_limits(1, 5))
            .unwrap();
        service.install(prepared);

        fx.gate.notify_waiters();
        assert_eq!(body_of(running).await, "released");
        assert_eq!(body_of(queued).await, "new /second");
    }

    #[tokio::test]
    async fn test_touch_reload_triggers_once() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"label\"\n");
        let marker = fx.dir.path().join("reload.txt");
        std::fs::write(&marker, "").unwrap();

        let mut config = ServiceConfig::new("svc", file);
        config.touch_reload = vec![marker.clone(), fx.dir.path().join("missing.txt")];
        let service = fx.service(config);
        assert_eq!(fx.loads.load(Ordering::SeqCst), 1);

        assert!(!service.reload_if_needed().unwrap());

        touch(&marker, 5);
        assert!(service.reload_if_needed().unwrap());
        assert_eq!(fx.loads.load(Ordering::SeqCst), 2);

        assert!(!service.reload_if_needed().unwrap());
        assert_eq!(fx.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_touch_reload_not_retried() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"label\"\nlabel = \"one\"\n");
        let marker = fx.dir.path().join("reload.txt");
        std::fs::write(&marker, "").unwrap();

        let mut config = ServiceConfig::new("svc", file);
        config.touch_reload = vec![marker.clone()];
        let service = fx.service(config);

        fx.manifest("[application]\nhandler = \"nonexistent\"\n");
        touch(&marker, 5);
        assert!(service.reload_if_needed().is_err());
        assert!(!service.reload_if_needed().unwrap());
        assert_eq!(body_of(service.accept(request("/x")).unwrap()).await, "one /x");
    }

    #[tokio::test]
    async fn test_touch_reload_keeps_queue_bound() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"gate\"\n");
        let marker = fx.dir.path().join("reload.txt");
        std::fs::write(&marker, "").unwrap();

        let mut config = ServiceConfig::new("svc", file).with_limits(1, 1);
        config.touch_reload = vec![marker.clone()];
        let service = fx.service(config);
        let pool = service.pool();

        let first = service.accept(request("/a")).unwrap();
        assert!(!first.is_ready());
        tokio::time::sleep(Duration::from_millis(20)).await;

        touch(&marker, 5);
        assert!(service.reload_if_needed().unwrap());
        assert!(Arc::ptr_eq(&pool, &service.pool()));

        let second = service.accept(request("/b")).unwrap();
        assert!(second.is_ready());
        assert_eq!(second.response().await.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(service.pool().pending(), 1);

        fx.gate.notify_waiters();
        assert_eq!(body_of(first).await, "released");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.pool().pending(), 0);
    }

    #[tokio::test]
    async fn test_shrinking_limits_counts_admitted_requests() {
        let fx = Fixture::new();
        let file = fx.manifest("[application]\nhandler = \"gate\"\n");
        let service = fx.service(ServiceConfig::new("svc", file.clone()).with_limits(2, 3));

        let a = service.accept(request("/a")).unwrap();
        let b = service.accept(request("/b")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let prepared = service
            .prepare(ServiceConfig::new("svc", file).with_limits(1, 1))
            .unwrap();
        service.install(prepared);
        assert_eq!(service.pool().capacity(), 1);
        assert_eq!(service.pool().pending(), 2);

        let refused = service.accept(request("/c")).unwrap();
        assert!(refused.is_ready());

        fx.gate.notify_waiters();
        assert_eq!(body_of(a).await, "released");
        assert_eq!(body_of(b).await, "released");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.pool().pending(), 0);

        // Exactly one slot is left after the shrink.
        let admitted = service.accept(request("/d")).unwrap();
        assert!(!admitted.is_ready());
        let refused = service.accept(request("/e")).unwrap();
        assert!(refused.is_ready());

        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.gate.notify_waiters();
        assert_eq!(body_of(admitted).await, "released");
    }

    #[test]
    fn test_concurrent_configure_last_call_wins() {
        let fx = Fixture::new();
        let file = fx.manifest(
            "[application]\nhandler = \"slow\"\nlabel = \"one\"\ndelay_ms = 300\n",
        );
        let service = Arc::new(fx.service(ServiceConfig::new("svc", file.clone()).with_prefix("/old")));

        let background = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || service.configure(None))
        };
        std::thread::sleep(Duration::from_millis(50));

        service
            .configure(Some(ServiceConfig::new("svc", file).with_prefix("/new")))
            .unwrap();
        background.join().unwrap().unwrap();

        assert_eq!(service.prefix(), "/new");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_accept_during_configure_sees_whole_generation() {
        let fx = Fixture::new();
        let old = fx.manifest("[application]\nhandler = \"label\"\nlabel = \"old\"\n");
        let new = fx.dir.path().join("new.toml");
        std::fs::write(&new, "[application]\nhandler = \"label\"\nlabel = \"new\"\n").unwrap();
        let service = Arc::new(fx.service(ServiceConfig::new("svc", old.clone()).with_limits(8, 1000)));

        let reconfigure = {
            let service = Arc::clone(&service);
            tokio::task::spawn_blocking(move || {
                for round in 0..200 {
                    let file = if round % 2 == 0 { &new } else { &old };
                    let config = ServiceConfig::new("svc", file.clone()).with_limits(8, 1000);
                    service.configure(Some(config)).unwrap();
                }
            })
        };

        let mut seen = HashMap::new();
        loop {
            let finished = reconfigure.is_finished();
            let batch: Vec<_> = (0..16)
                .map(|_| service.accept(request("/x")).unwrap().response())
                .collect();
            for response in futures::future::join_all(batch).await {
                assert_eq!(response.status(), StatusCode::OK);
                let body = String::from_utf8(response.body().to_vec()).unwrap();
                assert!(body == "old /x" || body == "new /x", "unexpected body {:?}", body);
                *seen.entry(body).or_insert(0usize) += 1;
            }
            if finished {
                break;
            }
        }
        reconfigure.await.unwrap();

        assert!(!seen.is_empty());
        assert_eq!(service.pool().pending(), 0);
    }
}
