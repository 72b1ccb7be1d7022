use crate::dispatch::Dispatcher;
use crate::graceful::{GracefulShutdown, GracefulShutdownResult, ShutdownCallback};
use crate::tracker::ConnectionTracker;
use axum::Router;
use emberweb_core::{HttpHandler, ServerError};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Address the listener binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindAddr {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: PathBuf },
}

/// Address the listener actually bound. Unix-socket binds have no notion of
/// a numeric port; the port query degrades to `-1` for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl BoundAddr {
    pub fn port(&self) -> i32 {
        match self {
            BoundAddr::Tcp(addr) => i32::from(addr.port()),
            #[cfg(unix)]
            BoundAddr::Unix(_) => -1,
        }
    }
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            BoundAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Shutdown behavior configured at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// `shut_down_gracefully` completes immediately; nothing is drained.
    #[default]
    Immediate,
    /// Drain active connections, bounded by `grace_period` when set.
    Graceful { grace_period: Option<Duration> },
}

/// Server configuration, consumed read-only from the embedding configuration
/// layer. The bind/dispose bound (`lifecycle_timeout`) and the drain grace
/// period are independent values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: BindAddr,
    /// Bounds both the bind call in `start()` and listener disposal in
    /// `stop()`. `None` means unbounded.
    pub lifecycle_timeout: Option<Duration>,
    pub shutdown: ShutdownMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: BindAddr::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            lifecycle_timeout: None,
            shutdown: ShutdownMode::default(),
        }
    }
}

/// Decorates the routing table before the catch-all route is installed.
/// Applied in registration order; the server never interprets route contents.
pub type RouteProvider = Box<dyn FnOnce(Router) -> Router + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    NotStarted,
    Started,
    Stopped,
}

/// The bound listener. Owned exclusively by [`Server`]; created on bind,
/// taken out on stop.
struct ListenerHandle {
    dispose: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

struct Inner {
    state: LifecycleState,
    listener: Option<ListenerHandle>,
}

/// Controls the lifecycle of the embedded HTTP listener: bind/unbind,
/// port reporting, and graceful shutdown. A stopped server is terminal; a
/// fresh instance is required to serve again.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn HttpHandler>,
    route_providers: StdMutex<Vec<RouteProvider>>,
    tracker: Arc<ConnectionTracker>,
    graceful: Option<GracefulShutdown>,
    inner: Mutex<Inner>,
    bound: StdMutex<Option<BoundAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn HttpHandler>) -> Self {
        let tracker = Arc::new(ConnectionTracker::new());
        let graceful = match config.shutdown {
            ShutdownMode::Graceful { grace_period } => {
                Some(GracefulShutdown::new(Arc::clone(&tracker), grace_period))
            }
            ShutdownMode::Immediate => None,
        };
        Server {
            config,
            handler,
            route_providers: StdMutex::new(Vec::new()),
            tracker,
            graceful,
            inner: Mutex::new(Inner {
                state: LifecycleState::NotStarted,
                listener: None,
            }),
            bound: StdMutex::new(None),
        }
    }

    /// Register route decorators. Must happen before `start()`; later calls
    /// have no effect on an already-bound listener.
    pub fn set_route_providers(&self, providers: Vec<RouteProvider>) {
        *self
            .route_providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = providers;
    }

    /// Bind the listener and start serving. No-op when already started;
    /// rejected once stopped. Blocks only for the bind itself (bounded by
    /// `lifecycle_timeout` when set); the accept loop and the disposal wait
    /// run on a background task.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            LifecycleState::Started => return Ok(()),
            LifecycleState::Stopped => return Err(ServerError::AlreadyStopped),
            LifecycleState::NotStarted => {}
        }

        let listener = self.bind().await?;
        let addr = listener.bound_addr()?;
        info!(address = %addr, "server started");

        let dispatcher = self.build_dispatcher();
        let (dispose_tx, dispose_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            dispatcher,
            Arc::clone(&self.tracker),
            dispose_rx,
        ));

        inner.listener = Some(ListenerHandle {
            dispose: dispose_tx,
            accept_task,
        });
        inner.state = LifecycleState::Started;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        Ok(())
    }

    /// Dispose the listener. No-op unless started. A graceful shutdown in
    /// progress is aborted first: the hard stop takes precedence, and the
    /// pending graceful callback still fires (with an aborted outcome).
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Started {
            return Ok(());
        }
        if let Some(graceful) = &self.graceful {
            graceful.abort();
        }

        let handle = inner.listener.take();
        inner.state = LifecycleState::Stopped;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(handle) = handle {
            let _ = handle.dispose.send(true);
            let mut accept_task = handle.accept_task;
            match self.config.lifecycle_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, &mut accept_task).await {
                    Ok(joined) => swallow_terminated(joined)?,
                    Err(_) => {
                        accept_task.abort();
                        return Err(ServerError::StopTimeout(timeout));
                    }
                },
                None => swallow_terminated(accept_task.await)?,
            }
            info!("server stopped");
        }
        Ok(())
    }

    /// Begin a graceful shutdown. Never blocks: the drain wait and the
    /// callback both run on a background task. When graceful shutdown was not
    /// configured, the callback fires synchronously with
    /// [`GracefulShutdownResult::Immediate`]. The callback fires exactly once
    /// in all cases, including a racing `stop()`.
    pub fn shut_down_gracefully(&self, callback: ShutdownCallback) {
        match &self.graceful {
            Some(graceful) => graceful.shut_down_gracefully(callback),
            None => {
                debug!("graceful shutdown not configured, completing immediately");
                callback(GracefulShutdownResult::Immediate);
            }
        }
    }

    /// The bound port, or `-1` when not started or when the transport has no
    /// notion of a numeric port.
    pub fn port(&self) -> i32 {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(BoundAddr::port)
            .unwrap_or(-1)
    }

    /// The bound address, when started.
    pub fn local_addr(&self) -> Option<BoundAddr> {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connection-tracker view, for observability.
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    async fn bind(&self) -> Result<Listener, ServerError> {
        match &self.config.addr {
            BindAddr::Tcp { host, port } => {
                let bind = TcpListener::bind((host.as_str(), *port));
                let listener = match self.config.lifecycle_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, bind)
                        .await
                        .map_err(|_| ServerError::StartTimeout(timeout))?,
                    None => bind.await,
                }
                .map_err(|err| ServerError::from_bind_error(err, Some(*port)))?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            BindAddr::Unix { path } => {
                let listener = UnixListener::bind(path)
                    .map_err(|err| ServerError::from_bind_error(err, None))?;
                Ok(Listener::Unix(listener, path.clone()))
            }
        }
    }

    fn build_dispatcher(&self) -> Dispatcher {
        let providers = std::mem::take(
            &mut *self
                .route_providers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if providers.is_empty() {
            Dispatcher::direct(Arc::clone(&self.handler))
        } else {
            let mut router = Router::new();
            for provider in providers {
                router = provider(router);
            }
            let router = router.fallback_service(crate::dispatch::HandlerService::new(
                Arc::clone(&self.handler),
            ));
            Dispatcher::routed(router)
        }
    }
}

/// Disposal failures from an already-terminated accept loop are swallowed so
/// `stop()` stays idempotent; anything else propagates.
fn swallow_terminated(joined: Result<(), tokio::task::JoinError>) -> Result<(), ServerError> {
    match joined {
        Ok(()) => Ok(()),
        Err(err) if err.is_cancelled() => {
            debug!("accept loop was already terminated");
            Ok(())
        }
        Err(err) => Err(ServerError::Stop(err.to_string())),
    }
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    fn bound_addr(&self) -> Result<BoundAddr, ServerError> {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(BoundAddr::Tcp)
                .map_err(ServerError::Bind),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(BoundAddr::Unix(path.clone())),
        }
    }

    async fn accept(&self) -> std::io::Result<(Box<dyn Io>, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), Some(peer)))
            }
            #[cfg(unix)]
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), None))
            }
        }
    }
}

/// Accepts connections until disposal is signalled. Doubles as the background
/// wait that observes listener disposal: the task ends (closing the listener)
/// without ever blocking the thread that called `start()`.
async fn accept_loop(
    listener: Listener,
    dispatcher: Dispatcher,
    tracker: Arc<ConnectionTracker>,
    mut dispose: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = dispose.changed() => break,
            accepted = listener.accept() => {
                let (io, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                // Admission check; once refusing, the connection is rejected
                // at the transport level before any record exists.
                let Some(id) = tracker.connection_opened(peer) else {
                    debug!(peer = ?peer, "refusing connection during shutdown");
                    continue;
                };
                let dispatcher = dispatcher.clone();
                let tracker = Arc::clone(&tracker);
                let draining = tracker.subscribe_accepting();
                tokio::spawn(async move {
                    serve_connection(io, dispatcher, draining).await;
                    tracker.connection_closed(id);
                });
            }
        }
    }
    debug!("listener disposed");
}

/// Serves one connection, switching to hyper's connection-level graceful
/// shutdown (finish the in-flight exchange, then close) when admission stops.
async fn serve_connection(
    io: Box<dyn Io>,
    dispatcher: Dispatcher,
    mut draining: watch::Receiver<bool>,
) {
    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), dispatcher);
    tokio::pin!(conn);
    // admission may have stopped between the accept and this subscription;
    // the watch would then never fire for this connection
    if !*draining.borrow_and_update() {
        conn.as_mut().graceful_shutdown();
        if let Err(err) = conn.await {
            debug!("connection ended with error: {err}");
        }
        return;
    }
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    debug!("connection ended with error: {err}");
                }
                return;
            }
            changed = draining.changed() => {
                if changed.is_err() || !*draining.borrow() {
                    conn.as_mut().graceful_shutdown();
                    break;
                }
            }
        }
    }
    if let Err(err) = conn.await {
        debug!("connection ended with error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use emberweb_core::{HandlerError, HandlerRequest, HandlerResponse};
    use http::StatusCode;

    struct Ok200;

    #[async_trait]
    impl HttpHandler for Ok200 {
        async fn handle(&self, _request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
            Ok(http::Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::from_static(b"ok"))
                .map_err(anyhow::Error::from)?)
        }
    }

    fn ephemeral_config() -> ServerConfig {
        ServerConfig {
            addr: BindAddr::Tcp {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            ..ServerConfig::default()
        }
    }

    #[test]
    fn default_config_targets_loopback() {
        let config = ServerConfig::default();
        assert_eq!(
            config.addr,
            BindAddr::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8080
            }
        );
        assert_eq!(config.shutdown, ShutdownMode::Immediate);
        assert!(config.lifecycle_timeout.is_none());
    }

    #[test]
    fn port_is_sentinel_before_start() {
        let server = Server::new(ephemeral_config(), Arc::new(Ok200));
        assert_eq!(server.port(), -1);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn start_reports_bound_port_and_stop_clears_it() {
        let server = Server::new(ephemeral_config(), Arc::new(Ok200));
        server.start().await.unwrap();
        assert!(server.port() > 0);

        // starting again is a no-op, not a rebind
        let port = server.port();
        server.start().await.unwrap();
        assert_eq!(server.port(), port);

        server.stop().await.unwrap();
        assert_eq!(server.port(), -1);
    }

    #[tokio::test]
    async fn stopped_server_cannot_be_restarted() {
        let server = Server::new(ephemeral_config(), Arc::new(Ok200));
        server.start().await.unwrap();
        server.stop().await.unwrap();
        // stop is idempotent
        server.stop().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let server = Server::new(ephemeral_config(), Arc::new(Ok200));
        server.stop().await.unwrap();
        server.start().await.unwrap();
        assert!(server.port() > 0);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn immediate_mode_fires_callback_synchronously() {
        let server = Server::new(ephemeral_config(), Arc::new(Ok200));
        let (tx, rx) = std::sync::mpsc::channel();
        server.shut_down_gracefully(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        // no await between the call and the receive: the callback already ran
        assert_eq!(rx.try_recv().unwrap(), GracefulShutdownResult::Immediate);
    }

    #[tokio::test]
    async fn bound_addr_port_degrades_for_unix_sockets() {
        #[cfg(unix)]
        {
            let addr = BoundAddr::Unix(PathBuf::from("/tmp/ember.sock"));
            assert_eq!(addr.port(), -1);
        }
        let addr = BoundAddr::Tcp("127.0.0.1:8080".parse().unwrap());
        assert_eq!(addr.port(), 8080);
    }
}
