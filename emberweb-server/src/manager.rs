use crate::graceful::ShutdownCallback;
use crate::handler_proxy::{DeferredHandler, InitMode};
use crate::server::{BoundAddr, Server, ServerConfig};
use async_trait::async_trait;
use emberweb_core::{BoxedHandlerFactory, HttpHandler, ServerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Notifications emitted to the embedding event system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is bound and the handler is ready (or lazily armed).
    /// Emitted exactly once per manager.
    Initialized { addr: BoundAddr, port: i32 },
}

/// Subscriber for [`ServerEvent`]s. Registered before `start()`.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

/// A start/stop hook the embedding container drives. The container owns the
/// registered hooks and decides their ordering; the server core only provides
/// them.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
}

/// Registry the embedding container exposes for lifecycle hooks.
pub trait LifecycleRegistry {
    fn register(&mut self, name: &str, lifecycle: Arc<dyn Lifecycle>);
}

/// Sequences the deferred handler and the server so neither initializes too
/// early: the handler is made ready (or lazily armed) strictly before the
/// listener can route a request to it.
pub struct ServerManager {
    handler: Arc<DeferredHandler>,
    server: Arc<Server>,
    init_mode: InitMode,
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
    ready_emitted: AtomicBool,
    hooks_registered: AtomicBool,
}

impl ServerManager {
    /// Build the handler proxy and the server wired to it. `lazy_init`
    /// selects whether the handler factory runs during `start()` or on the
    /// first request.
    pub fn new(config: ServerConfig, factory: BoxedHandlerFactory, lazy_init: bool) -> Arc<Self> {
        let handler = Arc::new(DeferredHandler::new(factory));
        let server = Arc::new(Server::new(
            config,
            Arc::clone(&handler) as Arc<dyn HttpHandler>,
        ));
        Arc::new(ServerManager {
            handler,
            server,
            init_mode: if lazy_init {
                InitMode::Lazy
            } else {
                InitMode::Eager
            },
            listeners: Mutex::new(Vec::new()),
            ready_emitted: AtomicBool::new(false),
            hooks_registered: AtomicBool::new(false),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn handler(&self) -> &Arc<DeferredHandler> {
        &self.handler
    }

    /// Register an event listener. Must happen before `start()` to observe
    /// the initialized notification.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Install the start/stop and graceful-shutdown hooks into the embedding
    /// container's registry. Idempotent: only the first call registers,
    /// subsequent calls return `false` and do nothing.
    pub fn register_lifecycles(
        self: &Arc<Self>,
        registry: &mut dyn LifecycleRegistry,
    ) -> bool {
        if self.hooks_registered.swap(true, Ordering::SeqCst) {
            debug!("lifecycle hooks already registered, ignoring");
            return false;
        }
        registry.register(
            "graceful-shutdown",
            Arc::new(GracefulShutdownLifecycle {
                manager: Arc::clone(self),
            }),
        );
        registry.register(
            "start-stop",
            Arc::new(StartStopLifecycle {
                manager: Arc::clone(self),
            }),
        );
        true
    }

    /// Initialize the handler, then start the server, then notify listeners
    /// exactly once. The initialization order is the point of this type: the
    /// handler must be ready before the listener routes a single request.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.handler.initialize(self.init_mode);
        self.server.start().await?;

        if !self.ready_emitted.swap(true, Ordering::SeqCst) {
            if let Some(addr) = self.server.local_addr() {
                let event = ServerEvent::Initialized {
                    port: addr.port(),
                    addr,
                };
                info!(?event, "server initialized");
                let listeners = self
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for listener in listeners {
                    listener.on_event(&event);
                }
            }
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ServerError> {
        self.server.stop().await
    }

    pub fn shut_down_gracefully(&self, callback: ShutdownCallback) {
        self.server.shut_down_gracefully(callback);
    }
}

/// Hook that drains the server when the container shuts down. `stop` blocks
/// its own hook task until the drain concludes, so the container does not
/// proceed to hard-stop phases while connections are still closing.
pub struct GracefulShutdownLifecycle {
    manager: Arc<ServerManager>,
}

#[async_trait]
impl Lifecycle for GracefulShutdownLifecycle {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.manager.shut_down_gracefully(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        if let Ok(result) = rx.await {
            debug!(?result, "graceful shutdown phase finished");
        }
    }
}

/// Hook that starts and hard-stops the server with the container.
pub struct StartStopLifecycle {
    manager: Arc<ServerManager>,
}

#[async_trait]
impl Lifecycle for StartStopLifecycle {
    async fn start(&self) -> anyhow::Result<()> {
        self.manager.start().await?;
        Ok(())
    }

    async fn stop(&self) {
        if let Err(err) = self.manager.stop().await {
            debug!("server stop failed: {err}");
        }
    }
}
