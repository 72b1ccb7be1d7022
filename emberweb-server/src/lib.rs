mod dispatch;
pub mod graceful;
pub mod handler_proxy;
pub mod logging;
pub mod manager;
pub mod server;
pub mod tracker;

pub use graceful::{GracefulShutdown, GracefulShutdownResult, ShutdownCallback};
pub use handler_proxy::{DeferredHandler, InitMode};
pub use logging::{init_logging, init_test_logging, LogConfig};
pub use manager::{
    EventListener, GracefulShutdownLifecycle, Lifecycle, LifecycleRegistry, ServerEvent,
    ServerManager, StartStopLifecycle,
};
pub use server::{BindAddr, BoundAddr, RouteProvider, Server, ServerConfig, ShutdownMode};
pub use tracker::{ConnectionId, ConnectionTracker, DrainOutcome, ShutdownState};

pub use emberweb_core::{
    BoxedHandlerFactory, HandlerError, HandlerRequest, HandlerResponse, HttpHandler, ServerError,
};
