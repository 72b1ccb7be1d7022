use async_trait::async_trait;
use emberweb_core::{
    BoxedHandlerFactory, HandlerError, HandlerRequest, HandlerResponse, HttpHandler,
};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;

/// When the deferred handler constructs its delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Construct the handler during `initialize`.
    Eager,
    /// Defer construction to the first incoming request.
    Lazy,
}

/// Proxy in front of a not-yet-available request handler. Lets the listener
/// be bound before the real request-processing pipeline exists: requests that
/// arrive before `initialize` fail with [`HandlerError::NotInitialized`]
/// instead of touching a half-built pipeline.
///
/// The `Uninitialized -> Ready` transition happens at most once per instance
/// and never reverts.
pub struct DeferredHandler {
    factory: Mutex<Option<BoxedHandlerFactory>>,
    delegate: OnceLock<Arc<dyn HttpHandler>>,
}

impl DeferredHandler {
    pub fn new(factory: BoxedHandlerFactory) -> Self {
        DeferredHandler {
            factory: Mutex::new(Some(factory)),
            delegate: OnceLock::new(),
        }
    }

    /// Install the delegate. Eager mode invokes the factory now; lazy mode
    /// arms a wrapper that invokes it on the first request. Subsequent calls
    /// are no-ops: the first installed delegate stays for the lifetime of the
    /// proxy.
    pub fn initialize(&self, mode: InitMode) {
        let factory = self
            .factory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(factory) = factory else {
            debug!("handler already initialized, ignoring");
            return;
        };
        let delegate: Arc<dyn HttpHandler> = match mode {
            InitMode::Eager => factory(),
            InitMode::Lazy => Arc::new(LazyHandler::new(factory)),
        };
        let _ = self.delegate.set(delegate);
    }

    pub fn is_initialized(&self) -> bool {
        self.delegate.get().is_some()
    }
}

#[async_trait]
impl HttpHandler for DeferredHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
        match self.delegate.get() {
            Some(delegate) => delegate.handle(request).await,
            None => Err(HandlerError::NotInitialized),
        }
    }
}

/// Constructs its delegate on the first request. `OnceLock::get_or_init`
/// guarantees the factory runs exactly once even under concurrent first
/// requests; every caller observes the same constructed handler.
struct LazyHandler {
    factory: Mutex<Option<BoxedHandlerFactory>>,
    delegate: OnceLock<Arc<dyn HttpHandler>>,
}

impl LazyHandler {
    fn new(factory: BoxedHandlerFactory) -> Self {
        LazyHandler {
            factory: Mutex::new(Some(factory)),
            delegate: OnceLock::new(),
        }
    }

    fn get_or_create(&self) -> Arc<dyn HttpHandler> {
        let delegate = self.delegate.get_or_init(|| {
            let factory = self
                .factory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match factory {
                Some(factory) => factory(),
                // get_or_init runs this closure at most once, so the factory
                // is always present here.
                None => unreachable!("lazy handler factory consumed twice"),
            }
        });
        Arc::clone(delegate)
    }
}

#[async_trait]
impl HttpHandler for LazyHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
        self.get_or_create().handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Pong;

    #[async_trait]
    impl HttpHandler for Pong {
        async fn handle(&self, _request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::from_static(b"pong"))
                .map_err(anyhow::Error::from)?)
        }
    }

    fn request() -> HandlerRequest {
        Request::builder().uri("/").body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn uninitialized_proxy_rejects_requests() {
        let proxy = DeferredHandler::new(Box::new(|| Arc::new(Pong)));
        let err = proxy.handle(request()).await.unwrap_err();
        assert!(matches!(err, HandlerError::NotInitialized));
        assert!(!proxy.is_initialized());
    }

    #[tokio::test]
    async fn eager_initialization_forwards_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let proxy = DeferredHandler::new(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Arc::new(Pong)
        }));

        proxy.initialize(InitMode::Eager);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(proxy.is_initialized());

        let response = proxy.handle(request()).await.unwrap();
        assert_eq!(response.into_body(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn lazy_initialization_defers_construction_to_first_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let proxy = DeferredHandler::new(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Arc::new(Pong)
        }));

        proxy.initialize(InitMode::Lazy);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        proxy.handle(request()).await.unwrap();
        proxy.handle(request()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_construct_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let proxy = Arc::new(DeferredHandler::new(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Arc::new(Pong)
        })));
        proxy.initialize(InitMode::Lazy);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let proxy = Arc::clone(&proxy);
            tasks.push(tokio::spawn(async move {
                proxy.handle(request()).await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_initialize_keeps_first_delegate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let proxy = DeferredHandler::new(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Arc::new(Pong)
        }));

        proxy.initialize(InitMode::Eager);
        proxy.initialize(InitMode::Eager);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(proxy.is_initialized());
    }
}
