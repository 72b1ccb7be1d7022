use axum::body::Body;
use axum::response::Response;
use axum::Router;
use emberweb_core::{HandlerError, HttpHandler};
use futures::future::BoxFuture;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error};

/// Where incoming requests go: straight to the handler, or through the
/// decorated routing table with the handler installed as catch-all.
#[derive(Clone)]
pub(crate) enum Dispatcher {
    Direct(HandlerService),
    Routed(Router),
}

impl Dispatcher {
    pub(crate) fn direct(handler: Arc<dyn HttpHandler>) -> Self {
        Dispatcher::Direct(HandlerService::new(handler))
    }

    pub(crate) fn routed(router: Router) -> Self {
        Dispatcher::Routed(router)
    }

    async fn dispatch(&self, request: Request<Body>) -> Response {
        match self {
            Dispatcher::Direct(service) => service.invoke(request).await,
            Dispatcher::Routed(router) => {
                use tower::ServiceExt;
                match router.clone().oneshot(request).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                }
            }
        }
    }
}

impl hyper::service::Service<Request<Incoming>> for Dispatcher {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.dispatch(request.map(Body::new)).await) })
    }
}

/// Adapts the opaque [`HttpHandler`] to the transport: buffers the request
/// body, forwards, and maps handler errors onto the per-request error path
/// without touching lifecycle state.
#[derive(Clone)]
pub(crate) struct HandlerService {
    handler: Arc<dyn HttpHandler>,
}

impl HandlerService {
    pub(crate) fn new(handler: Arc<dyn HttpHandler>) -> Self {
        HandlerService { handler }
    }

    async fn invoke(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                debug!("failed to buffer request body: {err}");
                return plain_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };
        match self.handler.handle(Request::from_parts(parts, body)).await {
            Ok(response) => response.map(Body::from),
            Err(HandlerError::NotInitialized) => {
                error!("request arrived before the handler was initialized");
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "handler not initialized")
            }
            Err(HandlerError::Handler(err)) => {
                error!("handler failed: {err:#}");
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl tower::Service<Request<Body>> for HandlerService {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.invoke(request).await) })
    }
}

fn plain_response(status: StatusCode, message: &'static str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_proxy::{DeferredHandler, InitMode};
    use async_trait::async_trait;
    use bytes::Bytes;
    use emberweb_core::{HandlerRequest, HandlerResponse};

    struct Upper;

    #[async_trait]
    impl HttpHandler for Upper {
        async fn handle(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
            let body = String::from_utf8_lossy(&request.into_body()).to_uppercase();
            Ok(http::Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::from(body))
                .map_err(anyhow::Error::from)?)
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn direct_dispatch_forwards_to_handler() {
        let dispatcher = Dispatcher::direct(Arc::new(Upper));
        let request = Request::builder().body(Body::from("hello")).unwrap();
        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "HELLO");
    }

    #[tokio::test]
    async fn uninitialized_handler_maps_to_500() {
        let proxy = Arc::new(DeferredHandler::new(Box::new(|| Arc::new(Upper))));
        let dispatcher = Dispatcher::direct(proxy);
        let request = Request::builder().body(Body::empty()).unwrap();
        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn routed_dispatch_falls_back_to_handler() {
        let proxy = Arc::new(DeferredHandler::new(Box::new(|| {
            Arc::new(Upper) as Arc<dyn HttpHandler>
        })));
        proxy.initialize(InitMode::Eager);

        let router = Router::new()
            .route("/ping", axum::routing::get(|| async { "pong" }))
            .fallback_service(HandlerService::new(proxy));
        let dispatcher = Dispatcher::routed(router);

        let request = Request::builder()
            .uri("/ping")
            .body(Body::empty())
            .unwrap();
        assert_eq!(body_text(dispatcher.dispatch(request).await).await, "pong");

        let request = Request::builder()
            .uri("/other")
            .method(http::Method::POST)
            .body(Body::from("abc"))
            .unwrap();
        assert_eq!(body_text(dispatcher.dispatch(request).await).await, "ABC");
    }
}
