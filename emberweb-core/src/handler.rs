use crate::error::HandlerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// A request as seen by the handler: headers plus a fully buffered body.
pub type HandlerRequest = http::Request<Bytes>;

/// A response produced by the handler, body fully buffered.
pub type HandlerResponse = http::Response<Bytes>;

/// The opaque request-processing pipeline. The server core never interprets
/// what a handler does; it only forwards requests and returns the outcome
/// unchanged.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError>;
}

/// Zero-argument supplier for the concrete handler, provided by the embedding
/// container. Invoked at most once per proxy instance.
pub trait HandlerFactory: FnOnce() -> Arc<dyn HttpHandler> + Send {}

impl<F> HandlerFactory for F where F: FnOnce() -> Arc<dyn HttpHandler> + Send {}

/// Boxed form of [`HandlerFactory`] as stored by the handler proxy.
pub type BoxedHandlerFactory = Box<dyn FnOnce() -> Arc<dyn HttpHandler> + Send>;

#[async_trait]
impl HttpHandler for Arc<dyn HttpHandler> {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
        (**self).handle(request).await
    }
}
