pub mod error;
pub mod handler;

pub use error::{HandlerError, ServerError};
pub use handler::{BoxedHandlerFactory, HandlerFactory, HandlerRequest, HandlerResponse, HttpHandler};
