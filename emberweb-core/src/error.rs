use std::io;
use std::time::Duration;
use thiserror::Error;

/// Permission denied error code from `errno.h`.
const EACCES: i32 = 13;

/// Errors surfaced by server lifecycle operations (start/stop).
#[derive(Debug, Error)]
pub enum ServerError {
    /// The requested port is already bound by another listener.
    #[error("port {port} is already in use")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Any other bind failure, fatal to `start()`.
    #[error("unable to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// The bind did not complete within the configured lifecycle timeout.
    #[error("listener bind did not complete within {0:?}")]
    StartTimeout(Duration),

    /// Listener disposal did not complete within the configured lifecycle timeout.
    #[error("listener disposal did not complete within {0:?}")]
    StopTimeout(Duration),

    /// The server is terminal: a stopped instance cannot be started again.
    #[error("server has been stopped and cannot be restarted")]
    AlreadyStopped,

    /// Listener disposal failed for a reason other than being already terminated.
    #[error("error while disposing listener: {0}")]
    Stop(String),
}

impl ServerError {
    /// Classify a bind failure. `AddrInUse` on a numbered-port transport maps
    /// to [`ServerError::PortInUse`] carrying the conflicting port, unless the
    /// underlying signal is permission-denied (EACCES), which is not a port
    /// conflict and stays a generic bind failure.
    pub fn from_bind_error(err: io::Error, port: Option<u16>) -> Self {
        match port {
            Some(port) if err.kind() == io::ErrorKind::AddrInUse && !is_permission_denied(&err) => {
                ServerError::PortInUse { port, source: err }
            }
            _ => ServerError::Bind(err),
        }
    }
}

fn is_permission_denied(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(EACCES)
}

/// Errors on the per-request path. These are reported through the transport's
/// normal error handling and never affect lifecycle state.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A request reached the handler proxy before initialization. This is a
    /// programming-contract violation, not a recoverable condition.
    #[error("the http handler has not yet been initialized")]
    NotInitialized,

    /// Failure inside the opaque request-processing pipeline.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}
