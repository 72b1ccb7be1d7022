use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identifier for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[derive(Debug, Clone)]
struct ConnectionInfo {
    peer: Option<SocketAddr>,
    opened_at: Instant,
}

/// Shutdown progression of the tracked listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Refusing = 1,
    Draining = 2,
    Complete = 3,
    Aborted = 4,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Refusing,
            2 => ShutdownState::Draining,
            3 => ShutdownState::Complete,
            _ => ShutdownState::Aborted,
        }
    }
}

/// How a drain wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every tracked connection closed.
    Drained,
    /// The deadline elapsed with connections still open. Best effort, not an
    /// error.
    TimedOut,
    /// A hard stop overrode the wait.
    Aborted,
}

/// Records the connections the listener has open and coordinates draining
/// them. Openers and closers run on transport I/O tasks and only perform
/// atomic map operations plus a channel send; the drain waiter runs on the
/// lifecycle side and subscribes, so I/O tasks never block on lifecycle
/// operations.
pub struct ConnectionTracker {
    connections: DashMap<ConnectionId, ConnectionInfo>,
    next_id: AtomicU64,
    state: AtomicU8,
    /// Bumped whenever the connection set may have emptied or the wait was
    /// aborted; drain waiters re-check on each change.
    changed: watch::Sender<()>,
    /// `true` while new connections are admitted. Per-connection serve loops
    /// subscribe to trigger their own graceful close when this flips.
    accepting: watch::Sender<bool>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(());
        let (accepting, _) = watch::channel(true);
        ConnectionTracker {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            state: AtomicU8::new(ShutdownState::Running as u8),
            changed,
            accepting,
        }
    }

    /// Register a newly accepted connection. Returns `None` once the tracker
    /// refuses new connections; the transport must then reject the connection
    /// instead of serving it. Callers should consult [`is_accepting`] before
    /// completing the accept; this re-check closes the race with a concurrent
    /// [`begin_refusing`].
    ///
    /// [`is_accepting`]: ConnectionTracker::is_accepting
    /// [`begin_refusing`]: ConnectionTracker::begin_refusing
    pub fn connection_opened(&self, peer: Option<SocketAddr>) -> Option<ConnectionId> {
        if !self.is_accepting() {
            return None;
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionInfo {
                peer,
                opened_at: Instant::now(),
            },
        );
        if !self.is_accepting() {
            // begin_refusing raced with the insert above
            self.connections.remove(&id);
            self.changed.send_replace(());
            return None;
        }
        trace!(id = id.0, peer = ?peer, "connection opened");
        Some(id)
    }

    /// Remove a connection record. Wakes the drain waiter when this empties
    /// the set.
    pub fn connection_closed(&self, id: ConnectionId) {
        if let Some((_, info)) = self.connections.remove(&id) {
            trace!(id = id.0, lived = ?info.opened_at.elapsed(), "connection closed");
            if self.connections.is_empty() {
                self.changed.send_replace(());
            }
        }
    }

    /// Stop admitting new connections. Atomic and idempotent.
    pub fn begin_refusing(&self) {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Refusing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            debug!(active = self.active(), "refusing new connections");
        }
        self.accepting.send_replace(false);
    }

    /// Whether a new connection may currently be admitted.
    pub fn is_accepting(&self) -> bool {
        *self.accepting.borrow()
    }

    /// Subscription flipped to `false` when the tracker begins refusing.
    pub fn subscribe_accepting(&self) -> watch::Receiver<bool> {
        self.accepting.subscribe()
    }

    /// Wait until the connection set is empty, the timeout elapses, or
    /// [`abort`] is called — whichever happens first. Returns immediately as
    /// `Drained` when no connections are open.
    ///
    /// [`abort`]: ConnectionTracker::abort
    pub async fn await_drain(&self, timeout: Option<Duration>) -> DrainOutcome {
        let mut rx = self.changed.subscribe();
        let _ = self.state.compare_exchange(
            ShutdownState::Refusing as u8,
            ShutdownState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.state() == ShutdownState::Aborted {
                return DrainOutcome::Aborted;
            }
            if self.connections.is_empty() {
                self.finish(ShutdownState::Complete);
                return DrainOutcome::Drained;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                        self.finish(ShutdownState::Complete);
                        return DrainOutcome::TimedOut;
                    }
                }
                None => {
                    let _ = rx.changed().await;
                }
            }
        }
    }

    /// Force any in-progress drain wait to return `Aborted` immediately.
    /// Used when a hard stop overrides a graceful one.
    pub fn abort(&self) {
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match ShutdownState::from_u8(current) {
                    ShutdownState::Complete | ShutdownState::Aborted => None,
                    _ => Some(ShutdownState::Aborted as u8),
                }
            });
        if previous.is_ok() {
            debug!("drain aborted");
        }
        self.accepting.send_replace(false);
        self.changed.send_replace(());
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of connections currently tracked.
    pub fn active(&self) -> usize {
        self.connections.len()
    }

    fn finish(&self, to: ShutdownState) {
        for from in [ShutdownState::Refusing, ShutdownState::Draining] {
            if self
                .state
                .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
