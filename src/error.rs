use thiserror::Error;

/// Error type for event-loop lifecycle and setup operations.
///
/// Hot-path operations (`send`, `dispatch`, frame ingestion) are deliberately
/// infallible: the pipeline is best-effort real-time, and overload shows up
/// in counters and logs rather than as errors the producer must handle.
#[derive(Error, Debug)]
pub enum Error {
    /// `start` was called on a loop whose worker is already running.
    #[error("event loop already started")]
    AlreadyStarted,

    /// `stop` was called on a loop that was never started or already stopped.
    #[error("event loop is not running")]
    NotRunning,

    /// The wake descriptor (eventfd/pipe) could not be created.
    #[error("failed to create wake descriptor: {0}")]
    Waker(#[source] std::io::Error),

    /// The datagram socket could not be switched to non-blocking mode.
    #[error("failed to configure socket: {0}")]
    Socket(#[source] std::io::Error),

    /// Worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
