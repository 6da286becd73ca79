//! Error taxonomy for the appose crate, one `thiserror` enum per concern.
//!
//! Mirrors the per-concern `Error` enum pattern used throughout the
//! orchestration ecosystem this crate is descended from: small,
//! `#[error("...")]`-documented variants with `#[from]` conversions at
//! natural boundaries, plus helper constructors for multi-field variants.

use thiserror::Error;

/// Errors raised by [`crate::shm::SharedMemoryRegion`].
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to allocate shared memory region of {requested} bytes: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    #[error("no shared memory region named {0:?}")]
    NotFound(String),

    #[error("shared memory region {0:?} already closed")]
    AlreadyClosed(String),

    #[error("io error on shared memory region {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShmError {
    /// Build an [`ShmError::AllocationFailed`] from the requested size and a
    /// reason string (typically an OS error's `Display`).
    pub fn allocation_failed(requested: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            requested,
            reason: reason.into(),
        }
    }

    /// Build an [`ShmError::Io`] tying an I/O failure to the region it
    /// occurred on.
    pub fn io(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            name: name.into(),
            source,
        }
    }
}

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is missing required field {0:?}")]
    MissingField(&'static str),

    #[error("invalid dtype {0:?}")]
    InvalidDtype(String),

    #[error("unrecognized message type {0:?}")]
    InvalidMessageType(String),
}

/// Errors raised by [`crate::task::Task`] operations.
#[derive(Debug, Error)]
pub enum TaskStateError {
    #[error("task {uuid} is not in the INITIAL state (currently {status})")]
    NotInitial { uuid: String, status: String },
}

impl TaskStateError {
    /// Build a [`TaskStateError::NotInitial`] naming the task and the state
    /// it was actually found in.
    pub fn not_initial(uuid: impl Into<String>, status: impl Into<String>) -> Self {
        Self::NotInitial {
            uuid: uuid.into(),
            status: status.into(),
        }
    }
}

/// The terminal outcome of [`crate::task::Task::wait_for`] when the task did
/// not complete successfully.
#[derive(Debug, Error)]
pub enum TaskFailed {
    #[error("task {uuid} failed: {error}")]
    Failed { uuid: String, error: String },

    #[error("task {uuid} was canceled")]
    Canceled { uuid: String },

    #[error("task {uuid}'s worker process crashed: {error}")]
    Crashed { uuid: String, error: String },
}

impl TaskFailed {
    /// Build a [`TaskFailed::Failed`] from the failing task's uuid and the
    /// worker's error text.
    pub fn failed(uuid: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Failed {
            uuid: uuid.into(),
            error: error.into(),
        }
    }

    /// Build a [`TaskFailed::Canceled`] for a task that reached `CANCELED`.
    pub fn canceled(uuid: impl Into<String>) -> Self {
        Self::Canceled { uuid: uuid.into() }
    }

    /// Build a [`TaskFailed::Crashed`] from the task's uuid and the crash
    /// transcript assembled by the service's process-exit monitor.
    pub fn crashed(uuid: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Crashed {
            uuid: uuid.into(),
            error: error.into(),
        }
    }
}

/// Errors raised by [`crate::proxy::ProxyObject`] operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("remote invocation of {var}.{member} failed: {source}")]
    RemoteInvocation {
        var: String,
        member: String,
        #[source]
        source: TaskFailed,
    },

    #[error("no script syntax configured for this service")]
    NoSyntax,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ProxyError {
    /// Build a [`ProxyError::RemoteInvocation`] wrapping the task failure
    /// that a proxy's remote call surfaced.
    pub fn remote_invocation(
        var: impl Into<String>,
        member: impl Into<String>,
        source: TaskFailed,
    ) -> Self {
        Self::RemoteInvocation {
            var: var.into(),
            member: member.into(),
            source,
        }
    }
}

/// Errors raised while starting or driving a [`crate::service::Service`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write request to worker stdin: {0}")]
    Write(#[source] std::io::Error),

    #[error("worker process has no stdin pipe")]
    NoStdin,

    #[error("worker process has no stdout pipe")]
    NoStdout,
}

impl ServiceError {
    /// Build a [`ServiceError::Spawn`] from the OS error that prevented the
    /// worker process from starting.
    pub fn spawn(source: std::io::Error) -> Self {
        Self::Spawn(source)
    }

    /// Build a [`ServiceError::Write`] from the OS error that occurred while
    /// writing a request line to the worker's stdin.
    pub fn write(source: std::io::Error) -> Self {
        Self::Write(source)
    }
}

/// Errors raised by [`crate::service::Service`]'s `get_var`/`put_var`/`call`
/// convenience methods, which need a [`crate::syntax::ScriptSyntax`] bound
/// to the service before they can generate a script.
#[derive(Debug, Error)]
pub enum ScriptOpError {
    #[error("no script syntax configured for this service")]
    NoSyntax,

    #[error(transparent)]
    Task(#[from] TaskFailed),

    #[error(transparent)]
    Service(#[from] ServiceError),
}
