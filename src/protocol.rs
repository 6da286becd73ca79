//! Wire-level request/response shapes shared between the caller side
//! ([`crate::task`], [`crate::service`]) and the worker side
//! ([`crate::worker`]).

use crate::value::Args;

/// A request sent from the service to the worker on its stdin.
#[derive(Debug, Clone)]
pub struct Request {
    pub task: String,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone)]
pub enum RequestPayload {
    Execute {
        script: String,
        inputs: Args,
        queue: Option<String>,
    },
    Cancel,
}

impl RequestPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            RequestPayload::Execute { .. } => "EXECUTE",
            RequestPayload::Cancel => "CANCEL",
        }
    }
}

/// A response sent from the worker to the service on its stdout. `CRASH` is
/// a caller-side-only synthetic variant and is never transmitted; the
/// worker never constructs one.
#[derive(Debug, Clone)]
pub struct Response {
    pub task: String,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone)]
pub enum ResponsePayload {
    Launch,
    Update {
        message: Option<String>,
        current: Option<i64>,
        maximum: Option<i64>,
        info: Option<Args>,
    },
    Completion {
        outputs: Args,
    },
    Cancelation,
    Failure {
        error: Option<String>,
    },
    /// Synthesized by the service's crash monitor; never appears on the wire.
    Crash {
        error: String,
    },
}

impl ResponsePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            ResponsePayload::Launch => "LAUNCH",
            ResponsePayload::Update { .. } => "UPDATE",
            ResponsePayload::Completion { .. } => "COMPLETION",
            ResponsePayload::Cancelation => "CANCELATION",
            ResponsePayload::Failure { .. } => "FAILURE",
            ResponsePayload::Crash { .. } => "CRASH",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponsePayload::Completion { .. }
                | ResponsePayload::Cancelation
                | ResponsePayload::Failure { .. }
                | ResponsePayload::Crash { .. }
        )
    }
}

/// The lifecycle status of a caller-side [`crate::task::Task`].
///
/// Progression: `Initial -> Queued -> Running -> {Complete, Canceled,
/// Failed, Crashed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Initial,
    Queued,
    Running,
    Complete,
    Canceled,
    Failed,
    Crashed,
}

impl TaskStatus {
    /// True iff status is `Complete`, `Canceled`, `Failed`, or `Crashed`.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Canceled | TaskStatus::Failed | TaskStatus::Crashed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Initial => "INITIAL",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Crashed => "CRASHED",
        };
        write!(f, "{s}")
    }
}
