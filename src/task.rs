//! Caller-side tasks: asynchronous operations running in a worker process.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{TaskFailed, TaskStateError};
use crate::protocol::{RequestPayload, ResponsePayload, TaskStatus};
use crate::service::Service;
use crate::value::Args;

/// A callback notified of [`TaskEvent`]s, registered via [`Task::listen`].
pub type Listener = Box<dyn Fn(&TaskEvent) + Send + Sync>;

/// An asynchronous operation running in a worker process, analogous to a
/// future. Tasks progress `Initial -> Queued -> Running ->` one of
/// `Complete`, `Canceled`, `Failed`, `Crashed`.
pub struct Task {
    pub uuid: String,
    service: Service,
    script: String,
    inputs: Args,
    queue: Option<String>,
    state: Mutex<TaskState>,
    notify: Notify,
    listeners: Mutex<Vec<Listener>>,
}

struct TaskState {
    status: TaskStatus,
    outputs: Args,
    message: Option<String>,
    current: i64,
    maximum: i64,
    error: Option<String>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Initial,
            outputs: Args::new(),
            message: None,
            current: 0,
            maximum: 1,
            error: None,
        }
    }
}

/// A notification delivered to a task's listeners: which kind of response
/// arrived, plus whatever fields that response carried.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub uuid: String,
    pub kind: TaskEventKind,
    pub message: Option<String>,
    pub current: Option<i64>,
    pub maximum: Option<i64>,
    pub info: Option<Args>,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    Launch,
    Update,
    Completion,
    Cancelation,
    Failure,
    Crash,
}

impl Task {
    /// Construct a new task bound to `service` and register it in the
    /// service's task table. Mirrors the constructor eagerly registering
    /// itself, the way the original implementation's `Task.__init__` does.
    pub(crate) fn new(
        service: Service,
        script: String,
        inputs: Args,
        queue: Option<String>,
    ) -> Arc<Self> {
        let uuid = Uuid::new_v4().simple().to_string();
        let task = Arc::new(Self {
            uuid: uuid.clone(),
            service: service.clone(),
            script,
            inputs,
            queue,
            state: Mutex::new(TaskState::default()),
            notify: Notify::new(),
            listeners: Mutex::new(Vec::new()),
        });
        service.register_task(uuid, Arc::clone(&task));
        task
    }

    /// Queue this task for execution in the worker process.
    pub async fn start(self: &Arc<Self>) -> Result<(), TaskStateError> {
        {
            let mut state = self.state.lock().await;
            if state.status != TaskStatus::Initial {
                return Err(TaskStateError::not_initial(
                    self.uuid.clone(),
                    state.status.to_string(),
                ));
            }
            state.status = TaskStatus::Queued;
        }

        debug!(uuid = %self.uuid, "starting task");
        let payload = RequestPayload::Execute {
            script: self.script.clone(),
            inputs: self.inputs.clone(),
            queue: self.queue.clone(),
        };
        self.service.send_request(&self.uuid, payload).await;
        Ok(())
    }

    /// Register a callback notified of every [`TaskEvent`] for this task.
    /// Must be called before [`Task::start`]; mirrors the original
    /// implementation's requirement that listeners attach while the task is
    /// still `Initial`.
    pub async fn listen(&self, listener: Listener) -> Result<(), TaskStateError> {
        let state = self.state.lock().await;
        if state.status != TaskStatus::Initial {
            return Err(TaskStateError::not_initial(
                self.uuid.clone(),
                state.status.to_string(),
            ));
        }
        drop(state);
        self.listeners.lock().await.push(listener);
        Ok(())
    }

    /// Start the task if not already started, and block until it reaches a
    /// finished state.
    pub async fn wait_for(self: &Arc<Self>) -> Result<(), TaskFailed> {
        {
            let status = self.state.lock().await.status;
            if status == TaskStatus::Initial {
                // Errors here mean another caller raced us into Queued;
                // either way the task is no longer Initial, so proceed.
                let _ = self.start().await;
            }
        }

        loop {
            let status = self.state.lock().await.status;
            if status.is_finished() {
                return self.outcome(status).await;
            }
            self.notify.notified().await;
        }
    }

    /// Convenience: request cancelation after `duration`, without blocking.
    /// Spawns a background task that sleeps then calls [`Task::cancel`]; the
    /// returned handle may be aborted to call off the delayed cancelation.
    pub fn cancel_after(self: &Arc<Self>, duration: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            task.cancel().await;
        })
    }

    /// Start the task if needed, wait for it to finish, and return its
    /// outputs (or the failure reason).
    pub async fn result(self: &Arc<Self>) -> Result<Args, TaskFailed> {
        self.wait_for().await?;
        Ok(self.state.lock().await.outputs.clone())
    }

    /// Request cancelation of this task.
    pub async fn cancel(&self) {
        debug!(uuid = %self.uuid, "canceling task");
        self.service
            .send_request(&self.uuid, RequestPayload::Cancel)
            .await;
    }

    pub async fn status(&self) -> TaskStatus {
        self.state.lock().await.status
    }

    pub async fn progress(&self) -> (i64, i64) {
        let state = self.state.lock().await;
        (state.current, state.maximum)
    }

    async fn outcome(&self, status: TaskStatus) -> Result<(), TaskFailed> {
        match status {
            TaskStatus::Complete => Ok(()),
            TaskStatus::Canceled => Err(TaskFailed::canceled(self.uuid.clone())),
            TaskStatus::Failed => {
                let error = self
                    .state
                    .lock()
                    .await
                    .error
                    .clone()
                    .unwrap_or_else(|| "<no error message>".to_string());
                Err(TaskFailed::failed(self.uuid.clone(), error))
            }
            TaskStatus::Crashed => {
                let error = self
                    .state
                    .lock()
                    .await
                    .error
                    .clone()
                    .unwrap_or_else(|| "<no error message>".to_string());
                Err(TaskFailed::crashed(self.uuid.clone(), error))
            }
            TaskStatus::Initial | TaskStatus::Queued | TaskStatus::Running => {
                unreachable!("outcome() only called once status.is_finished()")
            }
        }
    }

    /// Apply an inbound [`ResponsePayload`] from the worker (or the
    /// service's crash monitor). Returns `true` if the task reached a
    /// terminal state, so the caller can drop it from the service's task
    /// table.
    pub(crate) async fn handle_response(&self, payload: ResponsePayload) -> bool {
        let (kind, message, current, maximum, info) = {
            let mut state = self.state.lock().await;
            match &payload {
                ResponsePayload::Launch => {
                    state.status = TaskStatus::Running;
                }
                ResponsePayload::Update { .. } => {}
                ResponsePayload::Completion { outputs } => {
                    state.status = TaskStatus::Complete;
                    state.outputs.extend(outputs.clone());
                }
                ResponsePayload::Cancelation => {
                    state.status = TaskStatus::Canceled;
                }
                ResponsePayload::Failure { error } => {
                    state.status = TaskStatus::Failed;
                    state.error = error.clone();
                }
                ResponsePayload::Crash { error } => {
                    state.status = TaskStatus::Crashed;
                    state.error = Some(error.clone());
                }
            }

            let (kind, message, current, maximum, info) = match &payload {
                ResponsePayload::Launch => (TaskEventKind::Launch, None, None, None, None),
                ResponsePayload::Update {
                    message,
                    current,
                    maximum,
                    info,
                } => (
                    TaskEventKind::Update,
                    message.clone(),
                    *current,
                    *maximum,
                    info.clone(),
                ),
                ResponsePayload::Completion { .. } => {
                    (TaskEventKind::Completion, None, None, None, None)
                }
                ResponsePayload::Cancelation => {
                    (TaskEventKind::Cancelation, None, None, None, None)
                }
                ResponsePayload::Failure { error } => {
                    (TaskEventKind::Failure, error.clone(), None, None, None)
                }
                ResponsePayload::Crash { error } => (
                    TaskEventKind::Crash,
                    Some(error.clone()),
                    None,
                    None,
                    None,
                ),
            };

            if let Some(c) = current {
                state.current = c;
            }
            if let Some(m) = maximum {
                state.maximum = m;
            }
            if let Some(ref msg) = message {
                state.message = Some(msg.clone());
            }

            (kind, message, current, maximum, info)
        };

        let event = TaskEvent {
            uuid: self.uuid.clone(),
            kind,
            message,
            current,
            maximum,
            info,
        };
        for listener in self.listeners.lock().await.iter() {
            listener(&event);
        }

        let finished = self.state.lock().await.status.is_finished();
        if finished {
            self.notify.notify_waiters();
        }
        finished
    }

    /// Synthesize a `Crash` event for this task, invoked by the service's
    /// process-exit monitor when the worker dies with this task still
    /// outstanding. Never produced by a real wire response.
    pub(crate) async fn crash(&self, error: String) {
        warn!(uuid = %self.uuid, %error, "task's worker process crashed");
        self.handle_response(ResponsePayload::Crash { error }).await;
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("uuid", &self.uuid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_service() -> Service {
        Service::new(".", vec!["true".to_string()])
    }

    #[tokio::test]
    async fn new_task_starts_initial() {
        let service = test_service();
        let task = Task::new(service, "1 + 1".to_string(), Args::new(), None);
        assert_eq!(task.status().await, TaskStatus::Initial);
    }

    #[tokio::test]
    async fn listen_after_start_is_rejected() {
        let service = test_service();
        let task = Task::new(service, "1 + 1".to_string(), Args::new(), None);
        task.handle_response(ResponsePayload::Launch).await;
        let err = task
            .listen(Box::new(|_| {}))
            .await
            .expect_err("listen after launch should fail");
        assert!(matches!(err, TaskStateError::NotInitial { .. }));
    }

    #[tokio::test]
    async fn completion_merges_outputs_and_notifies_listeners() {
        let service = test_service();
        let task = Task::new(service, "1 + 1".to_string(), Args::new(), None);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        task.listen(Box::new(move |event| {
            if event.kind == TaskEventKind::Completion {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .await
        .expect("listen");

        let mut outputs = Args::new();
        outputs.insert("result".to_string(), crate::value::Value::Int(2));
        let finished = task
            .handle_response(ResponsePayload::Completion { outputs })
            .await;

        assert!(finished);
        assert_eq!(task.status().await, TaskStatus::Complete);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_sets_error_and_wait_for_reports_it() {
        let service = test_service();
        let task = Task::new(service, "1/0".to_string(), Args::new(), None);
        task.handle_response(ResponsePayload::Failure {
            error: Some("division by zero".to_string()),
        })
        .await;

        let err = task.wait_for().await.expect_err("task failed");
        assert!(matches!(err, TaskFailed::Failed { .. }));
    }

    #[tokio::test]
    async fn crash_marks_task_crashed() {
        let service = test_service();
        let task = Task::new(service, "spin()".to_string(), Args::new(), None);
        task.crash("worker exited unexpectedly".to_string()).await;
        assert_eq!(task.status().await, TaskStatus::Crashed);
    }
}
