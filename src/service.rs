//! The caller-side owner of one child worker process.
//!
//! Three cooperating flows (stdout pump, stderr pump, exit monitor) run as
//! `tokio` tasks over a [`tokio::process::Child`] instead of raw OS threads,
//! and `Task::wait_for` awaits a [`tokio::sync::Notify`] instead of blocking
//! a condition variable. Listener delivery remains synchronous, invoked from
//! the stdout-pump task in registration order, so listeners observe events
//! for a given task in the order the worker emitted them.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::codec::{decode_response, encode_request};
use crate::config::ServiceConfig;
use crate::error::{ScriptOpError, ServiceError};
use crate::protocol::{Request, RequestPayload, Response, ResponsePayload};
use crate::proxy::ProxyObject;
use crate::syntax::ScriptSyntax;
use crate::task::Task;
use crate::value::{Args, Value};

static SERVICE_COUNT: AtomicU64 = AtomicU64::new(0);

/// A callback notified of service/worker debug text, analogous to the
/// original's `debug_callback` (`service.py`'s `_debug`/`_debug_service`/
/// `_debug_worker`, which prefix every line with `[SERVICE-N]`/`[WORKER-N]`).
pub type DebugCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Caller-side handle to one running (or not-yet-started) worker process.
///
/// Cheaply `Clone`: internally an `Arc`, so a `Service` can be handed to
/// every [`Task`] it creates (each task holds a back-reference to drive its
/// own requests) without the caller losing access to the same underlying
/// process.
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    id: u64,
    cwd: PathBuf,
    command: Vec<String>,
    config: ServiceConfig,
    syntax: StdMutex<Option<Arc<dyn ScriptSyntax>>>,
    tasks: DashMap<String, Arc<Task>>,
    debug_callback: StdMutex<Option<DebugCallback>>,
    started: AtomicBool,
    exited: AtomicBool,
    exit_notify: Notify,
    pid: AtomicU32,
    stdin: AsyncMutex<Option<ChildStdin>>,
    recent_lines: StdMutex<VecDeque<String>>,
}

impl Service {
    /// Construct a service bound to `cwd`/`command`. No process is spawned
    /// until [`Service::start`] or the first [`Service::task`] call.
    pub fn new(cwd: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self::with_config(cwd, command, ServiceConfig::default())
    }

    /// Use non-default timings (see [`ServiceConfig`]).
    pub fn with_config(cwd: impl Into<PathBuf>, command: Vec<String>, config: ServiceConfig) -> Self {
        let id = SERVICE_COUNT.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(ServiceInner {
                id,
                cwd: cwd.into(),
                command,
                config,
                syntax: StdMutex::new(None),
                tasks: DashMap::new(),
                debug_callback: StdMutex::new(None),
                started: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                exit_notify: Notify::new(),
                pid: AtomicU32::new(0),
                stdin: AsyncMutex::new(None),
                recent_lines: StdMutex::new(VecDeque::new()),
            }),
        }
    }

    /// Bind a [`ScriptSyntax`], enabling `get_var`/`put_var`/`call`/`proxy`.
    pub fn set_syntax(&self, syntax: Arc<dyn ScriptSyntax>) {
        *self.inner.syntax.lock().unwrap() = Some(syntax);
    }

    pub fn syntax(&self) -> Option<Arc<dyn ScriptSyntax>> {
        self.inner.syntax.lock().unwrap().clone()
    }

    /// Register a callback notified of `"[SERVICE-N] ..."`/`"[WORKER-N]
    /// ..."`-style diagnostic text, mirroring `service.py`'s `debug()`.
    pub fn on_debug(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.debug_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The worker process's OS pid, once started.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Spawn the worker process and its three pumps, if not already
    /// started. Idempotent.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (program, args) = self
            .inner
            .command
            .split_first()
            .expect("command must have at least a program name");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.inner.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(ServiceError::spawn)?;

        let stdin = child.stdin.take().ok_or(ServiceError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(ServiceError::NoStdout)?;
        let stderr = child.stderr.take();
        if let Some(pid) = child.id() {
            self.inner.pid.store(pid, Ordering::SeqCst);
        }

        *self.inner.stdin.lock().await = Some(stdin);

        debug!(service_id = self.inner.id, "worker process started");

        tokio::spawn(stdout_pump(Arc::clone(&self.inner), stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(stderr_pump(Arc::clone(&self.inner), stderr));
        }
        tokio::spawn(monitor(Arc::clone(&self.inner), child));

        Ok(())
    }

    /// Create a new task, starting the worker process first if needed.
    pub async fn task(
        &self,
        script: impl Into<String>,
        inputs: Args,
        queue: Option<String>,
    ) -> Result<Arc<Task>, ServiceError> {
        self.start().await?;
        Ok(Task::new(self.clone(), script.into(), inputs, queue))
    }

    pub(crate) fn register_task(&self, uuid: String, task: Arc<Task>) {
        self.inner.tasks.insert(uuid, task);
    }

    /// Encode and write a request line to the worker's stdin, serialized by
    /// the stdin mutex so concurrent callers never interleave partial lines.
    pub(crate) async fn send_request(&self, task_uuid: &str, payload: RequestPayload) {
        let line = encode_request(&Request {
            task: task_uuid.to_string(),
            payload,
        });
        self.debug("SERVICE", &line);

        let mut guard = self.inner.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            warn!(service_id = self.inner.id, "no stdin pipe; worker not started");
            return;
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            let err = ServiceError::write(e);
            warn!(service_id = self.inner.id, error = %err, "failed writing request");
            return;
        }
        if let Err(e) = stdin.write_all(b"\n").await {
            let err = ServiceError::write(e);
            warn!(service_id = self.inner.id, error = %err, "failed writing newline");
            return;
        }
        if let Err(e) = stdin.flush().await {
            let err = ServiceError::write(e);
            warn!(service_id = self.inner.id, error = %err, "failed flushing stdin");
        }
    }

    /// Close the worker process's stdin, signaling it to exit its receiver
    /// loop in an orderly fashion.
    pub async fn close(&self) {
        self.inner.stdin.lock().await.take();
    }

    /// Forcibly terminate the worker process via `SIGKILL` (through
    /// `libc`, matching this crate's existing raw-syscall idiom for OS
    /// primitives — see [`crate::shm`]) rather than retaining an owned
    /// `Child` handle the monitor task would otherwise need to share, since
    /// `tokio::process::Child::wait` requires exclusive access.
    pub fn kill(&self) {
        if let Some(pid) = self.pid() {
            // SAFETY: sending SIGKILL to a pid we ourselves spawned is
            // always well-defined; a pid that already exited yields ESRCH,
            // silently ignored.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    /// Block until the worker process has exited (normally or via crash).
    pub async fn wait_for(&self) {
        while !self.inner.exited.load(Ordering::SeqCst) {
            self.inner.exit_notify.notified().await;
        }
    }

    // ---- get_var / put_var / call / proxy ----

    pub async fn get_var(&self, name: &str) -> Result<Value, ScriptOpError> {
        let syntax = self.syntax().ok_or(ScriptOpError::NoSyntax)?;
        let script = syntax.get_var(name);
        let task = self.task(script, Args::new(), None).await?;
        let outputs = task.result().await?;
        Ok(outputs.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn put_var(&self, name: &str, value: Value) -> Result<(), ScriptOpError> {
        let syntax = self.syntax().ok_or(ScriptOpError::NoSyntax)?;
        let script = syntax.put_var(name, "_value");
        let mut inputs = Args::new();
        inputs.insert("_value".to_string(), value);
        let task = self.task(script, inputs, None).await?;
        task.result().await?;
        Ok(())
    }

    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Args, ScriptOpError> {
        let syntax = self.syntax().ok_or(ScriptOpError::NoSyntax)?;
        let (inputs, arg_names) = pack_args(args);
        let script = syntax.call(function, &arg_names);
        let task = self.task(script, inputs, None).await?;
        Ok(task.result().await?)
    }

    /// Create a proxy for a variable previously exported by the worker via
    /// `task.export(...)`.
    pub fn proxy(&self, var: impl Into<String>, queue: Option<String>) -> Arc<ProxyObject> {
        Arc::new(ProxyObject::new(self.clone(), var.into(), queue))
    }

    fn debug(&self, prefix: &str, message: &str) {
        debug_with(&self.inner, prefix, message);
    }
}

/// Construct the `arg0..argN` inputs map and parallel name list used by
/// `call`/`ProxyObject::call`/`ProxyObject::invoke`.
pub(crate) fn pack_args(args: Vec<Value>) -> (Args, Vec<String>) {
    let mut inputs = Args::new();
    let mut names = Vec::with_capacity(args.len());
    for (i, value) in args.into_iter().enumerate() {
        let name = format!("arg{i}");
        inputs.insert(name.clone(), value);
        names.push(name);
    }
    (inputs, names)
}

async fn stdout_pump(inner: Arc<ServiceInner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                push_recent(&inner, format!("OUT: {line}"));
                match decode_response(&line) {
                    Ok(response) => {
                        debug_with(&inner, "SERVICE", &line);
                        dispatch_response(&inner, response).await;
                    }
                    Err(_) => debug_with(&inner, "SERVICE", &format!("<INVALID> {line}")),
                }
            }
            Ok(None) => {
                debug_with(&inner, "SERVICE", "<worker stdout closed>");
                return;
            }
            Err(e) => {
                debug_with(&inner, "SERVICE", &format!("<error reading worker stdout: {e}>"));
                return;
            }
        }
    }
}

async fn dispatch_response(inner: &Arc<ServiceInner>, response: Response) {
    let Some(task) = inner.tasks.get(&response.task).map(|e| Arc::clone(e.value())) else {
        debug_with(inner, "SERVICE", &format!("No such task: {}", response.task));
        return;
    };

    let payload = proxify_if_completion(inner, response.payload);
    let finished = task.handle_response(payload).await;
    if finished {
        inner.tasks.remove(&response.task);
    }
}

/// Walks a `COMPLETION` response's outputs, replacing `WorkerObject`
/// sentinels with live [`ProxyObject`]s bound to this service. Other
/// response kinds pass through unchanged.
fn proxify_if_completion(inner: &Arc<ServiceInner>, payload: ResponsePayload) -> ResponsePayload {
    match payload {
        ResponsePayload::Completion { outputs } => {
            let service = Service {
                inner: Arc::clone(inner),
            };
            let outputs = outputs
                .into_iter()
                .map(|(k, v)| (k, proxify_value(&service, v)))
                .collect();
            ResponsePayload::Completion { outputs }
        }
        other => other,
    }
}

fn proxify_value(service: &Service, value: Value) -> Value {
    match value {
        Value::WorkerObject(w) => {
            Value::Proxy(Arc::new(ProxyObject::new(service.clone(), w.var_name, None)))
        }
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, proxify_value(service, v)))
                .collect(),
        ),
        Value::List(items) => {
            Value::List(items.into_iter().map(|v| proxify_value(service, v)).collect())
        }
        other => other,
    }
}

async fn stderr_pump(inner: Arc<ServiceInner>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                push_recent(&inner, format!("ERR: {line}"));
                debug_with(&inner, "WORKER", &line);
            }
            Ok(None) => {
                debug_with(&inner, "SERVICE", "<worker stderr closed>");
                return;
            }
            Err(e) => {
                debug_with(&inner, "SERVICE", &format!("<error reading worker stderr: {e}>"));
                return;
            }
        }
    }
}

async fn monitor(inner: Arc<ServiceInner>, mut child: tokio::process::Child) {
    let status = child.wait().await;
    let exit_code = match &status {
        Ok(s) => s.code().unwrap_or(-1),
        Err(_) => -1,
    };

    if !matches!(&status, Ok(s) if s.success()) {
        debug_with(
            &inner,
            "SERVICE",
            &format!("<worker process terminated with exit code {exit_code}>"),
        );
    }
    let pending: Vec<Arc<Task>> = inner.tasks.iter().map(|e| Arc::clone(e.value())).collect();
    if !pending.is_empty() {
        debug_with(
            &inner,
            "SERVICE",
            &format!("<worker process terminated with {} pending tasks>", pending.len()),
        );
    }

    let transcript = inner
        .recent_lines
        .lock()
        .unwrap()
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let error = format!("worker process exited with code {exit_code}\n{transcript}");

    for task in pending {
        task.crash(error.clone()).await;
    }
    inner.tasks.clear();

    inner.exited.store(true, Ordering::SeqCst);
    inner.exit_notify.notify_waiters();
}

fn push_recent(inner: &ServiceInner, line: String) {
    let mut buf = inner.recent_lines.lock().unwrap();
    buf.push_back(line);
    while buf.len() > inner.config.crash_transcript_lines {
        buf.pop_front();
    }
}

fn debug_with(inner: &ServiceInner, prefix: &str, message: &str) {
    let callback = inner.debug_callback.lock().unwrap().clone();
    if let Some(callback) = callback {
        callback(&format!("[{prefix}-{}] {message}", inner.id));
    }
}

impl Clone for Service {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("id", &self.inner.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_service_has_not_started() {
        let service = Service::new(".", vec!["true".to_string()]);
        assert!(!service.inner.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn each_service_gets_a_distinct_id() {
        let a = Service::new(".", vec!["true".to_string()]);
        let b = Service::new(".", vec!["true".to_string()]);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn get_var_without_syntax_fails() {
        let service = Service::new(".", vec!["true".to_string()]);
        let err = service.get_var("x").await.unwrap_err();
        assert!(matches!(err, ScriptOpError::NoSyntax));
    }

    #[tokio::test]
    async fn pack_args_names_are_positional() {
        let (inputs, names) = pack_args(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(names, vec!["arg0".to_string(), "arg1".to_string()]);
        assert_eq!(inputs.get("arg0"), Some(&Value::Int(1)));
        assert_eq!(inputs.get("arg1"), Some(&Value::Int(2)));
    }
}
