//! The worker-process runtime.
//!
//! Worker-process state lives behind a context object rather than module
//! globals: [`context::install_auto_export_sink`] gives the codec a way to
//! reach the running worker's export table, and [`Worker`] itself is the
//! shared instance every task handle and the receiver/janitor threads hold
//! a reference to via `Arc`.
//!
//! A worker is three real OS threads cooperating over two `DashMap`/`Mutex`-
//! guarded collections:
//! - the **receiver** thread reads newline-delimited JSON requests from
//!   stdin and dispatches `EXECUTE`/`CANCEL`;
//! - the **janitor** thread sweeps every `queue_poll_interval` (reusing
//!   [`crate::config::WorkerConfig::janitor_interval`]) for task threads that
//!   died without a terminal response, and fails them;
//! - the **main** thread (the caller of [`Worker::run`]) drains the
//!   `queue="main"` FIFO, executing those tasks itself; every other task
//!   gets its own dedicated thread, spawned by the receiver.

mod engine;
mod expr_engine;

pub use engine::{ExecutionContext, ScriptEngine};
pub use expr_engine::ExprEngine;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;

use crate::codec;
use crate::config::WorkerConfig;
use crate::context;
use crate::protocol::{Request, RequestPayload, Response, ResponsePayload};
use crate::value::{Args, Value};

/// The worker-process runtime: owns the task registry, the shared exports
/// map, and the `queue="main"` FIFO, and drives the receiver/janitor threads.
pub struct Worker {
    engine: Arc<dyn ScriptEngine>,
    config: WorkerConfig,
    tasks: DashMap<String, Arc<WorkerTask>>,
    exports: StdMutex<HashMap<String, Value>>,
    main_queue: StdMutex<VecDeque<Arc<WorkerTask>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("tasks", &self.tasks.len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Worker {
    /// Build a worker around `engine` with default timings, mark the
    /// process as a worker, run the optional init script, and start the
    /// receiver and janitor threads. Call [`Worker::run`] afterward to drive
    /// the `queue="main"` loop on the calling thread.
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Arc<Self> {
        Self::with_config(engine, WorkerConfig::default())
    }

    pub fn with_config(engine: Arc<dyn ScriptEngine>, config: WorkerConfig) -> Arc<Self> {
        context::mark_worker_process();

        let worker = Arc::new(Self {
            engine,
            config,
            tasks: DashMap::new(),
            exports: StdMutex::new(HashMap::new()),
            main_queue: StdMutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        });

        let sink_worker = Arc::clone(&worker);
        context::install_auto_export_sink(move |value| {
            let name = codec::next_auto_export_name();
            sink_worker
                .exports
                .lock()
                .expect("exports mutex poisoned")
                .insert(name.clone(), value);
            name
        });

        worker.run_init_script();

        let receiver_worker = Arc::clone(&worker);
        thread::Builder::new()
            .name("appose-receiver".to_string())
            .spawn(move || receiver_loop(receiver_worker))
            .expect("failed to spawn receiver thread");

        let janitor_worker = Arc::clone(&worker);
        thread::Builder::new()
            .name("appose-janitor".to_string())
            .spawn(move || janitor_loop(janitor_worker))
            .expect("failed to spawn janitor thread");

        worker
    }

    fn run_init_script(&self) {
        let Ok(path) = std::env::var(self.config.init_script_env_var) else {
            return;
        };
        let script = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("appose: failed to read init script {path:?}: {e}");
                return;
            }
        };
        let empty_inputs = Args::new();
        let mut ctx = ExecutionContext::new(&script, &empty_inputs, HashMap::new(), None, None);
        match self.engine.execute(&mut ctx) {
            Ok(_) => {
                let mut exports = self.exports.lock().expect("exports mutex poisoned");
                for (k, v) in ctx.bindings().clone() {
                    exports.insert(k, v);
                }
            }
            Err(e) => eprintln!("appose: init script failed: {e}"),
        }
        let _ = fs::remove_file(&path);
    }

    /// Bind `name` into the shared exports map, visible to every task
    /// started after this call.
    pub(crate) fn export(&self, name: String, value: Value) {
        self.exports
            .lock()
            .expect("exports mutex poisoned")
            .insert(name, value);
    }

    fn exports_snapshot(&self) -> HashMap<String, Value> {
        self.exports.lock().expect("exports mutex poisoned").clone()
    }

    /// Drive the `queue="main"` FIFO on the calling thread. Every
    /// non-`"main"` task runs on its own dedicated thread spawned by the
    /// receiver; this loop sleeps for `queue_poll_interval` whenever the
    /// main queue is empty, and returns once the receiver has observed EOF
    /// on stdin and the main queue has drained.
    pub fn run(&self) {
        loop {
            let next = self.main_queue.lock().expect("main queue poisoned").pop_front();
            match next {
                Some(task) => self.execute_task(task),
                None => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(self.config.queue_poll_interval);
                }
            }
        }
    }

    fn execute_task(&self, task: Arc<WorkerTask>) {
        respond(&task, ResponsePayload::Launch);

        let exports_snapshot = self.exports_snapshot();
        let mut ctx = ExecutionContext::new(
            &task.script,
            &task.inputs,
            exports_snapshot,
            Some(self),
            Some(&task),
        );

        match self.engine.execute(&mut ctx) {
            Ok(None) | Ok(Some(Value::Null)) => {}
            Ok(Some(Value::Map(map))) => {
                for (k, v) in map {
                    task.set_output(k, v);
                }
            }
            Ok(Some(other)) => task.set_output("result", other),
            Err(e) => {
                respond(&task, ResponsePayload::Failure { error: Some(e) });
                self.tasks.remove(task.uuid());
                return;
            }
        }

        let outputs = task.outputs.lock().expect("outputs mutex poisoned").clone();
        respond(&task, ResponsePayload::Completion { outputs });
        self.tasks.remove(task.uuid());
    }
}

/// A single in-flight task, from the worker's side: its script, its inputs,
/// its mutable outputs, and the bookkeeping needed to dedup a terminal
/// response and detect a dead execution thread.
pub struct WorkerTask {
    uuid: String,
    script: String,
    inputs: Args,
    outputs: StdMutex<Args>,
    cancel_requested: AtomicBool,
    finished: AtomicBool,
    thread: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTask").field("uuid", &self.uuid).finish()
    }
}

impl WorkerTask {
    fn new(uuid: String, script: String, inputs: Args) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            script,
            inputs,
            outputs: StdMutex::new(Args::new()),
            cancel_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            thread: StdMutex::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn set_output(&self, name: impl Into<String>, value: Value) {
        self.outputs
            .lock()
            .expect("outputs mutex poisoned")
            .insert(name.into(), value);
    }

    pub fn update(
        &self,
        message: Option<String>,
        current: Option<i64>,
        maximum: Option<i64>,
        info: Option<Args>,
    ) {
        respond(
            self,
            ResponsePayload::Update {
                message,
                current,
                maximum,
                info,
            },
        );
    }

    pub fn cancel(&self) {
        respond(self, ResponsePayload::Cancelation);
    }

    pub fn fail(&self, error: impl Into<String>) {
        respond(
            self,
            ResponsePayload::Failure {
                error: Some(error.into()),
            },
        );
    }

    fn mark_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock().expect("thread mutex poisoned") = Some(handle);
    }

    /// True iff this task was handed a dedicated thread and that thread has
    /// exited. `queue="main"` tasks (no dedicated thread) are never
    /// considered dead here — they are removed by `Worker::execute_task`
    /// itself once the main loop finishes running them.
    fn thread_is_dead(&self) -> bool {
        match &*self.thread.lock().expect("thread mutex poisoned") {
            Some(handle) => handle.is_finished(),
            None => false,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Emit `payload` for `task`, deduping terminal responses: once a terminal
/// response (`COMPLETION`/`CANCELATION`/`FAILURE`) has been sent for a task,
/// every subsequent terminal response is silently dropped.
fn respond(task: &WorkerTask, payload: ResponsePayload) {
    if payload.is_terminal() && task.finished.swap(true, Ordering::SeqCst) {
        return;
    }
    emit_response(&Response {
        task: task.uuid.clone(),
        payload,
    });
}

fn emit_response(resp: &Response) {
    let line = codec::encode_response(resp);
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{line}");
    let _ = lock.flush();
}

fn receiver_loop(worker: Arc<Worker>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if !line.is_empty() => match codec::decode_request(&line) {
                Ok(req) => dispatch_request(&worker, req),
                Err(e) => eprintln!("appose: malformed request: {e}"),
            },
            _ => break,
        }
    }
    worker.running.store(false, Ordering::SeqCst);
}

fn dispatch_request(worker: &Arc<Worker>, req: Request) {
    match req.payload {
        RequestPayload::Execute {
            script,
            inputs,
            queue,
        } => {
            let task = WorkerTask::new(req.task.clone(), script, inputs);
            worker.tasks.insert(req.task.clone(), Arc::clone(&task));
            if queue.as_deref() == Some("main") {
                worker
                    .main_queue
                    .lock()
                    .expect("main queue poisoned")
                    .push_back(task);
            } else {
                let worker_clone = Arc::clone(worker);
                let task_clone = Arc::clone(&task);
                let handle = thread::Builder::new()
                    .name(format!("appose-task-{}", task.uuid))
                    .spawn(move || worker_clone.execute_task(task_clone))
                    .expect("failed to spawn task thread");
                task.mark_thread(handle);
            }
        }
        RequestPayload::Cancel => match worker.tasks.get(&req.task) {
            Some(entry) => entry.value().request_cancel(),
            None => eprintln!("appose: No such task: {}", req.task),
        },
    }
}

fn janitor_loop(worker: Arc<Worker>) {
    loop {
        thread::sleep(worker.config.janitor_interval);

        let dead: Vec<Arc<WorkerTask>> = worker
            .tasks
            .iter()
            .filter(|entry| entry.value().thread_is_dead())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for task in dead {
            worker.tasks.remove(task.uuid());
            if !task.is_finished() {
                respond(
                    &task,
                    ResponsePayload::Failure {
                        error: Some("worker task thread died unexpectedly".to_string()),
                    },
                );
            }
        }

        if !worker.running.load(Ordering::SeqCst) && worker.tasks.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respond_dedups_terminal_responses() {
        let task = WorkerTask::new("t1".to_string(), "1".to_string(), Args::new());
        assert!(!task.is_finished());
        respond(&task, ResponsePayload::Completion { outputs: Args::new() });
        assert!(task.is_finished());
        // A second terminal response is a silent no-op; nothing to assert
        // externally since stdout isn't captured here, but this must not
        // panic and must leave `finished` true.
        respond(&task, ResponsePayload::Failure { error: Some("late".to_string()) });
        assert!(task.is_finished());
    }

    #[test]
    fn cancel_request_flag_round_trips() {
        let task = WorkerTask::new("t2".to_string(), "1".to_string(), Args::new());
        assert!(!task.cancel_requested());
        task.request_cancel();
        assert!(task.cancel_requested());
    }

    #[test]
    fn main_queue_task_has_no_dedicated_thread_and_is_never_dead() {
        let task = WorkerTask::new("t3".to_string(), "1".to_string(), Args::new());
        assert!(!task.thread_is_dead());
    }
}
