//! The seam between a worker runtime and whatever language a task's script
//! is written in.
//!
//! Rather than embedding a specific language's interpreter, this crate
//! factors script execution behind a trait so the worker runtime itself
//! stays language-agnostic. [`super::ExprEngine`] is the one concrete engine
//! this crate ships.

use std::collections::HashMap;

use crate::value::{Args, Value};

use super::{Worker, WorkerTask};

/// A pluggable script interpreter. A worker process is configured with
/// exactly one engine for its whole lifetime ([`Worker::new`]); every task
/// it runs is executed by calling [`ScriptEngine::execute`] once per task.
pub trait ScriptEngine: Send + Sync + std::fmt::Debug {
    /// Run `ctx.script` against `ctx`'s binding scope.
    ///
    /// Returns the script's produced value, if any, under the
    /// final-expression convention: if the script's final statement is a
    /// bare expression, its value becomes the task's result. A mapping
    /// value is merged into the task's outputs key-by-key; any other value
    /// is stored as `outputs["result"]`; `Ok(None)` means nothing was
    /// produced. An `Err` carries the message a `FAILURE` response reports.
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>, String>;
}

/// The binding scope and task/worker handles visible to a single running
/// script.
///
/// Constructed fresh per task execution (and, without a `task`/`worker`, per
/// nested user-defined function call — see [`super::expr_engine`]) from a
/// snapshot of the worker's exports at the moment the task started, with the
/// task's inputs layered on top. Mutations to `bindings` during execution
/// (assignment, `fn` definitions) are local to this one script run; the only
/// way a script affects another task is explicitly, via `task.export(...)`.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    pub script: &'a str,
    pub inputs: &'a Args,
    bindings: HashMap<String, Value>,
    worker: Option<&'a Worker>,
    task: Option<&'a WorkerTask>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        script: &'a str,
        inputs: &'a Args,
        exports_snapshot: HashMap<String, Value>,
        worker: Option<&'a Worker>,
        task: Option<&'a WorkerTask>,
    ) -> Self {
        let mut bindings = exports_snapshot;
        for (k, v) in inputs {
            bindings.insert(k.clone(), v.clone());
        }
        Self {
            script,
            inputs,
            bindings,
            worker,
            task,
        }
    }

    /// A scope with no worker/task attachment, for evaluating a
    /// user-defined function body in isolation (see
    /// `super::expr_engine::call_user_function`): `task.*` calls from
    /// inside such a function are no-ops, matching this engine's
    /// intentionally minimal, non-closing-over-outer-scope function model.
    pub(crate) fn detached(bindings: HashMap<String, Value>) -> Self {
        Self {
            script: "",
            inputs: EMPTY_ARGS.get_or_init(Args::new),
            bindings,
            worker: None,
            task: None,
        }
    }

    pub fn bindings(&self) -> &HashMap<String, Value> {
        &self.bindings
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    /// `task.update(message, current, maximum, info)`. No-op without a task
    /// attached (e.g. the init script, or a nested function body).
    pub fn update(
        &self,
        message: Option<String>,
        current: Option<i64>,
        maximum: Option<i64>,
        info: Option<Args>,
    ) {
        if let Some(task) = self.task {
            task.update(message, current, maximum, info);
        }
    }

    /// `task.export(name, value)`, binding into the worker's shared exports
    /// map. No-op without a worker attached.
    pub fn export(&self, name: impl Into<String>, value: Value) {
        if let Some(worker) = self.worker {
            worker.export(name.into(), value);
        }
    }

    /// `task.set_output(name, value)`, writing directly into the task's
    /// outputs ahead of whatever the final expression later produces.
    pub fn set_output(&self, name: impl Into<String>, value: Value) {
        if let Some(task) = self.task {
            task.set_output(name, value);
        }
    }

    /// `task.cancel_requested()`.
    pub fn cancel_requested(&self) -> bool {
        self.task.map(|t| t.cancel_requested()).unwrap_or(false)
    }

    /// `task.cancel()`: acknowledge a pending cancelation request.
    pub fn cancel(&self) {
        if let Some(task) = self.task {
            task.cancel();
        }
    }

    /// `task.fail(error)`.
    pub fn fail(&self, error: impl Into<String>) {
        if let Some(task) = self.task {
            task.fail(error);
        }
    }
}

use std::sync::OnceLock;
static EMPTY_ARGS: OnceLock<Args> = OnceLock::new();
