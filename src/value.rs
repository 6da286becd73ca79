//! The dynamically-typed value carried in task `inputs` and `outputs`.
//!
//! [`Value`] is a tagged union rather than a JSON-shaped enum: encoding and
//! decoding to and from the wire JSON representation (including the
//! `appose_type` projections for shared memory, NDArrays, and worker-object
//! sentinels) is the job of [`crate::codec`], not of this type — `Value`
//! itself is just the in-memory data model.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::proxy::ProxyObject;

/// A value flowing across the wire protocol, either as a task input or a
/// task output.
///
/// `Proxy` never appears on the wire (there is no `appose_type` for it); it
/// is the in-memory result of [`crate::service::Service`] replacing a
/// `WorkerObject` sentinel with a live proxy while walking a completed
/// task's outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(Args),
    Shm(ShmRef),
    NDArray(NDArrayRef),
    WorkerObject(WorkerObjectRef),
    Proxy(Arc<ProxyObject>),
    /// A worker-side value with no direct JSON encoding.
    /// [`crate::codec::value_to_json`] auto-exports it under a fresh name via
    /// [`crate::context::auto_export`] and emits a `worker_object` sentinel in
    /// its place; never produced by decoding, and never seen outside a
    /// worker process.
    Opaque(OpaqueHandle),
    /// A callable bound in a worker's export registry, e.g. a function
    /// defined by one task's script and exported for a later task to call.
    /// Like `Opaque`, this has no JSON shape of its own and is auto-exported
    /// if it ever reaches the codec directly; in practice a script calls it
    /// by name rather than returning it as a result.
    Callable(Callable),
}

/// A worker-side callable value, wrapping a boxed closure so that any
/// [`crate::worker::ScriptEngine`] can bind function definitions without
/// this crate's core data model depending on a particular engine's AST.
#[derive(Clone)]
pub struct Callable(pub Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>);

impl Callable {
    pub fn new(f: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, String> {
        (self.0)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable(..)")
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A worker-side handle standing in for some value that cannot be encoded
/// as JSON (e.g. a native object a real script engine would hold). The
/// reference implementation's [`crate::worker::ExprEngine`] constructs
/// these via its `opaque()` builtin to exercise the auto-proxy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueHandle {
    pub type_name: String,
    id: u64,
}

impl OpaqueHandle {
    pub fn new(type_name: impl Into<String>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            type_name: type_name.into(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// A lightweight, wire-shaped reference to a shared-memory region: just the
/// OS-global name and the logical size the sender intends the receiver to
/// see. Distinct from [`crate::shm::SharedMemoryRegion`], which additionally
/// owns the local mapping and disposal behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmRef {
    pub name: String,
    pub rsize: usize,
}

/// A wire-shaped reference to an NDArray: dtype, shape, and the
/// shared-memory region backing it. Distinct from [`crate::ndarray::NDArray`],
/// which owns a live [`crate::shm::SharedMemoryRegion`].
#[derive(Debug, Clone, PartialEq)]
pub struct NDArrayRef {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub shm: ShmRef,
}

/// A sentinel emitted by a worker when a script result could not be encoded
/// directly as JSON. The *service* is responsible for turning these into
/// [`crate::proxy::ProxyObject`]s when it walks a task's outputs; the worker
/// only ever produces the sentinel, never a proxy. Decoding alone never
/// produces a proxy either — `Service::proxify_worker_objects` is the single
/// place a `WorkerObjectRef` is turned into a live proxy, since this crate
/// has no dynamic attribute interception to hook the conversion in sooner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerObjectRef {
    pub var_name: String,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Args> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Arc<ProxyObject>> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(_) => write!(f, "<map>"),
            Value::Shm(shm) => write!(f, "Shm({}, {})", shm.name, shm.rsize),
            Value::NDArray(nd) => write!(f, "NDArray({}, {:?})", nd.dtype, nd.shape),
            Value::WorkerObject(w) => write!(f, "WorkerObject({})", w.var_name),
            Value::Proxy(p) => write!(f, "Proxy({})", p.var()),
            Value::Opaque(o) => write!(f, "Opaque({}#{})", o.type_name, o.id),
            Value::Callable(_) => write!(f, "<function>"),
        }
    }
}

/// A string-keyed map of dynamically-typed values, used for task inputs,
/// task outputs, and progress-update info payloads.
pub type Args = BTreeMap<String, Value>;
