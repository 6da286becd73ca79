//! Appose: cooperative multithreaded/multiprocess execution with shared
//! memory, across languages, in a single machine.
//!
//! A caller process runs a [`service::Service`], which owns one child
//! worker process speaking a small newline-delimited JSON protocol over
//! stdin/stdout ([`protocol`], [`codec`]). The caller submits
//! [`task::Task`]s — scripts plus typed inputs ([`value::Value`]) — and
//! observes their progress and completion asynchronously. Large buffers
//! cross the process boundary by reference via POSIX shared memory
//! ([`shm`], [`ndarray`]) instead of being serialized through the JSON
//! channel.
//!
//! [`worker::Worker`] is the reference implementation of the *other* side
//! of that protocol: a runtime any binary can embed to become an Appose
//! worker, driven by a pluggable [`worker::ScriptEngine`]. This crate ships
//! one such engine, [`worker::ExprEngine`], and a [`environment::Environment`]
//! façade for launching services bound to a resolved command and script
//! syntax.

pub mod codec;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod ndarray;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod shm;
pub mod syntax;
pub mod task;
pub mod value;
pub mod worker;

pub use config::{ServiceConfig, WorkerConfig};
pub use environment::Environment;
pub use ndarray::NDArray;
pub use proxy::ProxyObject;
pub use service::Service;
pub use shm::SharedMemoryRegion;
pub use task::{Task, TaskEvent};
pub use value::{Args, Value};
pub use worker::{ExecutionContext, ExprEngine, ScriptEngine, Worker};
