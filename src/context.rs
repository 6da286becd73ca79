//! Per-process worker/service mode flag.
//!
//! A worker process has exactly one mode for its entire lifetime (it is a
//! worker from the moment it starts until it exits), so this is realized as
//! a single process-wide flag rather than a context object threaded through
//! every call site.
//!
//! Two behaviors key off this flag:
//! - [`crate::codec`]'s auto-export path (non-serializable worker return
//!   values become `worker_object` sentinels only inside a worker process).
//! - [`crate::shm::SharedMemoryRegion::attach`]'s default `unlink_on_dispose`
//!   (a worker must never unlink a region it merely attached to).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::value::Value;

static WORKER_MODE: AtomicBool = AtomicBool::new(false);

/// Mark the current process as an Appose worker. Called once, early, by
/// [`crate::worker::Worker::new`].
pub fn mark_worker_process() {
    WORKER_MODE.store(true, Ordering::SeqCst);
}

/// True iff the current process has called [`mark_worker_process`].
pub fn is_worker_process() -> bool {
    WORKER_MODE.load(Ordering::SeqCst)
}

type AutoExportSink = dyn Fn(Value) -> String + Send + Sync;

static AUTO_EXPORT_SINK: OnceLock<Box<AutoExportSink>> = OnceLock::new();

/// Install the worker's auto-export sink: a closure binding a value into
/// the worker's export registry and returning the fresh variable name it
/// was bound under. This is a dependency injected into the codec at worker
/// start, rather than a second process-global flag;
/// [`crate::worker::Worker::new`] installs it once, and
/// [`crate::codec::value_to_json`] calls [`auto_export`] whenever it meets a
/// [`Value::Opaque`].
///
/// Installing twice is a programming error (a process hosts at most one
/// worker); the second call is silently ignored.
pub fn install_auto_export_sink(sink: impl Fn(Value) -> String + Send + Sync + 'static) {
    let _ = AUTO_EXPORT_SINK.set(Box::new(sink));
}

/// Bind `value` into the worker's export registry and return the fresh
/// name, if a sink has been installed (i.e. this process is running
/// [`crate::worker::Worker`]). `None` outside a worker process.
pub fn auto_export(value: Value) -> Option<String> {
    AUTO_EXPORT_SINK.get().map(|sink| sink(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_service_mode() {
        // NB: other tests in this binary may have already flipped this
        // flag, since it is process-global; we only assert the API shape.
        let _ = is_worker_process();
    }

    #[test]
    fn marking_is_sticky() {
        mark_worker_process();
        assert!(is_worker_process());
    }
}
