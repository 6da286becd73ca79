//! Tunable timings for the service and worker runtimes.
//!
//! The original implementation hard-codes its `~50ms` poll/sweep intervals
//! inline at each call site (`python_worker.py`'s `_process_input` /
//! `_cleanup_threads` / `run` loops). This crate lifts them into small
//! `Default`-able settings structs instead, following the plain-settings-struct
//! convention used throughout the orchestration crates this one is descended
//! from, rather than scattering magic `Duration` literals through the code.

use std::time::Duration;

/// Settings for the worker-side runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long the main-thread loop sleeps when its queue is empty.
    pub queue_poll_interval: Duration,
    /// How often the janitor sweeps for dead task threads.
    pub janitor_interval: Duration,
    /// Name of the environment variable carrying the optional init script
    /// path (`APPOSE_INIT_SCRIPT`).
    pub init_script_env_var: &'static str,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_poll_interval: Duration::from_millis(50),
            janitor_interval: Duration::from_millis(50),
            init_script_env_var: "APPOSE_INIT_SCRIPT",
        }
    }
}

/// Settings for the caller-side [`crate::service::Service`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How many of the most recent stdout/stderr lines to retain for a
    /// worker-crash error transcript.
    pub crash_transcript_lines: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            crash_transcript_lines: 50,
        }
    }
}
