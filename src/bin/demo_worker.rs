//! Standalone reference worker binary, built on [`appose::ExprEngine`].
//!
//! Any launch command naming this binary (or one built the same way against
//! a real guest-language engine) is a conforming worker process. It speaks
//! only the wire protocol on stdout; all diagnostics go to stderr via
//! `tracing`, never stdout, since the two are multiplexed onto the same pipe
//! pair the caller's [`appose::Service`] reads.
//!
//! Used by this crate's own integration tests (`tests/`) as a real child
//! process to drive end-to-end through the actual stdin/stdout protocol.

use std::sync::Arc;

use appose::{ExprEngine, Worker};

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let worker = Worker::new(Arc::new(ExprEngine));
    worker.run();
}
