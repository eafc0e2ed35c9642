//! Progress reporting for solves. The solver emits done/total in completion
//! order; front ends consume it through a sink.

use std::sync::Arc;

/// One progress update: how many dispatched units are done and how many were planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
}

/// Sink for progress events. The solver calls this each time a unit completes.
/// Implementations may throttle (e.g. max N updates/sec or every k units).
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
