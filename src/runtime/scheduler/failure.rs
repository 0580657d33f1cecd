//! Routing of uncaught task failures
//!
//! A panicking action on a pool worker never takes the worker down. The panic
//! becomes a [`TaskFailure`] and is handed to the first handler found, in this
//! order:
//!
//! 1. the handler the task was submitted with
//!    ([`TaskOptions::with_failure_handler`](super::task::TaskOptions::with_failure_handler))
//! 2. the router's inheritable handler, shared by every worker the scheduler spawns
//! 3. the router's default handler
//! 4. the uncaught handler of the thread that runs the task (from its
//!    [`ThreadFactory`](super::thread_factory::ThreadFactory))
//! 5. otherwise the failure trace is written to the router's sink (stderr)
//!
//! If the chosen handler itself panics, the original trace followed by the
//! handler's own failure is written to the sink.

use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use thiserror::Error;

use super::task::TaskId;

/// A task action that panicked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{task_id} panicked on thread '{thread}': {message}")]
pub struct TaskFailure {
    task_id: TaskId,
    thread: String,
    message: String,
}

impl TaskFailure {
    pub fn new(
        task_id: TaskId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            message: message.into(),
        }
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(
        task_id: TaskId,
        payload: &(dyn Any + Send),
    ) -> Self {
        Self::new(task_id, panic_message(payload))
    }

    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[inline]
    pub fn thread(&self) -> &str {
        &self.thread
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Full text written when nobody handles the failure.
    pub fn trace(&self) -> String {
        format!("Uncaught task failure: {}\n", self)
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Receiver of task failures.
pub trait FailureHandler: Send + Sync {
    fn handle(
        &self,
        failure: &TaskFailure,
    );
}

impl<F> FailureHandler for F
where
    F: Fn(&TaskFailure) + Send + Sync,
{
    fn handle(
        &self,
        failure: &TaskFailure,
    ) {
        self(failure)
    }
}

/// Failure handling context passed to a scheduler at construction.
#[derive(Clone)]
pub struct FailureRouter {
    inheritable: Option<Arc<dyn FailureHandler>>,
    default: Option<Arc<dyn FailureHandler>>,
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for FailureRouter {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FailureRouter")
            .field("inheritable", &self.inheritable.is_some())
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl FailureRouter {
    /// Router with no handlers, writing to stderr.
    pub fn new() -> Self {
        Self {
            inheritable: None,
            default: None,
            sink: Arc::new(Mutex::new(Box::new(io::stderr()))),
        }
    }

    /// Handler inherited by every worker thread of the scheduler.
    pub fn with_inheritable(
        mut self,
        handler: Arc<dyn FailureHandler>,
    ) -> Self {
        self.inheritable = Some(handler);
        self
    }

    /// Fallback handler used when no task or inheritable handler exists.
    pub fn with_default(
        mut self,
        handler: Arc<dyn FailureHandler>,
    ) -> Self {
        self.default = Some(handler);
        self
    }

    /// Replace the stderr sink used for unhandled failures.
    pub fn with_sink<W>(
        mut self,
        sink: W,
    ) -> Self
    where
        W: Write + Send + 'static,
    {
        self.sink = Arc::new(Mutex::new(Box::new(sink)));
        self
    }

    /// The handler that would receive a failure of a task submitted with
    /// `task_handler`, raised on a thread whose factory supplies `uncaught`.
    pub fn resolve(
        &self,
        task_handler: Option<&Arc<dyn FailureHandler>>,
        uncaught: Option<&Arc<dyn FailureHandler>>,
    ) -> Option<Arc<dyn FailureHandler>> {
        task_handler
            .cloned()
            .or_else(|| self.inheritable.clone())
            .or_else(|| self.default.clone())
            .or_else(|| uncaught.cloned())
    }

    /// Deliver a failure along the chain.
    pub fn route(
        &self,
        failure: &TaskFailure,
        task_handler: Option<&Arc<dyn FailureHandler>>,
        uncaught: Option<&Arc<dyn FailureHandler>>,
    ) {
        let Some(handler) = self.resolve(task_handler, uncaught) else {
            tracing::warn!("no failure handler for {}, writing to sink", failure.task_id());
            self.write(&failure.trace());
            return;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle(failure))) {
            let secondary = panic_message(payload.as_ref());
            tracing::warn!(
                "failure handler panicked while handling {}: {}",
                failure.task_id(),
                secondary
            );
            self.write(&format!(
                "{}Failure handler panicked: {}\n",
                failure.trace(),
                secondary
            ));
        }
    }

    fn write(
        &self,
        text: &str,
    ) {
        let mut sink = self.sink.lock();
        // Nowhere left to report a broken sink.
        let _ = sink.write_all(text.as_bytes());
        let _ = sink.flush();
    }
}

impl Default for FailureRouter {
    fn default() -> Self {
        Self::new()
    }
}
