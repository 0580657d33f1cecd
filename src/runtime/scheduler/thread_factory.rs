//! Thread creation policy
//!
//! The worker pool never builds threads itself; it asks a [`ThreadFactory`],
//! which decides naming, stack size, whether the threads are background
//! (daemon) threads and which handler receives failures nobody else takes.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::failure::FailureHandler;

/// Process-wide pool numbering for thread names.
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Policy used by schedulers to create their threads.
pub trait ThreadFactory: Send + Sync + fmt::Debug {
    /// Start a thread running `body`.
    fn spawn(
        &self,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;

    /// Background threads do not hold up the owner when it is dropped.
    fn is_daemon(&self) -> bool {
        true
    }

    /// Last-resort handler for failures on threads of this factory.
    fn uncaught_handler(&self) -> Option<Arc<dyn FailureHandler>> {
        None
    }
}

/// [`ThreadFactory`] backed by [`thread::Builder`].
pub struct ConfigurableThreadFactory {
    prefix: String,
    pool_id: Option<usize>,
    next_thread: AtomicUsize,
    daemon: bool,
    stack_size: Option<usize>,
    uncaught: Option<Arc<dyn FailureHandler>>,
}

impl fmt::Debug for ConfigurableThreadFactory {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ConfigurableThreadFactory")
            .field("prefix", &self.prefix)
            .field("pool_id", &self.pool_id)
            .field("daemon", &self.daemon)
            .field("stack_size", &self.stack_size)
            .field("uncaught", &self.uncaught.is_some())
            .finish()
    }
}

impl ConfigurableThreadFactory {
    /// Threads named `{prefix}-{pool}-{n}`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pool_id: Some(NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst)),
            next_thread: AtomicUsize::new(1),
            daemon: true,
            stack_size: None,
            uncaught: None,
        }
    }

    /// Drop the pool number from thread names: `{prefix}-{n}`.
    pub fn without_pool_id(mut self) -> Self {
        self.pool_id = None;
        self
    }

    pub fn with_daemon(
        mut self,
        daemon: bool,
    ) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn with_stack_size(
        mut self,
        stack_size: usize,
    ) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn with_uncaught_handler(
        mut self,
        handler: Arc<dyn FailureHandler>,
    ) -> Self {
        self.uncaught = Some(handler);
        self
    }

    fn next_name(&self) -> String {
        let n = self.next_thread.fetch_add(1, Ordering::SeqCst);
        match self.pool_id {
            Some(pool) => format!("{}-{}-{}", self.prefix, pool, n),
            None => format!("{}-{}", self.prefix, n),
        }
    }
}

impl Default for ConfigurableThreadFactory {
    fn default() -> Self {
        Self::new("priosched")
    }
}

impl ThreadFactory for ConfigurableThreadFactory {
    fn spawn(
        &self,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(self.next_name());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder.spawn(body)
    }

    fn is_daemon(&self) -> bool {
        self.daemon
    }

    fn uncaught_handler(&self) -> Option<Arc<dyn FailureHandler>> {
        self.uncaught.clone()
    }
}
