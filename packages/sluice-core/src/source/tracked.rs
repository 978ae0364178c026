//! Outstanding-work tracking for spawned poll cycles.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::task::AbortHandle;

/// Registry of in-flight poll cycles.
///
/// Each tracked future deregisters itself when it is dropped, on completion
/// or on abort, so shutdown only ever waits on (or aborts) genuinely
/// outstanding work.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutstandingTasks {
    state: Arc<Mutex<TaskState>>,
}

#[derive(Debug, Default)]
struct TaskState {
    next_id: u64,
    tasks: HashMap<u64, AbortHandle>,
    // Tasks that finished before their abort handle was registered.
    finished_early: HashSet<u64>,
}

impl OutstandingTasks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawns `future` on the runtime and tracks it until it completes.
    pub(crate) fn track<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            state.next_id
        };
        let tracked = Tracked {
            inner: future,
            registry: self.clone(),
            id,
        };
        let handle = tokio::spawn(tracked);
        let mut state = self.state.lock().unwrap();
        if !state.finished_early.remove(&id) {
            state.tasks.insert(id, handle.abort_handle());
        }
    }

    /// Number of tracked tasks still running.
    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    /// Aborts every tracked task.
    pub(crate) fn abort_all(&self) {
        let handles: Vec<AbortHandle> = {
            let state = self.state.lock().unwrap();
            state.tasks.values().cloned().collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    fn complete(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.tasks.remove(&id).is_none() {
            state.finished_early.insert(id);
        }
    }
}

pin_project! {
    struct Tracked<F> {
        #[pin]
        inner: F,
        registry: OutstandingTasks,
        id: u64,
    }

    impl<F> PinnedDrop for Tracked<F> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            this.registry.complete(*this.id);
        }
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}
