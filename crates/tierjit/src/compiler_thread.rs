//! Background compilation threads.
//!
//! A fixed pool of worker threads fed by a `crossbeam` channel. When the
//! dispatcher runs in background mode, the caller that wins a compilation
//! request sends it here instead of compiling inline and keeps
//! interpreting; later invocations find the artifact in the cache.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};

use crate::types::{MethodId, Tier};

/// A request to compile a method at a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilationRequest {
    pub method: MethodId,
    pub tier: Tier,
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Handle to the background compiler pool.
///
/// Holds the sender half of a multi-consumer channel; every worker pulls from
/// the same receiver. Requests are processed in arrival order per worker.
///
/// On `Drop`, the sender is closed (causing each worker's `recv()` to return
/// `Err` once the queue is drained) and all workers are joined.
pub struct CompilerPool {
    sender: Option<Sender<CompilationRequest>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl CompilerPool {
    /// Start `workers` compiler threads (at least one).
    ///
    /// `handler_fn` is invoked on a worker thread for each request. It is
    /// responsible for compiling, publishing and reporting failures; nothing
    /// is returned to the thread that sent the request. A panicking handler
    /// is logged and the worker moves on to the next request.
    pub fn start<F>(workers: usize, handler_fn: F) -> Self
    where
        F: Fn(CompilationRequest) + Send + Sync + 'static,
    {
        let (sender, receiver) = channel::unbounded::<CompilationRequest>();
        let handler_fn = Arc::new(handler_fn);

        let handles = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let handler_fn = Arc::clone(&handler_fn);

                #[expect(clippy::expect_used, reason = "thread spawn failure is unrecoverable")]
                let handle = thread::Builder::new()
                    .name(format!("tierjit-compiler-{index}"))
                    .spawn(move || {
                        while let Ok(request) = receiver.recv() {
                            let handled =
                                panic::catch_unwind(AssertUnwindSafe(|| handler_fn(request)));
                            if let Err(payload) = handled {
                                tracing::error!(
                                    method = %request.method,
                                    tier = %request.tier,
                                    payload = ?panic_message(payload.as_ref()),
                                    "compilation request panicked"
                                );
                            }
                        }
                    })
                    .expect("failed to spawn compiler thread");
                handle
            })
            .collect();

        Self {
            sender: Some(sender),
            handles,
        }
    }

    /// Queue a compilation request.
    ///
    /// Returns `true` if the request was queued, `false` if every worker has
    /// gone away. Never blocks.
    pub fn send(&self, request: CompilationRequest) -> bool {
        self.sender
            .as_ref()
            .map(|s| s.send(request).is_ok())
            .unwrap_or(false)
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Requests waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map(Sender::len).unwrap_or(0)
    }
}

impl Drop for CompilerPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if let Err(panic_payload) = handle.join() {
                // Don't re-panic during drop (double panic aborts).
                tracing::error!(
                    thread = name.as_deref().unwrap_or("<unnamed>"),
                    payload = ?panic_message(panic_payload.as_ref()),
                    "compiler thread panicked"
                );
            }
        }
    }
}

impl std::fmt::Debug for CompilerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerPool")
            .field("active", &self.sender.is_some())
            .field("workers", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_pool_processes_requests() {
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        let pool = CompilerPool::start(2, move |_req| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(pool.workers(), 2);

        for raw in 0..10 {
            assert!(pool.send(CompilationRequest {
                method: MethodId(raw),
                tier: Tier::L1,
            }));
        }

        // Drop joins the workers after the queue drains.
        drop(pool);
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_pool_runs_on_worker_threads() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let names_clone = Arc::clone(&names);

        let pool = CompilerPool::start(1, move |_req| {
            let name = thread::current().name().map(str::to_owned);
            names_clone.lock().unwrap().push(name);
        });
        assert!(pool.send(CompilationRequest {
            method: MethodId(1),
            tier: Tier::L2,
        }));
        drop(pool);

        let names = names.lock().unwrap();
        assert_eq!(names.as_slice(), &[Some("tierjit-compiler-0".to_string())]);
    }

    #[test]
    fn test_zero_workers_still_starts_one() {
        let pool = CompilerPool::start(0, |_req: CompilationRequest| {});
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_worker_survives_handler_panic() {
        let handled = Arc::new(AtomicU64::new(0));
        let handled_clone = Arc::clone(&handled);

        let pool = CompilerPool::start(1, move |req: CompilationRequest| {
            if req.method == MethodId(3) {
                panic!("boom");
            }
            handled_clone.fetch_add(1, Ordering::Relaxed);
        });
        for raw in [3, 4, 5] {
            assert!(pool.send(CompilationRequest {
                method: MethodId(raw),
                tier: Tier::L1,
            }));
        }
        // The single worker is still alive after the panic and drains the rest.
        drop(pool);
        assert_eq!(handled.load(Ordering::Relaxed), 2);
    }
}
