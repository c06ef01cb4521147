use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send>;

/// The context completion callbacks run on.
///
/// Loop and task results are never delivered on an arbitrary thread; the
/// spawning code supplies the executor that runs them.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs callbacks immediately on the thread that completed the work.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Runs every callback on one dedicated thread, in submission order.
///
/// The single-callback-thread model for applications that need all
/// notifications on one thread (a UI loop, an ordered audit log).
pub struct QueueExecutor {
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueExecutor {
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("pipemux-callbacks".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
                debug!("callback thread exiting");
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Executor for QueueExecutor {
    fn execute(&self, job: Job) {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(job);
        }
    }
}

impl Drop for QueueExecutor {
    fn drop(&mut self) {
        // Dropping the sender ends the callback thread's recv loop.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Runs one unit of work on a dedicated thread and marshals its outcome
/// back to the configured [`Executor`].
pub struct Worker {
    executor: Arc<dyn Executor>,
}

impl Worker {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Spawn `work` on a named thread. When it finishes, `on_done`
    /// receives the outcome on the executor.
    pub fn spawn<F, D>(&self, name: &str, work: F, on_done: D) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
        D: FnOnce(Result<()>) + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = work();
                executor.execute(Box::new(move || on_done(result)));
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread::ThreadId;
    use std::time::Duration;

    use super::*;
    use crate::error::PeerError;

    #[test]
    fn work_runs_on_its_own_thread() {
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel::<ThreadId>();

        let worker = Worker::new(Arc::new(InlineExecutor));
        let handle = worker
            .spawn(
                "test-worker",
                move || {
                    tx.send(std::thread::current().id()).unwrap();
                    Ok(())
                },
                |_| {},
            )
            .unwrap();

        let worker_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker_thread, caller);
        handle.join().unwrap();
    }

    #[test]
    fn inline_executor_delivers_outcome_on_worker_thread() {
        let (tx, rx) = mpsc::channel::<(ThreadId, bool)>();
        let (work_tx, work_rx) = mpsc::channel::<ThreadId>();

        let worker = Worker::new(Arc::new(InlineExecutor));
        let handle = worker
            .spawn(
                "test-worker",
                move || {
                    work_tx.send(std::thread::current().id()).unwrap();
                    Ok(())
                },
                move |result| {
                    tx.send((std::thread::current().id(), result.is_ok()))
                        .unwrap();
                },
            )
            .unwrap();

        let work_thread = work_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (done_thread, ok) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(done_thread, work_thread);
        assert!(ok);
        handle.join().unwrap();
    }

    #[test]
    fn failure_outcome_is_delivered() {
        let (tx, rx) = mpsc::channel::<bool>();

        let worker = Worker::new(Arc::new(InlineExecutor));
        let handle = worker
            .spawn(
                "test-worker",
                || Err(PeerError::Handshake("boom".to_string())),
                move |result| {
                    tx.send(result.is_err()).unwrap();
                },
            )
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn queue_executor_runs_callbacks_on_one_thread_in_order() {
        let executor = Arc::new(QueueExecutor::new().unwrap());
        let (tx, rx) = mpsc::channel::<(ThreadId, u32)>();

        for i in 0..8 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                tx.send((std::thread::current().id(), i)).unwrap();
            }));
        }

        let mut callback_thread = None;
        for expected in 0..8 {
            let (thread, i) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            match callback_thread {
                None => callback_thread = Some(thread),
                Some(t) => assert_eq!(t, thread),
            }
        }
        assert_ne!(callback_thread.unwrap(), std::thread::current().id());
    }

    #[test]
    fn queue_executor_drop_joins_callback_thread() {
        let executor = QueueExecutor::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        executor.execute(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        drop(executor);
        assert!(ran.load(Ordering::SeqCst));
    }
}
