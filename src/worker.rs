//! Active-object workers: each task runs on its own thread with a
//! cooperative stop token and a start-once guard.

use log::{error, info};
use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker '{name}' is already running")]
    AlreadyRunning { name: &'static str },
    #[error("failed to spawn worker '{name}': {reason}")]
    Spawn { name: &'static str, reason: String },
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cooperative cancellation flag shared between a worker and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Raw flag, for registration with signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }

    /// Sleep up to `dur`, waking early once a stop is requested.
    /// Returns `true` if the caller should stop.
    pub fn sleep(&self, dur: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(10);
        let mut left = dur;
        while !left.is_zero() {
            if self.is_requested() {
                return true;
            }
            let step = left.min(SLICE);
            thread::sleep(step);
            left -= step;
        }
        self.is_requested()
    }
}

/// A unit of work driven by an [`ActiveWorker`].
///
/// Shared state lives inside the task behind its own locks, so the owner can
/// keep calling into it (`worker.task()`) while `run` loops on the worker thread.
pub trait Task: Send + Sync + 'static {
    type Config: Send + 'static;
    const NAME: &'static str;

    /// Loop until `stop` is requested. Returning `Err` ends this worker only.
    fn run(&self, config: Self::Config, stop: &StopToken) -> anyhow::Result<()>;
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ActiveWorker<T: Task> {
    task: Arc<T>,
    stop: StopToken,
    running: Arc<AtomicBool>,
    start_lock: Mutex<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Task> ActiveWorker<T> {
    pub fn new(task: T) -> Self {
        Self {
            task: Arc::new(task),
            stop: StopToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            start_lock: Mutex::new(()),
            handle: Mutex::new(None),
        }
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    /// Hand `config` to the task and begin its loop on a fresh thread.
    pub fn start(&self, config: T::Config) -> Result<(), WorkerError> {
        let _guard = lock(&self.start_lock);
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning { name: T::NAME });
        }

        // reap the previous run, its loop has already exited
        if let Some(old) = lock(&self.handle).take() {
            let _ = old.join();
        }
        self.stop.reset();

        let task = Arc::clone(&self.task);
        let stop = self.stop.clone();
        let running = RunningGuard(Arc::clone(&self.running));
        let spawned = thread::Builder::new()
            .name(T::NAME.to_string())
            .spawn(move || {
                let _running = running;
                info!("{}: started", T::NAME);
                match task.run(config, &stop) {
                    Ok(()) => info!("{}: stopped", T::NAME),
                    Err(e) => error!("{}: stopped on error: {e:#}", T::NAME),
                }
            });

        match spawned {
            Ok(h) => {
                *lock(&self.handle) = Some(h);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(WorkerError::Spawn {
                    name: T::NAME,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll until the loop has exited, then reap the thread.
    pub fn await_stopped(&self) {
        while self.is_running() {
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(h) = lock(&self.handle).take() {
            let _ = h.join();
        }
    }

    pub fn shutdown(&self) {
        self.request_stop();
        self.await_stopped();
    }
}

impl<T: Task> Drop for ActiveWorker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
