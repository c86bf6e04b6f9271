//! One-shot and periodic software timers.
//!
//! Each [`SoftTimer`] owns a worker thread that sleeps on a command channel
//! until its deadline passes, then runs the callback on that thread. The
//! thread is spawned on the first `start_*` call.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use gmf_core::{Error, Result};
use parking_lot::Mutex;

type Callback = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Once(Duration),
    Periodic(Duration),
    Stop,
}

struct Worker {
    tx: Sender<Command>,
    handle: JoinHandle<()>,
}

/// A restartable timer that calls back on its own thread.
pub struct SoftTimer {
    name: String,
    callback: Callback,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for SoftTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftTimer").field("name", &self.name).finish_non_exhaustive()
    }
}

impl SoftTimer {
    /// Timer that will run `callback` each time it expires.
    pub fn new(name: impl Into<String>, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
            worker: Mutex::new(None),
        }
    }

    /// Name used for the worker thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms the timer to fire once after `after`, replacing any pending
    /// deadline.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] if the worker thread cannot be started.
    pub fn start_once(&self, after: Duration) -> Result<()> {
        self.send(Command::Once(after))
    }

    /// Arms the timer to fire every `period`, replacing any pending deadline.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero period; [`Error::Fail`] if the worker
    /// thread cannot be started.
    pub fn start_periodic(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(Error::invalid_arg("timer period must be non-zero"));
        }
        self.send(Command::Periodic(period))
    }

    /// Disarms the timer. A callback already running is not interrupted.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.tx.send(Command::Stop);
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            let (tx, rx) = unbounded();
            let callback = Arc::clone(&self.callback);
            let handle = thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || run(&rx, &callback))
                .map_err(|e| Error::fail(format!("timer thread: {e}")))?;
            *worker = Some(Worker { tx, handle });
        }
        match worker.as_ref() {
            Some(w) => w.tx.send(cmd).map_err(|_| Error::fail("timer thread exited")),
            None => Err(Error::fail("timer thread missing")),
        }
    }

    fn worker_thread(&self) -> Option<ThreadId> {
        self.worker.lock().as_ref().map(|w| w.handle.thread().id())
    }
}

fn run(rx: &Receiver<Command>, callback: &Callback) {
    let mut deadline: Option<(Instant, Option<Duration>)> = None;
    loop {
        let cmd = match deadline {
            Some((at, period)) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    deadline = period.map(|p| (at + p, Some(p)));
                    callback();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };
        deadline = match cmd {
            Command::Once(after) => Some((Instant::now() + after, None)),
            Command::Periodic(period) => Some((Instant::now() + period, Some(period))),
            Command::Stop => None,
        };
    }
}

impl Drop for SoftTimer {
    fn drop(&mut self) {
        let own_thread = self.worker_thread() == Some(thread::current().id());
        if let Some(Worker { tx, handle }) = self.worker.lock().take() {
            drop(tx);
            // Dropped from inside its own callback: the loop exits on its own.
            if !own_thread {
                let _ = handle.join();
            }
        }
    }
}
