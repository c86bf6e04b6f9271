//! Task: a worker thread that runs a list of jobs under a state machine.
//!
//! A [`Task`] owns one OS thread. Jobs are registered through a cloneable
//! [`TaskHandle`], usually by the pipeline bound to the task. Once jobs are
//! present and [`Task::run`] is requested, the worker walks the job list and
//! steers itself by each job's [`JobStatus`]:
//!
//! | Status | Effect |
//! |--------|--------|
//! | `Ok` | Move on. `Once` jobs are removed. At the end of the list, restart from the top of the job stack. |
//! | `Continue` | Restart from the first job. |
//! | `Truncate` | Remember this job on the stack, run downstream jobs, come back. |
//! | `Done` | Remove the job. When none follow, raise a `Finished` loading event. |
//! | `Fail` | Drop every job and raise an `Error` loading event. |
//!
//! Loading events give the delegate (see [`Task::set_event_func`]) a chance
//! to register final jobs, such as element close jobs, before the worker
//! goes idle.
//!
//! # Control
//!
//! [`run`](Task::run), [`stop`](Task::stop), [`pause`](Task::pause) and
//! [`resume`](Task::resume) post a request and block until the worker
//! acknowledges it or the sync timeout (2 s by default) expires. Stop and
//! pause take effect between jobs, never inside one.
//!
//! # Locking
//!
//! The control block is always locked before the job list, never while the
//! job list is held. A job's closure is taken out of the list while it runs,
//! so jobs may register further jobs on the same task.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::event::{EventKind, EventPacket, EventState};
use crate::job::{JobStack, JobStatus, JobTimes};

const RUN_BIT: u8 = 1 << 0;
const PAUSE_BIT: u8 = 1 << 1;
const RESUME_BIT: u8 = 1 << 2;
const STOP_BIT: u8 = 1 << 3;
const EXIT_BIT: u8 = 1 << 4;

/// Default time an API call waits for the worker to acknowledge.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(2000);

/// A job body.
pub type JobFn = Box<dyn FnMut(&TaskHandle) -> JobStatus + Send>;

/// Receives task state changes and loading events.
///
/// Called on the worker thread with no task lock held. Returning an error
/// from a state-change notification vetoes the change.
pub type TaskDelegate = Arc<dyn Fn(&TaskHandle, &EventPacket) -> Result<()> + Send + Sync>;

/// Task construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    /// Thread and event name.
    pub name: String,
    /// Worker stack size; `None` uses the platform default.
    pub stack_size: Option<usize>,
    /// How long control calls wait for the worker.
    pub sync_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "gmf_task".to_owned(),
            stack_size: None,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

struct Job {
    id: u64,
    label: String,
    times: JobTimes,
    func: Option<JobFn>,
}

#[derive(Default)]
struct JobList {
    jobs: Vec<Job>,
    stack: JobStack,
    next_id: u64,
}

impl JobList {
    fn first(&self) -> Option<u64> {
        self.jobs.first().map(|j| j.id)
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    fn next_after(&self, id: u64) -> Option<u64> {
        self.position(id)
            .and_then(|pos| self.jobs.get(pos + 1))
            .map(|j| j.id)
    }

    fn remove(&mut self, id: u64) {
        if let Some(pos) = self.position(id) {
            self.jobs.remove(pos);
        }
    }

    fn clear(&mut self) {
        self.jobs.clear();
        self.stack.clear();
    }
}

#[derive(Default)]
struct Control {
    state: EventState,
    running_req: bool,
    pause: bool,
    stop: bool,
    resume_signal: bool,
    destroy: bool,
    bits: u8,
    prepare_err: Option<Error>,
    sync_timeout: Duration,
}

struct TaskInner {
    name: String,
    api: Mutex<()>,
    ctl: Mutex<Control>,
    cv: Condvar,
    jobs: Mutex<JobList>,
    delegate: Mutex<Option<TaskDelegate>>,
}

/// Shared handle used by jobs and delegates to reach their task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    /// Task name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current task state.
    pub fn state(&self) -> EventState {
        self.inner.ctl.lock().state
    }

    /// Appends a job to the task.
    ///
    /// The first `Infinite` job registered on an empty stack becomes the
    /// restart point. With `done` set, a waiting worker is woken so a pending
    /// run request can start.
    pub fn register_ready_job<F>(&self, label: impl Into<String>, times: JobTimes, done: bool, func: F)
    where
        F: FnMut(&TaskHandle) -> JobStatus + Send + 'static,
    {
        let label = label.into();
        {
            let mut list = self.inner.jobs.lock();
            let id = list.next_id;
            list.next_id += 1;
            if times == JobTimes::Infinite && list.stack.is_empty() {
                list.stack.push(id);
            }
            tracing::debug!(task = %self.inner.name, label = %label, count = list.jobs.len() + 1, "register job");
            list.jobs.push(Job {
                id,
                label,
                times,
                func: Some(Box::new(func)),
            });
        }
        if done {
            let _ctl = self.inner.ctl.lock();
            self.inner.cv.notify_all();
        }
    }

    /// Number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.inner.jobs.lock().jobs.len()
    }

    /// Labels of the registered jobs, in run order.
    pub fn job_labels(&self) -> Vec<String> {
        self.inner.jobs.lock().jobs.iter().map(|j| j.label.clone()).collect()
    }

    fn notify(&self, kind: EventKind, state: EventState) -> Result<()> {
        let delegate = self.inner.delegate.lock().clone();
        match delegate {
            Some(delegate) => delegate(self, &EventPacket::state(self.inner.name.clone(), kind, state)),
            None => Ok(()),
        }
    }

    /// Notifies first, then stores the state, so the delegate still sees the
    /// previous one.
    fn change_state(&self, kind: EventKind, new: EventState) -> Result<()> {
        if self.state() == new {
            return Ok(());
        }
        self.notify(kind, new)?;
        self.inner.ctl.lock().state = new;
        Ok(())
    }

    fn loading_job(&self, new: EventState) {
        if let Err(e) = self.change_state(EventKind::LoadingJob, new) {
            tracing::warn!(task = %self.inner.name, state = %new, "loading event rejected: {e}");
        }
    }

    fn set_bits(&self, bits: u8) {
        let mut ctl = self.inner.ctl.lock();
        ctl.bits |= bits;
        self.inner.cv.notify_all();
    }

    fn delete_jobs(&self) {
        self.inner.jobs.lock().clear();
    }

    fn run_job(&self, id: u64) -> Option<(JobStatus, JobTimes)> {
        let (mut func, times, label) = {
            let mut list = self.inner.jobs.lock();
            let pos = list.position(id)?;
            let job = &mut list.jobs[pos];
            (job.func.take()?, job.times, job.label.clone())
        };
        tracing::trace!(task = %self.inner.name, job = %label, "running");
        let ret = func(self);
        tracing::trace!(task = %self.inner.name, job = %label, ret = ret.as_str(), "job returned");
        let mut list = self.inner.jobs.lock();
        if let Some(pos) = list.position(id) {
            list.jobs[pos].func = Some(func);
        }
        Some((ret, times))
    }

    fn process_jobs(&self) {
        let mut worker = self.inner.jobs.lock().first();
        if worker.is_none() {
            tracing::error!(task = %self.inner.name, "job list is empty");
            return;
        }
        let mut is_stop = false;
        while let Some(id) = worker {
            let Some((ret, times)) = self.run_job(id) else {
                tracing::error!(task = %self.inner.name, id, "job vanished while scheduled");
                break;
            };
            match ret {
                JobStatus::Continue => {
                    worker = self.inner.jobs.lock().first();
                    continue;
                }
                JobStatus::Truncate => {
                    tracing::debug!(task = %self.inner.name, id, "job truncated");
                    self.inner.jobs.lock().stack.push(id);
                }
                JobStatus::Done => {
                    let next = {
                        let mut list = self.inner.jobs.lock();
                        let next = list.next_after(id);
                        list.remove(id);
                        list.stack.remove(id);
                        next
                    };
                    worker = next;
                    if worker.is_none() {
                        tracing::debug!(task = %self.inner.name, "all jobs finished");
                        self.inner.jobs.lock().stack.clear();
                        self.loading_job(EventState::Finished);
                        worker = self.inner.jobs.lock().first();
                    }
                    continue;
                }
                JobStatus::Fail => {
                    if self.state() != EventState::Stopped {
                        tracing::error!(task = %self.inner.name, id, state = %self.state(), "job failed");
                        self.delete_jobs();
                        self.loading_job(EventState::Error);
                        worker = self.inner.jobs.lock().first();
                        is_stop = true;
                        continue;
                    }
                }
                JobStatus::Ok => {}
            }

            let pause = std::mem::take(&mut self.inner.ctl.lock().pause);
            if pause && self.state() != EventState::Error {
                tracing::info!(task = %self.inner.name, "pause");
                if let Err(e) = self.change_state(EventKind::ChangeState, EventState::Paused) {
                    tracing::warn!(task = %self.inner.name, "pause notification failed: {e}");
                }
                {
                    let mut ctl = self.inner.ctl.lock();
                    ctl.bits |= PAUSE_BIT;
                    self.inner.cv.notify_all();
                    while !ctl.resume_signal {
                        self.inner.cv.wait(&mut ctl);
                    }
                    ctl.resume_signal = false;
                }
                tracing::info!(task = %self.inner.name, "resume");
                if let Err(e) = self.change_state(EventKind::ChangeState, EventState::Running) {
                    tracing::warn!(task = %self.inner.name, "resume notification failed: {e}");
                }
                self.set_bits(RESUME_BIT);
            }

            let stop = {
                let mut ctl = self.inner.ctl.lock();
                let stop = ctl.stop && ctl.state != EventState::Error;
                if stop {
                    ctl.stop = false;
                }
                stop
            };
            if stop {
                tracing::debug!(task = %self.inner.name, "stop");
                self.delete_jobs();
                self.loading_job(EventState::Stopped);
                worker = self.inner.jobs.lock().first();
                is_stop = true;
                continue;
            }

            let mut list = self.inner.jobs.lock();
            let next = list.next_after(id);
            if times == JobTimes::Once {
                list.remove(id);
            }
            worker = next;
            if worker.is_none() && !list.stack.is_empty() {
                worker = list.stack.pop();
            }
        }

        let state = self.state();
        tracing::debug!(task = %self.inner.name, state = %state, stop = is_stop, "worker idle");
        if let Err(e) = self.notify(EventKind::ChangeState, state) {
            tracing::warn!(task = %self.inner.name, "final state notification failed: {e}");
        }
        let mut ctl = self.inner.ctl.lock();
        // Requests that arrived after the last job was checked are answered here.
        if is_stop || ctl.stop {
            ctl.stop = false;
            ctl.bits |= STOP_BIT;
        }
        if ctl.pause {
            ctl.pause = false;
            ctl.bits |= PAUSE_BIT;
        }
        self.inner.cv.notify_all();
    }

    fn worker_loop(self) {
        loop {
            {
                let mut ctl = self.inner.ctl.lock();
                loop {
                    if ctl.destroy {
                        drop(ctl);
                        self.exit();
                        return;
                    }
                    if ctl.running_req && !self.inner.jobs.lock().jobs.is_empty() {
                        break;
                    }
                    self.inner.cv.wait(&mut ctl);
                }
            }
            let ret = self.change_state(EventKind::ChangeState, EventState::Running);
            {
                let mut ctl = self.inner.ctl.lock();
                ctl.running_req = false;
                ctl.bits |= RUN_BIT;
                if let Err(e) = &ret {
                    tracing::error!(task = %self.inner.name, "failed to prepare: {e}");
                    ctl.prepare_err = Some(e.clone());
                }
                self.inner.cv.notify_all();
            }
            if ret.is_ok() {
                self.process_jobs();
            }
        }
    }

    fn exit(&self) {
        let mut ctl = self.inner.ctl.lock();
        ctl.state = EventState::None;
        ctl.bits |= EXIT_BIT;
        self.inner.cv.notify_all();
        tracing::debug!(task = %self.inner.name, "worker exited");
    }

    /// Waits for `bit` and consumes it.
    fn wait_bit(&self, bit: u8, what: &str) -> Result<()> {
        let mut ctl = self.inner.ctl.lock();
        let deadline = Instant::now() + ctl.sync_timeout;
        while ctl.bits & bit == 0 {
            if self.inner.cv.wait_until(&mut ctl, deadline).timed_out() && ctl.bits & bit == 0 {
                tracing::error!(task = %self.inner.name, "{what} timeout");
                return Err(Error::Timeout(format!("task {} to {what}", self.inner.name)));
            }
        }
        ctl.bits &= !bit;
        Ok(())
    }
}

/// A worker thread with its job list.
pub struct Task {
    handle: TaskHandle,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl Task {
    /// Spawns the worker thread in the `Initialized` state.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] if the thread cannot be spawned.
    pub fn new(config: TaskConfig) -> Result<Self> {
        let inner = Arc::new(TaskInner {
            name: config.name.clone(),
            api: Mutex::new(()),
            ctl: Mutex::new(Control {
                state: EventState::Initialized,
                sync_timeout: config.sync_timeout,
                ..Control::default()
            }),
            cv: Condvar::new(),
            jobs: Mutex::new(JobList::default()),
            delegate: Mutex::new(None),
        });
        let handle = TaskHandle { inner };
        let mut builder = std::thread::Builder::new().name(config.name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        let worker = handle.clone();
        let thread = builder
            .spawn(move || worker.worker_loop())
            .map_err(|e| Error::fail(format!("spawn task {}: {e}", config.name)))?;
        tracing::debug!(task = %config.name, "task created");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Shared handle for registering jobs.
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Task name.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Current state.
    pub fn state(&self) -> EventState {
        self.handle.state()
    }

    /// Installs the delegate that hears state changes and loading events.
    pub fn set_event_func(&self, delegate: TaskDelegate) {
        *self.handle.inner.delegate.lock() = Some(delegate);
    }

    /// Changes how long control calls wait for the worker.
    pub fn set_timeout(&self, timeout: Duration) {
        self.handle.inner.ctl.lock().sync_timeout = timeout;
    }

    /// Starts processing the registered jobs.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupport`] while running or paused.
    /// - [`Error::Timeout`] if the worker does not start in time, for
    ///   example because no jobs are registered.
    /// - The delegate's error if it vetoed the transition to running.
    pub fn run(&self) -> Result<()> {
        let _api = self.handle.inner.api.lock();
        {
            let mut ctl = self.handle.inner.ctl.lock();
            tracing::debug!(task = %self.handle.inner.name, state = %ctl.state, "run");
            if matches!(ctl.state, EventState::Paused | EventState::Running) {
                tracing::warn!(task = %self.handle.inner.name, state = %ctl.state, "can't run");
                return Err(Error::not_support(format!("run while {}", ctl.state)));
            }
            ctl.bits &= !RUN_BIT;
            ctl.prepare_err = None;
            ctl.pause = false;
            ctl.stop = false;
            ctl.running_req = true;
            self.handle.inner.cv.notify_all();
        }
        self.handle.wait_bit(RUN_BIT, "run")?;
        match self.handle.inner.ctl.lock().prepare_err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops processing between jobs and waits until the worker has dropped
    /// its jobs. Succeeds immediately if the task is not running or paused.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the worker does not acknowledge in time.
    pub fn stop(&self) -> Result<()> {
        let _api = self.handle.inner.api.lock();
        {
            let mut ctl = self.handle.inner.ctl.lock();
            tracing::debug!(task = %self.handle.inner.name, state = %ctl.state, "stop");
            if !matches!(ctl.state, EventState::Running | EventState::Paused) {
                tracing::debug!(task = %self.handle.inner.name, state = %ctl.state, "already stopped");
                return Ok(());
            }
            ctl.bits &= !STOP_BIT;
            ctl.stop = true;
            if ctl.state == EventState::Paused {
                ctl.resume_signal = true;
            }
            self.handle.inner.cv.notify_all();
        }
        self.handle.wait_bit(STOP_BIT, "stop")
    }

    /// Suspends processing after the current job.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupport`] unless running or already idle.
    /// - [`Error::Timeout`] if the worker does not acknowledge in time.
    pub fn pause(&self) -> Result<()> {
        let _api = self.handle.inner.api.lock();
        {
            let mut ctl = self.handle.inner.ctl.lock();
            tracing::debug!(task = %self.handle.inner.name, state = %ctl.state, "pause");
            if matches!(
                ctl.state,
                EventState::Stopped | EventState::Paused | EventState::Finished | EventState::Error
            ) {
                return Ok(());
            }
            if ctl.state != EventState::Running {
                tracing::warn!(task = %self.handle.inner.name, state = %ctl.state, "can't pause");
                return Err(Error::not_support(format!("pause while {}", ctl.state)));
            }
            ctl.bits &= !PAUSE_BIT;
            ctl.pause = true;
        }
        self.handle.wait_bit(PAUSE_BIT, "pause")
    }

    /// Continues a paused task.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupport`] unless paused.
    /// - [`Error::Timeout`] if the worker does not acknowledge in time.
    pub fn resume(&self) -> Result<()> {
        let _api = self.handle.inner.api.lock();
        {
            let mut ctl = self.handle.inner.ctl.lock();
            tracing::debug!(task = %self.handle.inner.name, state = %ctl.state, "resume");
            if ctl.state != EventState::Paused {
                tracing::warn!(task = %self.handle.inner.name, state = %ctl.state, "can't resume");
                return Err(Error::not_support(format!("resume while {}", ctl.state)));
            }
            ctl.bits &= !RESUME_BIT;
            ctl.pause = false;
            ctl.resume_signal = true;
            self.handle.inner.cv.notify_all();
        }
        self.handle.wait_bit(RESUME_BIT, "resume")
    }

    /// Returns the task to `Initialized` so it can run again.
    pub fn reset(&self) {
        self.handle.inner.ctl.lock().state = EventState::Initialized;
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        {
            let mut ctl = self.handle.inner.ctl.lock();
            if matches!(ctl.state, EventState::Running | EventState::Paused) {
                ctl.stop = true;
            }
            if ctl.state == EventState::Paused {
                ctl.resume_signal = true;
            }
            ctl.destroy = true;
            self.handle.inner.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(task = %self.handle.inner.name, "worker panicked");
            }
        }
        self.handle.delete_jobs();
        *self.handle.inner.delegate.lock() = None;
    }
}
