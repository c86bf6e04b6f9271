//! Pipeline: a linear chain of elements driven by one task.
//!
//! ```text
//!   in IO ──► [el 0] ──link──► [el 1] ──link──► … ──► [el n-1] ──► out IO
//! ```
//!
//! Adjacent elements talk through [`PortLink`]s. The pipeline registers an
//! open and a process job per ready element on its bound [`Task`], and close
//! jobs once the task reports it finished, stopped or failed. IOs are opened
//! when the task starts running and closed together with the close jobs.
//!
//! Elements queue their events; after each job the pipeline forwards format
//! reports to the next element that depends on them, registers jobs for
//! elements that just became ready, and passes events from the last element
//! to the user callback.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cap::MethodArgs;
use crate::data_bus::BusKind;
use crate::element::Element;
use crate::error::{Error, Result};
use crate::event::{EventKind, EventPacket, EventState, SoundInfo};
use crate::job::{JobStatus, JobTimes};
use crate::port::{Endpoint, Port, PortAttr, PortDir, PortIo, PortLink};
use crate::task::{Task, TaskHandle};

const JOB_OPEN: u16 = 1 << 0;
const JOB_PROCESS: u16 = 1 << 1;
const JOB_CLOSE: u16 = 1 << 2;

/// Receives pipeline events.
pub type PipelineEventCb = Arc<dyn Fn(&EventPacket) + Send + Sync>;

struct Shared {
    name: String,
    elements: Vec<Mutex<Element>>,
    in_io: Mutex<Option<Arc<dyn PortIo>>>,
    out_io: Mutex<Option<Arc<dyn PortIo>>>,
    task: Mutex<Option<TaskHandle>>,
    state: Mutex<EventState>,
    user_cb: Mutex<Option<PipelineEventCb>>,
    recipients: Mutex<Vec<Weak<Shared>>>,
}

impl Shared {
    fn last(&self) -> usize {
        self.elements.len() - 1
    }

    fn emit(&self, evt: &EventPacket) {
        let cb = self.user_cb.lock().clone();
        if let Some(cb) = cb {
            cb(evt);
        }
    }

    fn register_working_jobs(self: &Arc<Self>, idx: usize) -> Result<()> {
        let Some(task) = self.task.lock().clone() else {
            tracing::warn!(pipeline = %self.name, "no task to add jobs to");
            return Err(Error::not_support("pipeline has no task"));
        };
        let tag = {
            let mut el = self.elements[idx].lock();
            if el.state() != EventState::Initialized {
                tracing::debug!(pipeline = %self.name, el = %el.tag(), state = %el.state(), "element not ready");
                return Err(Error::NotReady(el.tag().to_owned()));
            }
            if el.core().job_mask() & (JOB_OPEN | JOB_PROCESS) != 0 {
                return Ok(());
            }
            el.core_mut().change_job_mask(JOB_OPEN | JOB_PROCESS);
            el.tag().to_owned()
        };
        tracing::debug!(pipeline = %self.name, el = %tag, "add open and process jobs");
        let shared = Arc::clone(self);
        task.register_ready_job(format!("{tag}-open"), JobTimes::Once, false, move |_| {
            shared.run_element(idx, Element::process_open)
        });
        let shared = Arc::clone(self);
        task.register_ready_job(format!("{tag}-proc"), JobTimes::Infinite, true, move |_| {
            shared.run_element(idx, Element::process_running)
        });
        Ok(())
    }

    fn register_close_jobs(self: &Arc<Self>, task: &TaskHandle) {
        for idx in 0..self.elements.len() {
            let tag = {
                let mut el = self.elements[idx].lock();
                el.core_mut().change_job_mask(JOB_CLOSE);
                el.tag().to_owned()
            };
            tracing::debug!(pipeline = %self.name, el = %tag, "add close job");
            let shared = Arc::clone(self);
            task.register_ready_job(format!("{tag}-close"), JobTimes::Once, true, move |_| {
                shared.run_element(idx, Element::process_close)
            });
        }
    }

    fn run_element(self: &Arc<Self>, idx: usize, job: fn(&mut Element) -> JobStatus) -> JobStatus {
        let (ret, events) = {
            let mut el = self.elements[idx].lock();
            let ret = job(&mut el);
            (ret, el.take_events())
        };
        self.dispatch(Some(idx), events);
        ret
    }

    /// Routes events raised by element `from`, or by an upstream pipeline
    /// when `from` is `None`.
    fn dispatch(self: &Arc<Self>, from: Option<usize>, events: Vec<EventPacket>) {
        for evt in events {
            match evt.kind {
                EventKind::ReportInfo => self.forward_info(from, &evt),
                EventKind::ChangeState => {
                    if from == Some(self.last()) {
                        self.emit(&evt);
                    }
                }
                EventKind::LoadingJob => {
                    tracing::warn!(pipeline = %self.name, from = %evt.from, "unexpected loading event from element");
                }
            }
        }
    }

    fn forward_info(self: &Arc<Self>, from: Option<usize>, evt: &EventPacket) {
        let start = from.map_or(0, |i| i + 1);
        let target = (start..self.elements.len()).find(|&j| self.elements[j].lock().core().config().dependency);
        match target {
            Some(j) => {
                let events = {
                    let mut el = self.elements[j].lock();
                    if let Err(e) = el.receive_event(evt) {
                        tracing::error!(pipeline = %self.name, el = %el.tag(), "event rejected: {e}");
                    }
                    el.take_events()
                };
                self.dispatch(Some(j), events);
            }
            None => {
                let recipients: Vec<Arc<Shared>> = self.recipients.lock().iter().filter_map(Weak::upgrade).collect();
                for other in recipients {
                    other.dispatch(None, vec![evt.clone()]);
                }
            }
        }

        let first_ready = (0..self.elements.len())
            .find(|&j| Some(j) != from && self.elements[j].lock().state() == EventState::Initialized)
            .unwrap_or(0);
        for j in first_ready..self.elements.len() {
            if self.register_working_jobs(j).is_err() {
                break;
            }
        }
        if from == Some(self.last()) {
            self.emit(evt);
        }
    }

    fn set_linked_state(&self, state: EventState) {
        for el in &self.elements {
            let mut el = el.lock();
            if el.state() == EventState::Initialized {
                el.set_state(state);
            }
        }
    }

    fn open_ios(&self) -> Result<()> {
        let in_io = self.in_io.lock().clone();
        if let Some(io) = in_io {
            io.open().inspect_err(|e| {
                tracing::error!(pipeline = %self.name, io = io.name(), "failed to open input: {e}");
            })?;
        }
        let out_io = self.out_io.lock().clone();
        if let Some(io) = out_io {
            io.open().inspect_err(|e| {
                tracing::error!(pipeline = %self.name, io = io.name(), "failed to open output: {e}");
            })?;
        }
        Ok(())
    }

    fn close_ios(&self) {
        let ios = [self.in_io.lock().clone(), self.out_io.lock().clone()];
        for io in ios.into_iter().flatten() {
            if let Err(e) = io.close() {
                tracing::warn!(pipeline = %self.name, io = io.name(), "close failed: {e}");
            }
        }
    }

    fn on_task_event(self: &Arc<Self>, task: &TaskHandle, evt: &EventPacket) -> Result<()> {
        tracing::debug!(pipeline = %self.name, kind = ?evt.kind, state = %evt.state, "task event");
        match evt.kind {
            EventKind::LoadingJob => {
                if evt.state.is_terminal() {
                    self.register_close_jobs(task);
                    self.close_ios();
                }
                Ok(())
            }
            EventKind::ChangeState => {
                let mut ret = Ok(());
                let state = match evt.state {
                    EventState::Running if task.state() != EventState::Paused => {
                        ret = self.open_ios();
                        if ret.is_ok() { EventState::Opening } else { EventState::Error }
                    }
                    EventState::Running
                    | EventState::Paused
                    | EventState::Stopped
                    | EventState::Finished
                    | EventState::Error => evt.state,
                    _ => return Ok(()),
                };
                self.set_linked_state(state);
                *self.state.lock() = state;
                self.emit(&EventPacket::state(self.name.clone(), EventKind::ChangeState, state));
                ret
            }
            EventKind::ReportInfo => {
                tracing::warn!(pipeline = %self.name, "unexpected report from task");
                Ok(())
            }
        }
    }
}

/// A chain of elements with optional input and output IOs.
pub struct Pipeline {
    shared: Arc<Shared>,
    task: Option<Task>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.shared.name)
            .field("elements", &self.element_tags())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Links `elements` in order between the given IOs.
    ///
    /// The last element is marked as the end of the chain.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for an empty chain; port registration errors
    /// from the elements.
    pub fn new(
        name: impl Into<String>,
        elements: Vec<Element>,
        in_io: Option<Arc<dyn PortIo>>,
        out_io: Option<Arc<dyn PortIo>>,
    ) -> Result<Self> {
        let name = name.into();
        if elements.is_empty() {
            return Err(Error::invalid_arg("pipeline needs at least one element"));
        }
        let count = elements.len();
        let mut linked = Vec::with_capacity(count);
        let mut upstream: Option<Arc<PortLink>> = None;
        for (i, mut el) in elements.into_iter().enumerate() {
            match upstream.take() {
                Some(link) => el.register_in_port(Port::new(PortDir::In, BusKind::Byte, Endpoint::Link(link), PortAttr::default()))?,
                None => {
                    if let Some(io) = &in_io {
                        el.register_in_port(Port::from_io(PortDir::In, Arc::clone(io), PortAttr::default()))?;
                    }
                }
            }
            if i + 1 < count {
                let link = PortLink::new();
                el.register_out_port(Port::new(PortDir::Out, BusKind::Byte, Endpoint::Link(Arc::clone(&link)), PortAttr::default()))?;
                upstream = Some(link);
            } else {
                if let Some(io) = &out_io {
                    el.register_out_port(Port::from_io(PortDir::Out, Arc::clone(io), PortAttr::default()))?;
                }
                el.set_last(true);
            }
            linked.push(Mutex::new(el));
        }
        tracing::debug!(pipeline = %name, elements = count, "pipeline created");
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                elements: linked,
                in_io: Mutex::new(in_io),
                out_io: Mutex::new(out_io),
                task: Mutex::new(None),
                state: Mutex::new(EventState::None),
                user_cb: Mutex::new(None),
                recipients: Mutex::new(Vec::new()),
            }),
            task: None,
        })
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Last state reported by the bound task.
    pub fn state(&self) -> EventState {
        *self.shared.state.lock()
    }

    /// Element tags in chain order.
    pub fn element_tags(&self) -> Vec<String> {
        self.shared.elements.iter().map(|el| el.lock().tag().to_owned()).collect()
    }

    /// Runs `f` on the element tagged `tag`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no element has that tag.
    pub fn with_element<R>(&self, tag: &str, f: impl FnOnce(&mut Element) -> R) -> Result<R> {
        for el in &self.shared.elements {
            let mut el = el.lock();
            if el.tag() == tag {
                return Ok(f(&mut el));
            }
        }
        Err(Error::not_found(format!("element {tag}")))
    }

    /// Calls a method on the element tagged `tag`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown element; method errors otherwise.
    pub fn exec_method(&self, tag: &str, method: &str, args: &MethodArgs) -> Result<()> {
        self.with_element(tag, |el| el.exec_method(method, args))?
    }

    /// Installs the user event callback.
    pub fn set_event(&self, cb: PipelineEventCb) {
        *self.shared.user_cb.lock() = Some(cb);
    }

    /// Binds the task that will run this pipeline's jobs.
    pub fn bind_task(&mut self, task: Task) {
        *self.shared.task.lock() = Some(task.handle());
        let shared = Arc::clone(&self.shared);
        task.set_event_func(Arc::new(move |handle, evt| shared.on_task_event(handle, evt)));
        self.task = Some(task);
    }

    /// The bound task.
    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    fn bound_task(&self) -> Result<&Task> {
        self.task
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("pipeline {} has no task", self.shared.name)))
    }

    /// Registers open and process jobs for every ready element.
    ///
    /// Registration stops at the first element that is not ready; it is
    /// picked up later when its upstream reports the stream format.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] without a bound task.
    pub fn loading_jobs(&self) -> Result<()> {
        self.bound_task()?;
        for idx in 0..self.shared.elements.len() {
            if let Err(e) = self.shared.register_working_jobs(idx) {
                if idx == 0 {
                    tracing::warn!(pipeline = %self.shared.name, "first element not ready: {e}");
                }
                break;
            }
        }
        Ok(())
    }

    /// Starts the bound task.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] without a task; task errors.
    pub fn run(&self) -> Result<()> {
        self.bound_task()?.run()
    }

    /// Stops the bound task.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] without a task; task errors.
    pub fn stop(&self) -> Result<()> {
        self.bound_task()?.stop()
    }

    /// Pauses the bound task.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] without a task; task errors.
    pub fn pause(&self) -> Result<()> {
        self.bound_task()?.pause()
    }

    /// Resumes the bound task.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] without a task; task errors.
    pub fn resume(&self) -> Result<()> {
        self.bound_task()?.resume()
    }

    /// Returns the pipeline and its elements to their initial state so
    /// jobs can be loaded again.
    pub fn reset(&self) {
        *self.shared.state.lock() = EventState::None;
        if let Some(task) = &self.task {
            task.reset();
        }
        for el in &self.shared.elements {
            let mut el = el.lock();
            el.reset_state();
            el.reset_port();
            el.core_mut().set_job_mask(0);
            tracing::debug!(pipeline = %self.shared.name, el = %el.tag(), "reset");
        }
    }

    /// Input IO.
    pub fn in_io(&self) -> Option<Arc<dyn PortIo>> {
        self.shared.in_io.lock().clone()
    }

    /// Output IO.
    pub fn out_io(&self) -> Option<Arc<dyn PortIo>> {
        self.shared.out_io.lock().clone()
    }

    /// Forwards format reports from this pipeline's last element to the
    /// head of `downstream`.
    pub fn connect(&self, downstream: &Pipeline) {
        self.shared.recipients.lock().push(Arc::downgrade(&downstream.shared));
    }

    /// Announces the input stream format to the elements, as an upstream
    /// pipeline would.
    pub fn report_info(&self, info: SoundInfo) {
        self.shared
            .dispatch(None, vec![EventPacket::info(self.shared.name.clone(), info)]);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shared.task.lock().take();
        // Joins the worker and drops jobs that hold the shared state.
        self.task.take();
    }
}
