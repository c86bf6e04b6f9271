//! The AFE pipeline element.
//!
//! Input payloads are copied into a private ring that the manager's feed
//! thread reads from; processed mono frames come back on the fetch thread,
//! pass through the wake and voice command monitors and land in an output
//! ring. The element emits output only once more than `delay_samples` are
//! buffered, keeping a margin for late results.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, unbounded};
use gmf_core::{
    ArgType, Capability, DataBus, Element, ElementConfig, ElementCore, ElementOps, Error, IoError, IoResult, JobStatus,
    Method, MethodArgs, Payload, Port, Result, SoundInfo, Wait, new_ringbuf,
};
use parking_lot::Mutex;

use super::engine::{Feature, FeatureControl, FetchResult, Features};
use super::event::{AfeEvent, EventSink};
use super::manager::AfeManager;
use super::state::{WakeMachine, WakeState, WakeTimeouts};
use super::vcmd::{
    CommandRecognizer, DEFAULT_VCMD_TIMEOUT, RecognizerFactory, SilentRecognizer, VcmdDetector, effective_timeout,
};

/// Method toggling voice command detection.
pub const METHOD_START_VCMD_DET: &str = "start_vcmd_det";
/// Argument of [`METHOD_START_VCMD_DET`]: non-zero to begin, zero to cancel.
pub const ARG_VCMD_DET_EN: &str = "enable";

/// AFE element settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AfeConfig {
    /// Output lag kept in the output ring, in samples.
    pub delay_samples: usize,
    /// Wake window lengths.
    pub timeouts: WakeTimeouts,
    /// Whether voice command detection is available.
    pub vcmd_detect: bool,
    /// Voice command timeout; zero selects the default.
    pub vcmd_timeout: Duration,
    /// Voice command model language.
    pub language: String,
    /// Nominal payload size.
    pub data_size: usize,
}

impl Default for AfeConfig {
    fn default() -> Self {
        Self {
            delay_samples: 2048,
            timeouts: WakeTimeouts::default(),
            vcmd_detect: false,
            vcmd_timeout: DEFAULT_VCMD_TIMEOUT,
            language: "cn".to_owned(),
            data_size: 2048,
        }
    }
}

type UserCb = Box<dyn Fn(&AfeEvent) + Send + Sync>;

/// State shared by the element, its handles and its callbacks.
struct Control {
    event_cb: ArcSwapOption<UserCb>,
    machine: Mutex<Option<Arc<WakeMachine>>>,
    vcmd: Mutex<Option<Arc<VcmdDetector>>>,
    vcmd_enabled: bool,
}

impl Control {
    fn emit(&self, event: &AfeEvent) {
        if let Some(cb) = self.event_cb.load_full() {
            cb(event);
        }
    }

    fn machine(&self) -> Result<Arc<WakeMachine>> {
        self.machine
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("wake state machine not running"))
    }

    fn vcmd(&self) -> Result<Arc<VcmdDetector>> {
        if !self.vcmd_enabled {
            return Err(Error::invalid_state("voice command detection disabled"));
        }
        self.vcmd
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("AFE element not opened"))
    }
}

/// Controls an [`AfeElement`] after it has been moved into a pipeline.
#[derive(Clone)]
pub struct AfeHandle {
    control: Arc<Control>,
}

impl std::fmt::Debug for AfeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeHandle").field("wake_state", &self.wake_state()).finish()
    }
}

impl AfeHandle {
    /// Installs or removes the event callback.
    pub fn set_event_cb(&self, cb: Option<UserCb>) {
        self.control.event_cb.store(cb.map(Arc::new));
    }

    /// Routes events into a channel, replacing any callback.
    pub fn event_channel(&self) -> Receiver<AfeEvent> {
        let (tx, rx) = unbounded();
        self.set_event_cb(Some(Box::new(move |ev: &AfeEvent| {
            let _ = tx.send(ev.clone());
        })));
        rx
    }

    /// Holds the wake window open, or releases it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the state machine is not running.
    pub fn keep_awake(&self, enable: bool) -> Result<()> {
        self.control.machine()?.set_keep_wake(enable);
        Ok(())
    }

    /// Wakes the system without a wake word.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the state machine is not running.
    pub fn trigger_wakeup(&self) -> Result<()> {
        self.control.machine()?.trigger_wakeup();
        Ok(())
    }

    /// Arms voice command detection.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if detection is disabled or the element is
    /// not open.
    pub fn vcmd_detection_begin(&self) -> Result<()> {
        self.control.vcmd()?.begin();
        Ok(())
    }

    /// Disarms voice command detection.
    ///
    /// # Errors
    ///
    /// Same as [`vcmd_detection_begin`](Self::vcmd_detection_begin).
    pub fn vcmd_detection_cancel(&self) -> Result<()> {
        self.control.vcmd()?.cancel();
        Ok(())
    }

    /// State of the wake machine, if running.
    pub fn wake_state(&self) -> Option<WakeState> {
        self.control.machine.lock().as_ref().map(|m| m.state())
    }
}

/// Feature access that does not keep the manager alive.
struct ManagerRef(Weak<AfeManager>);

impl FeatureControl for ManagerRef {
    fn features(&self) -> Features {
        self.0.upgrade().map(|m| m.features()).unwrap_or_default()
    }

    fn enable_feature(&self, feature: Feature, enable: bool) -> Result<()> {
        match self.0.upgrade() {
            Some(m) => m.enable_features(feature, enable),
            None => Err(Error::invalid_state("AFE manager dropped")),
        }
    }
}

struct Session {
    in_bus: Arc<dyn DataBus>,
    out_bus: Arc<dyn DataBus>,
    in_size: usize,
}

/// Wake word, voice activity and voice command front end.
pub struct AfeElement {
    manager: Arc<AfeManager>,
    config: AfeConfig,
    recognizers: Arc<RecognizerFactory>,
    control: Arc<Control>,
    session: Option<Session>,
    origin_vad: bool,
}

impl std::fmt::Debug for AfeElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeElement")
            .field("config", &self.config)
            .field("open", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl AfeElement {
    /// Element driving `manager`. Voice commands use a recogniser that
    /// never matches until [`with_recognizer`](Self::with_recognizer).
    pub fn new(manager: Arc<AfeManager>, config: AfeConfig) -> Self {
        let control = Arc::new(Control {
            event_cb: ArcSwapOption::empty(),
            machine: Mutex::new(None),
            vcmd: Mutex::new(None),
            vcmd_enabled: config.vcmd_detect,
        });
        Self {
            manager,
            config,
            recognizers: Arc::new(|_: &str, timeout: Duration| {
                Ok(Box::new(SilentRecognizer::new(timeout)) as Box<dyn CommandRecognizer>)
            }),
            control,
            session: None,
            origin_vad: false,
        }
    }

    /// Replaces the voice command recogniser factory.
    #[must_use]
    pub fn with_recognizer(mut self, factory: Arc<RecognizerFactory>) -> Self {
        self.recognizers = factory;
        self
    }

    /// Handle for events and wake control.
    pub fn handle(&self) -> AfeHandle {
        AfeHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Wraps into a pipeline [`Element`].
    pub fn into_element(self, tag: &str) -> Element {
        let config = ElementConfig {
            data_size: self.config.data_size,
            alignment: 16,
            ..ElementConfig::default()
        };
        Element::new(tag, config, Box::new(self))
    }

    fn sink(&self) -> EventSink {
        let control = Arc::downgrade(&self.control);
        Arc::new(move |ev: &AfeEvent| {
            if let Some(control) = control.upgrade() {
                control.emit(ev);
            }
        })
    }

    fn start_monitors(&mut self) -> Result<()> {
        let feat = self.manager.features();
        if feat.wakeup || feat.vad {
            // VAD parked until wake-up; remembered across reopen
            if feat.wakeup && feat.vad {
                self.manager.enable_features(Feature::Vad, false)?;
                self.origin_vad = true;
            }
            let features: Arc<dyn FeatureControl> = Arc::new(ManagerRef(Arc::downgrade(&self.manager)));
            let machine = WakeMachine::new(features, self.config.timeouts, self.origin_vad, self.sink());
            *self.control.machine.lock() = Some(machine);
        }
        if self.config.vcmd_detect {
            let timeout = effective_timeout(self.config.vcmd_timeout);
            let recognizer = (self.recognizers)(&self.config.language, timeout)?;
            *self.control.vcmd.lock() = Some(Arc::new(VcmdDetector::new(recognizer, self.sink())));
        }
        Ok(())
    }

    fn connect_manager(&self, session: &Session) {
        let in_bus = Arc::clone(&session.in_bus);
        self.manager
            .set_result_cb(Some(Box::new(result_proc(&self.control, &self.manager, &session.out_bus))));
        self.manager.set_read_cb(Some(Box::new(move |buf: &mut [u8], wait: Duration| {
            tracing::trace!(len = buf.len(), "feed");
            let (n, _) = in_bus.read(buf, Wait::For(wait))?;
            Ok(n)
        })));
    }
}

/// Builds the fetch-thread callback: monitors first, then the output ring,
/// dropping the oldest bytes when it is full.
fn result_proc(
    control: &Arc<Control>,
    manager: &Arc<AfeManager>,
    out_bus: &Arc<dyn DataBus>,
) -> impl Fn(&FetchResult) + Send + Sync + 'static {
    let control = Arc::downgrade(control);
    let manager = Arc::downgrade(manager);
    let out_bus = Arc::clone(out_bus);
    move |result: &FetchResult| {
        let len = result.data.len();
        if len == 0 {
            return;
        }
        let Some(control) = control.upgrade() else {
            return;
        };
        let feat = manager.upgrade().map(|m| m.features()).unwrap_or_default();
        if feat.wakeup || feat.vad {
            if let Some(machine) = control.machine.lock().clone() {
                machine.monitor(result);
            }
        }
        if control.vcmd_enabled {
            if let Some(vcmd) = control.vcmd.lock().clone() {
                vcmd.monitor(result);
            }
        }

        let available = out_bus.available();
        if available < len {
            let mut scratch = vec![0u8; len - available];
            if let Err(e) = out_bus.read(&mut scratch, Wait::Immediate) {
                tracing::error!("dropping stale output failed: {e}");
                return;
            }
        }
        match out_bus.write(&result.data, false, Wait::ms(100)) {
            Ok(()) => {}
            Err(IoError::Abort) => tracing::debug!("output ring aborted"),
            Err(e) => tracing::error!("output ring write failed: {e}"),
        }
    }
}

impl ElementOps for AfeElement {
    fn open(&mut self, core: &mut ElementCore) -> JobStatus {
        let in_size = self.manager.feed_bytes();
        let delay_bytes = self.config.delay_samples * 2;
        let buses = new_ringbuf(2, in_size).and_then(|i| Ok((i, new_ringbuf(1, in_size * 2 + delay_bytes)?)));
        let (in_bus, out_bus) = match buses {
            Ok(buses) => buses,
            Err(e) => {
                tracing::error!(el = %core.tag(), "AFE ring allocation failed: {e}");
                return JobStatus::Fail;
            }
        };
        if let Err(e) = self.start_monitors() {
            tracing::error!(el = %core.tag(), "AFE monitors failed: {e}");
            return JobStatus::Fail;
        }
        let session = Session {
            in_bus,
            out_bus,
            in_size,
        };
        self.connect_manager(&session);
        self.session = Some(session);
        core.notify_info(SoundInfo {
            sample_rate: 16_000,
            channels: 1,
            bits: 16,
        });
        tracing::info!(el = %core.tag(), in_size, delay_bytes, "AFE opened");
        JobStatus::Ok
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let tag = core.tag().to_owned();
        let delay_bytes = self.config.delay_samples * 2;
        let Some(session) = self.session.as_ref() else {
            return JobStatus::Fail;
        };
        let (Some(inp), out) = core.ports_mut() else {
            return JobStatus::Fail;
        };
        match inp.acquire_in(session.in_size) {
            Ok(_) => {}
            Err(IoError::Abort) => {
                tracing::debug!(el = %tag, "input aborted");
                return JobStatus::Ok;
            }
            Err(e) => {
                tracing::error!(el = %tag, "read data error: {e}");
                return JobStatus::Fail;
            }
        }
        let done = inp.payload().is_some_and(Payload::is_done);
        let written = match inp.payload() {
            Some(load) if load.valid_size() > 0 => session.in_bus.write(&load.data(), false, Wait::Forever),
            _ => Ok(()),
        };
        if let Err(e) = written {
            if let Err(release) = inp.release_in() {
                tracing::warn!(el = %tag, "input release after failure: {release}");
            }
            if e.is_abort() {
                return JobStatus::Ok;
            }
            tracing::error!(el = %tag, "AFE input ring write failed: {e}");
            return JobStatus::Fail;
        }

        let filled = session.out_bus.filled_size();
        let rsize = if done {
            filled
        } else {
            filled.saturating_sub(delay_bytes)
        };
        let mut ret = if filled > delay_bytes {
            JobStatus::Ok
        } else {
            JobStatus::Continue
        };
        if let Some(out) = out {
            if rsize > 0 || (done && out.io().is_none()) {
                if let Err(e) = emit(out, &session.out_bus, rsize, done) {
                    if let Err(release) = inp.release_in() {
                        tracing::warn!(el = %tag, "input release after failure: {release}");
                    }
                    if e.is_abort() {
                        return JobStatus::Ok;
                    }
                    tracing::error!(el = %tag, "AFE output failed: {e}");
                    return JobStatus::Fail;
                }
            }
        }
        if done {
            ret = JobStatus::Done;
        }
        if let Err(e) = inp.release_in() {
            tracing::error!(el = %tag, "input release failed: {e}");
            return JobStatus::Fail;
        }
        ret
    }

    fn close(&mut self, core: &mut ElementCore) -> JobStatus {
        if let Ok(vcmd) = self.control.vcmd() {
            vcmd.cancel();
        }
        if let Some(session) = self.session.take() {
            session.in_bus.abort();
            self.manager.set_read_cb(None);
            self.manager.set_result_cb(None);
            session.out_bus.abort();
        }
        if let Some(machine) = self.control.machine.lock().take() {
            machine.stop_timer();
        }
        self.control.vcmd.lock().take();
        tracing::info!(el = %core.tag(), "AFE closed");
        JobStatus::Ok
    }

    fn caps(&self) -> Vec<Capability> {
        ["AEC", "AGC", "NS", "VAD", "WWE", "VCMD"]
            .into_iter()
            .map(Capability::new)
            .collect()
    }

    fn methods(&self) -> Vec<Method> {
        vec![Method::new(METHOD_START_VCMD_DET, &[(ARG_VCMD_DET_EN, ArgType::U8)])]
    }

    fn exec_method(&mut self, core: &mut ElementCore, _name: &str, args: &MethodArgs) -> Result<()> {
        let start = args.get_u8(ARG_VCMD_DET_EN)? != 0;
        let vcmd = self.control.vcmd()?;
        tracing::info!(el = %core.tag(), start, "voice command detection");
        if start {
            vcmd.begin();
        } else {
            vcmd.cancel();
        }
        Ok(())
    }
}

/// Moves `rsize` bytes from the output ring into one output payload.
///
/// A concurrent drop of stale bytes can leave less than asked for; the
/// payload then carries what was there.
fn emit(out: &mut Port, out_bus: &Arc<dyn DataBus>, rsize: usize, done: bool) -> IoResult<()> {
    let load = out.acquire_out(rsize.max(1))?;
    if rsize == 0 {
        load.set_valid_size(0).map_err(|_| IoError::Fail)?;
    } else {
        match out_bus.acquire_read(load, rsize, Wait::Immediate) {
            Ok(()) | Err(IoError::Timeout) => {}
            Err(e) => return Err(e),
        }
        out_bus.release_read(load, Wait::Immediate)?;
    }
    load.set_done(done);
    out.release_out()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afe::energy::{EnergyVadConfig, EnergyVadEngine};

    fn manager(features: Features) -> Arc<AfeManager> {
        let engine = EnergyVadEngine::new(&EnergyVadConfig {
            chunk_size: 32,
            channels: 1,
            features,
            ..EnergyVadConfig::default()
        })
        .unwrap();
        Arc::new(AfeManager::new(Box::new(engine), None).unwrap())
    }

    #[test]
    fn handle_rejects_wake_control_before_open() {
        let el = AfeElement::new(manager(Features::default()), AfeConfig::default());
        let h = el.handle();
        assert!(matches!(h.keep_awake(true), Err(Error::InvalidState(_))));
        assert!(matches!(h.trigger_wakeup(), Err(Error::InvalidState(_))));
        assert!(h.wake_state().is_none());
    }

    #[test]
    fn vcmd_method_requires_detection_enabled() {
        let mut element = AfeElement::new(manager(Features::default()), AfeConfig::default()).into_element("ai_afe");
        let mut args = element.methods()[0].args();
        args.set(ARG_VCMD_DET_EN, gmf_core::ArgValue::U8(1)).unwrap();
        assert!(matches!(
            element.exec_method(METHOD_START_VCMD_DET, &args),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn offers_front_end_caps() {
        let element = AfeElement::new(manager(Features::default()), AfeConfig::default()).into_element("ai_afe");
        for cap in ["AEC", "AGC", "NS", "VAD", "WWE", "VCMD"] {
            assert!(element.has_cap(cap), "{cap}");
        }
    }

    #[test]
    fn defaults_follow_the_front_end_table() {
        let c = AfeConfig::default();
        assert_eq!(c.delay_samples, 2048);
        assert_eq!(c.timeouts.wakeup_time, Duration::from_millis(30_000));
        assert_eq!(c.timeouts.wakeup_end, Duration::from_millis(30_000));
        assert_eq!(c.vcmd_timeout, Duration::from_millis(5760));
        assert_eq!(c.language, "cn");
        assert_eq!(c.data_size, 2048);
    }
}
