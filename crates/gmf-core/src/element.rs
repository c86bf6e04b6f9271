//! Elements: pipeline nodes with an open → process → close lifecycle.
//!
//! An [`Element`] pairs framework-owned state ([`ElementCore`]: ports,
//! lifecycle state, capabilities, pending events) with the node-specific
//! behaviour behind [`ElementOps`]. The task scheduler only ever calls
//! [`Element::process_open`], [`Element::process_running`] and
//! [`Element::process_close`]; each returns a [`JobStatus`].
//!
//! Elements never call back into the pipeline directly. State changes and
//! format reports are queued on the core and drained by the pipeline after
//! every job ([`Element::take_events`]).

use crate::cap::{Capability, Method, MethodArgs};
use crate::data_bus::BusKind;
use crate::error::{Error, Result};
use crate::event::{EventKind, EventPacket, EventState, SoundInfo};
use crate::job::JobStatus;
use crate::port::{Port, PortDir};

/// How many ports of one direction an element accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortCaps {
    /// Exactly one.
    #[default]
    Single,
    /// Any number.
    Multi,
}

/// Static configuration of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementConfig {
    /// Input port cardinality.
    pub in_caps: PortCaps,
    /// Output port cardinality.
    pub out_caps: PortCaps,
    /// Accepted port kinds, as a mask of [`BusKind::mask`] bits.
    pub port_kind: u8,
    /// Preferred bytes per process call.
    pub data_size: usize,
    /// Buffer alignment requested from ports.
    pub alignment: usize,
    /// Whether the element must hear the stream format before it can open.
    pub dependency: bool,
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self {
            in_caps: PortCaps::Single,
            out_caps: PortCaps::Single,
            port_kind: BusKind::Byte.mask() | BusKind::Block.mask(),
            data_size: 1024,
            alignment: 4,
            dependency: false,
        }
    }
}

/// Node-specific behaviour.
///
/// Job methods receive the framework state so they can reach their ports
/// and queue events.
pub trait ElementOps: Send {
    /// Prepares for processing.
    fn open(&mut self, core: &mut ElementCore) -> JobStatus;

    /// Processes one unit of input.
    fn process(&mut self, core: &mut ElementCore) -> JobStatus;

    /// Releases processing resources.
    fn close(&mut self, core: &mut ElementCore) -> JobStatus;

    /// Reacts to an upstream event before the core records it.
    ///
    /// An error rejects the event: a format report is then not recorded and
    /// a dependent element stays unready.
    fn on_event(&mut self, _core: &mut ElementCore, _event: &EventPacket) -> Result<()> {
        Ok(())
    }

    /// Features this element offers.
    fn caps(&self) -> Vec<Capability> {
        Vec::new()
    }

    /// Methods callable through [`Element::exec_method`].
    fn methods(&self) -> Vec<Method> {
        Vec::new()
    }

    /// Runs a method declared by [`methods`](Self::methods).
    fn exec_method(&mut self, _core: &mut ElementCore, name: &str, _args: &MethodArgs) -> Result<()> {
        Err(Error::not_support(format!("method {name}")))
    }
}

/// Framework-owned element state.
#[derive(Debug)]
pub struct ElementCore {
    tag: String,
    config: ElementConfig,
    state: EventState,
    init_state: EventState,
    in_ports: Vec<Port>,
    out_ports: Vec<Port>,
    outbox: Vec<EventPacket>,
    info: Option<SoundInfo>,
    is_last: bool,
    job_mask: u16,
}

impl ElementCore {
    fn new(tag: String, config: ElementConfig) -> Self {
        let init_state = if config.dependency {
            EventState::None
        } else {
            EventState::Initialized
        };
        Self {
            tag,
            config,
            state: init_state,
            init_state,
            in_ports: Vec::new(),
            out_ports: Vec::new(),
            outbox: Vec::new(),
            info: None,
            is_last: false,
            job_mask: 0,
        }
    }

    /// Element tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Static configuration.
    pub fn config(&self) -> &ElementConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EventState {
        self.state
    }

    /// Last stream format received from upstream or reported by this element.
    pub fn info(&self) -> Option<SoundInfo> {
        self.info
    }

    /// Whether this element ends its pipeline.
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    /// First input port.
    pub fn in_port_mut(&mut self) -> Option<&mut Port> {
        self.in_ports.first_mut()
    }

    /// First output port.
    pub fn out_port_mut(&mut self) -> Option<&mut Port> {
        self.out_ports.first_mut()
    }

    /// First input and output ports together.
    pub fn ports_mut(&mut self) -> (Option<&mut Port>, Option<&mut Port>) {
        (self.in_ports.first_mut(), self.out_ports.first_mut())
    }

    /// Reports the stream format this element produces.
    pub fn notify_info(&mut self, info: SoundInfo) {
        tracing::debug!(
            tag = %self.tag,
            sample_rate = info.sample_rate,
            channels = info.channels,
            bits = info.bits,
            "report info"
        );
        self.info = Some(info);
        self.outbox.push(EventPacket::info(self.tag.clone(), info));
    }

    fn notify_state(&mut self, state: EventState) {
        self.outbox
            .push(EventPacket::state(self.tag.clone(), EventKind::ChangeState, state));
    }

    /// Per-element job bits reserved for element-specific scheduling.
    pub fn job_mask(&self) -> u16 {
        self.job_mask
    }

    /// Replaces the job mask.
    pub fn set_job_mask(&mut self, mask: u16) {
        self.job_mask = mask;
    }

    /// Adds bits to the job mask.
    pub fn change_job_mask(&mut self, mask: u16) {
        self.job_mask |= mask;
    }
}

/// A pipeline node.
pub struct Element {
    core: ElementCore,
    ops: Box<dyn ElementOps>,
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element").field("core", &self.core).finish_non_exhaustive()
    }
}

impl Element {
    /// Creates an element in its initial state.
    pub fn new(tag: impl Into<String>, config: ElementConfig, ops: Box<dyn ElementOps>) -> Self {
        Self {
            core: ElementCore::new(tag.into(), config),
            ops,
        }
    }

    /// Element tag.
    pub fn tag(&self) -> &str {
        &self.core.tag
    }

    /// Framework state.
    pub fn core(&self) -> &ElementCore {
        &self.core
    }

    /// Framework state, mutably.
    pub fn core_mut(&mut self) -> &mut ElementCore {
        &mut self.core
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EventState {
        self.core.state
    }

    /// Overrides the lifecycle state.
    pub fn set_state(&mut self, state: EventState) {
        self.core.state = state;
    }

    /// Returns to the state the element was created in.
    pub fn reset_state(&mut self) {
        self.core.state = self.core.init_state;
    }

    /// Marks whether this element ends its pipeline.
    pub fn set_last(&mut self, last: bool) {
        self.core.is_last = last;
    }

    fn check_port(&self, port: &Port, dir: PortDir, caps: PortCaps, count: usize) -> Result<()> {
        if port.dir() != dir {
            return Err(Error::invalid_arg(format!("{dir:?} port expected")));
        }
        if self.core.config.port_kind & port.kind().mask() == 0 {
            tracing::error!(tag = %self.core.tag, kind = ?port.kind(), "unsupported port kind");
            return Err(Error::not_support(format!("{:?} port", port.kind())));
        }
        if caps == PortCaps::Single && count > 0 {
            tracing::error!(tag = %self.core.tag, "element takes a single {dir:?} port");
            return Err(Error::not_support("additional port on a single-port element"));
        }
        Ok(())
    }

    /// Attaches an input port.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupport`] if the port kind is not accepted or a single-port
    /// element already has one; [`Error::InvalidArg`] for an output port.
    pub fn register_in_port(&mut self, mut port: Port) -> Result<()> {
        self.check_port(&port, PortDir::In, self.core.config.in_caps, self.core.in_ports.len())?;
        port.set_alignment(self.core.config.alignment);
        self.core.in_ports.push(port);
        Ok(())
    }

    /// Attaches an output port.
    ///
    /// # Errors
    ///
    /// Same rules as [`register_in_port`](Self::register_in_port).
    pub fn register_out_port(&mut self, mut port: Port) -> Result<()> {
        self.check_port(&port, PortDir::Out, self.core.config.out_caps, self.core.out_ports.len())?;
        port.set_alignment(self.core.config.alignment);
        self.core.out_ports.push(port);
        Ok(())
    }

    /// Detaches and returns every input port.
    pub fn unregister_in_ports(&mut self) -> Vec<Port> {
        std::mem::take(&mut self.core.in_ports)
    }

    /// Detaches and returns every output port.
    pub fn unregister_out_ports(&mut self) -> Vec<Port> {
        std::mem::take(&mut self.core.out_ports)
    }

    /// Runs the open job.
    ///
    /// Fails without calling the element when the input port is missing, or
    /// the output port is missing on an element that is not last.
    pub fn process_open(&mut self) -> JobStatus {
        if self.core.in_ports.is_empty() || (!self.core.is_last && self.core.out_ports.is_empty()) {
            tracing::error!(
                tag = %self.core.tag,
                inputs = self.core.in_ports.len(),
                outputs = self.core.out_ports.len(),
                "element opened without ports"
            );
            return JobStatus::Fail;
        }
        let ret = self.ops.open(&mut self.core);
        tracing::debug!(tag = %self.core.tag, ret = ret.as_str(), "open");
        if ret == JobStatus::Ok {
            self.core.state = EventState::Running;
            self.core.notify_state(EventState::Running);
        }
        ret
    }

    /// Runs one process job.
    pub fn process_running(&mut self) -> JobStatus {
        self.ops.process(&mut self.core)
    }

    /// Runs the close job and returns any input still held.
    pub fn process_close(&mut self) -> JobStatus {
        let ret = self.ops.close(&mut self.core);
        for port in &mut self.core.in_ports {
            if let Err(e) = port.release_in() {
                tracing::warn!(tag = %self.core.tag, "held input not released on close: {e}");
            }
        }
        tracing::debug!(tag = %self.core.tag, ret = ret.as_str(), "close");
        ret
    }

    /// Delivers an upstream event.
    ///
    /// A format report moves a dependent element from `None` to
    /// `Initialized`, making it ready to open.
    ///
    /// # Errors
    ///
    /// Whatever [`ElementOps::on_event`] reports.
    pub fn receive_event(&mut self, event: &EventPacket) -> Result<()> {
        self.ops.on_event(&mut self.core, event)?;
        if event.kind == EventKind::ReportInfo {
            if let Some(info) = event.info {
                self.core.info = Some(info);
            }
            if self.core.state == EventState::None {
                tracing::debug!(tag = %self.core.tag, from = %event.from, "dependency satisfied");
                self.core.state = EventState::Initialized;
            }
        }
        Ok(())
    }

    /// Drains queued events.
    pub fn take_events(&mut self) -> Vec<EventPacket> {
        std::mem::take(&mut self.core.outbox)
    }

    /// Releases held payloads on every port.
    pub fn reset_port(&mut self) {
        for port in self.core.in_ports.iter_mut().chain(self.core.out_ports.iter_mut()) {
            port.reset();
        }
    }

    /// Capabilities offered by this element.
    pub fn caps(&self) -> Vec<Capability> {
        self.ops.caps()
    }

    /// Whether a capability with this name is offered.
    pub fn has_cap(&self, name: &str) -> bool {
        self.ops.caps().iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Methods callable on this element.
    pub fn methods(&self) -> Vec<Method> {
        self.ops.methods()
    }

    /// Invokes a method by name (case-insensitive).
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupport`] if the element declares no methods.
    /// - [`Error::NotFound`] if no method has that name.
    /// - [`Error::InvalidArg`] if a declared argument is missing.
    pub fn exec_method(&mut self, name: &str, args: &MethodArgs) -> Result<()> {
        let methods = self.ops.methods();
        if methods.is_empty() {
            return Err(Error::not_support(format!("{} has no methods", self.core.tag)));
        }
        let method = methods
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::not_found(format!("method {name}")))?;
        args.check_complete()?;
        let name = method.name.clone();
        self.ops.exec_method(&mut self.core, &name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{ArgType, ArgValue};
    use crate::port::{Endpoint, PortAttr, PortLink};

    #[derive(Default)]
    struct Recorder {
        opened: bool,
        toggled: Option<u8>,
    }

    impl ElementOps for Recorder {
        fn open(&mut self, core: &mut ElementCore) -> JobStatus {
            self.opened = true;
            core.notify_info(SoundInfo {
                sample_rate: 8000,
                channels: 1,
                bits: 16,
            });
            JobStatus::Ok
        }

        fn process(&mut self, _core: &mut ElementCore) -> JobStatus {
            JobStatus::Done
        }

        fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
            JobStatus::Ok
        }

        fn methods(&self) -> Vec<Method> {
            vec![Method::new("toggle", &[("on", ArgType::U8)])]
        }

        fn exec_method(&mut self, _core: &mut ElementCore, _name: &str, args: &MethodArgs) -> Result<()> {
            self.toggled = Some(args.get_u8("on")?);
            Ok(())
        }
    }

    fn link_port(dir: PortDir) -> Port {
        Port::new(dir, BusKind::Byte, Endpoint::Link(PortLink::new()), PortAttr::default())
    }

    // --- ports ---

    #[test]
    fn single_cap_rejects_second_port() {
        let mut el = Element::new("rec", ElementConfig::default(), Box::new(Recorder::default()));
        el.register_in_port(link_port(PortDir::In)).unwrap();
        assert!(matches!(
            el.register_in_port(link_port(PortDir::In)),
            Err(Error::NotSupport(_))
        ));
        assert!(matches!(
            el.register_out_port(link_port(PortDir::In)),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn port_kind_mask_is_enforced() {
        let config = ElementConfig {
            port_kind: BusKind::Block.mask(),
            ..ElementConfig::default()
        };
        let mut el = Element::new("rec", config, Box::new(Recorder::default()));
        assert!(matches!(
            el.register_in_port(link_port(PortDir::In)),
            Err(Error::NotSupport(_))
        ));
    }

    // --- lifecycle ---

    #[test]
    fn open_requires_ports() {
        let mut el = Element::new("rec", ElementConfig::default(), Box::new(Recorder::default()));
        assert_eq!(el.process_open(), JobStatus::Fail);
        el.register_in_port(link_port(PortDir::In)).unwrap();
        assert_eq!(el.process_open(), JobStatus::Fail);
        el.set_last(true);
        assert_eq!(el.process_open(), JobStatus::Ok);
        assert_eq!(el.state(), EventState::Running);

        let events = el.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::ReportInfo);
        assert_eq!(events[1].state, EventState::Running);
        assert!(el.take_events().is_empty());
    }

    #[test]
    fn dependent_element_waits_for_info() {
        let config = ElementConfig {
            dependency: true,
            ..ElementConfig::default()
        };
        let mut el = Element::new("rec", config, Box::new(Recorder::default()));
        assert_eq!(el.state(), EventState::None);
        let info = SoundInfo {
            sample_rate: 16_000,
            channels: 2,
            bits: 16,
        };
        el.receive_event(&EventPacket::info("up", info)).unwrap();
        assert_eq!(el.state(), EventState::Initialized);
        assert_eq!(el.core().info(), Some(info));
        el.set_state(EventState::Finished);
        el.reset_state();
        assert_eq!(el.state(), EventState::None);
    }

    // --- methods ---

    #[test]
    fn methods_match_case_insensitively() {
        let mut el = Element::new("rec", ElementConfig::default(), Box::new(Recorder::default()));
        let method = &el.methods()[0];
        let mut args = method.args();
        assert!(matches!(el.exec_method("TOGGLE", &args), Err(Error::InvalidArg(_))));
        args.set("on", ArgValue::U8(1)).unwrap();
        el.exec_method("Toggle", &args).unwrap();
        assert!(matches!(el.exec_method("missing", &args), Err(Error::NotFound(_))));
    }

    #[test]
    fn element_without_methods_is_not_supported() {
        struct Bare;
        impl ElementOps for Bare {
            fn open(&mut self, _: &mut ElementCore) -> JobStatus {
                JobStatus::Ok
            }
            fn process(&mut self, _: &mut ElementCore) -> JobStatus {
                JobStatus::Ok
            }
            fn close(&mut self, _: &mut ElementCore) -> JobStatus {
                JobStatus::Ok
            }
        }
        let mut el = Element::new("bare", ElementConfig::default(), Box::new(Bare));
        assert!(matches!(
            el.exec_method("x", &MethodArgs::default()),
            Err(Error::NotSupport(_))
        ));
    }
}
