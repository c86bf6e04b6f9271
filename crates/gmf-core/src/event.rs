//! Lifecycle states and the events that carry them.

use std::fmt;

/// Lifecycle state shared by tasks, elements and pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventState {
    /// Not initialised; dependent elements wait here for upstream info.
    #[default]
    None,
    /// Ready to open.
    Initialized,
    /// Opening IOs and elements.
    Opening,
    /// Processing.
    Running,
    /// Suspended between jobs.
    Paused,
    /// Stopped by request.
    Stopped,
    /// All jobs completed.
    Finished,
    /// A job failed.
    Error,
}

impl EventState {
    /// Upper-case name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EventState::None => "NONE",
            EventState::Initialized => "INITIALIZED",
            EventState::Opening => "OPENING",
            EventState::Running => "RUNNING",
            EventState::Paused => "PAUSED",
            EventState::Stopped => "STOPPED",
            EventState::Finished => "FINISHED",
            EventState::Error => "ERROR",
        }
    }

    /// Whether no more processing will happen without a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Stopped | EventState::Finished | EventState::Error)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The sender changed state.
    ChangeState,
    /// The sender's job list reached a milestone; close jobs may be loaded.
    LoadingJob,
    /// The sender learned the stream format.
    ReportInfo,
}

/// Stream format reported downstream once known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoundInfo {
    /// Samples per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample.
    pub bits: u16,
}

impl SoundInfo {
    /// Bytes per interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits / 8)
    }
}

/// One event travelling from a task or element to its listener.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    /// Tag of the sender.
    pub from: String,
    /// Event kind.
    pub kind: EventKind,
    /// New state for state and loading events.
    pub state: EventState,
    /// Format for [`EventKind::ReportInfo`].
    pub info: Option<SoundInfo>,
}

impl EventPacket {
    /// A state change from `from`.
    pub fn state(from: impl Into<String>, kind: EventKind, state: EventState) -> Self {
        Self {
            from: from.into(),
            kind,
            state,
            info: None,
        }
    }

    /// A format report from `from`.
    pub fn info(from: impl Into<String>, info: SoundInfo) -> Self {
        Self {
            from: from.into(),
            kind: EventKind::ReportInfo,
            state: EventState::None,
            info: Some(info),
        }
    }
}
