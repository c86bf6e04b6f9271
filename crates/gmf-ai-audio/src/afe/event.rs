//! User-visible AFE events.

use std::sync::Arc;

use super::engine::WakeupInfo;

/// Longest voice command text kept in a [`VcmdInfo`], in bytes.
pub const VCMD_MAX_LEN: usize = 256;

/// A recognised voice command.
#[derive(Debug, Clone, PartialEq)]
pub struct VcmdInfo {
    /// Phrase id, zero or positive.
    pub phrase_id: i32,
    /// Recognition probability.
    pub prob: f32,
    /// Recognised text, at most `VCMD_MAX_LEN - 1` bytes.
    pub text: String,
}

impl VcmdInfo {
    /// Builds the info, truncating `text` on a character boundary.
    pub fn new(phrase_id: i32, prob: f32, text: &str) -> Self {
        let mut end = text.len().min(VCMD_MAX_LEN - 1);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            phrase_id,
            prob,
            text: text[..end].to_owned(),
        }
    }
}

/// Events delivered to the AFE user.
#[derive(Debug, Clone, PartialEq)]
pub enum AfeEvent {
    /// A wake word woke the system.
    WakeupStart(WakeupInfo),
    /// The wake window closed.
    WakeupEnd,
    /// Speech started.
    VadStart,
    /// Speech ended.
    VadEnd,
    /// Voice command detection gave up.
    VcmdTimeout,
    /// A voice command was recognised.
    VcmdDetected(VcmdInfo),
}

impl AfeEvent {
    /// Numeric event id; recognised commands use their phrase id.
    pub fn id(&self) -> i32 {
        match self {
            AfeEvent::WakeupStart(_) => -100,
            AfeEvent::WakeupEnd => -99,
            AfeEvent::VadStart => -98,
            AfeEvent::VadEnd => -97,
            AfeEvent::VcmdTimeout => -96,
            AfeEvent::VcmdDetected(info) => info.phrase_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            AfeEvent::WakeupStart(_) => "WAKEUP_START",
            AfeEvent::WakeupEnd => "WAKEUP_END",
            AfeEvent::VadStart => "VAD_START",
            AfeEvent::VadEnd => "VAD_END",
            AfeEvent::VcmdTimeout => "VCMD_DECT_TIMEOUT",
            AfeEvent::VcmdDetected(_) => "VCMD_DECTED",
        }
    }
}

/// Receiver of [`AfeEvent`]s.
pub type EventSink = Arc<dyn Fn(&AfeEvent) + Send + Sync>;
