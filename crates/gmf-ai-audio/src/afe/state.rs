//! Wake / voice activity state machine.
//!
//! ```text
//!            wake word                speech
//!   Idle ─────────────► Wakeup ─────────────► Speeching
//!    ▲                    │  ▲                  │   ▲
//!    │      timer         │  │ noise + keep     │   │ speech
//!    ├────────────────────┘  └──────────────────┤   │
//!    │      timer                               ▼   │
//!    └────────────────────────────────────── WaitForSleep
//! ```
//!
//! Without the wake-word feature, speech in `Idle` goes straight to
//! `Speeching` and trailing noise goes back to `Idle`. A repeated event is
//! processed once; only keep-awake changes pass every time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::engine::{Feature, FeatureControl, FetchResult, VadState, WakeupInfo};
use super::event::{AfeEvent, EventSink};
use crate::timer::SoftTimer;

/// Wake lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeState {
    /// Waiting for a wake word (or speech when wake words are off).
    #[default]
    Idle,
    /// Woken, waiting for speech.
    Wakeup,
    /// Speech in progress.
    Speeching,
    /// Speech ended; sleeping again when the timer runs out.
    WaitForSleep,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeEvent {
    /// A frame without speech.
    Noise,
    /// A frame with speech.
    Speech,
    /// A wake word was detected.
    WakeWord,
    /// The wake timer ran out.
    TimerExpired,
    /// The keep-awake flag changed.
    KeepWakeModified,
}

impl WakeEvent {
    /// Event carried by a fetched frame; a wake word outranks activity.
    pub fn from_result(result: &FetchResult) -> Self {
        if result.wakeup.is_some() {
            return WakeEvent::WakeWord;
        }
        match result.vad_state {
            VadState::Silence => WakeEvent::Noise,
            VadState::Speech => WakeEvent::Speech,
        }
    }
}

/// Wake window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeTimeouts {
    /// How long a wake-up waits for speech.
    pub wakeup_time: Duration,
    /// How long after speech before going back to sleep.
    pub wakeup_end: Duration,
}

impl Default for WakeTimeouts {
    fn default() -> Self {
        Self {
            wakeup_time: Duration::from_millis(30_000),
            wakeup_end: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: WakeState,
    keep_wake: bool,
    last_event: Option<WakeEvent>,
}

/// The wake state machine.
///
/// Created behind an `Arc`; the timer holds a weak reference back so an
/// expiry after the machine is gone is a no-op.
pub struct WakeMachine {
    inner: Mutex<Inner>,
    features: Arc<dyn FeatureControl>,
    timeouts: WakeTimeouts,
    origin_vad: bool,
    timer: SoftTimer,
    sink: EventSink,
}

impl std::fmt::Debug for WakeMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeMachine")
            .field("inner", &*self.inner.lock())
            .field("timeouts", &self.timeouts)
            .field("origin_vad", &self.origin_vad)
            .finish_non_exhaustive()
    }
}

impl WakeMachine {
    /// Builds a machine in `Idle`.
    ///
    /// `origin_vad` marks that voice activity detection was configured on
    /// but parked while waiting for a wake word: it is switched on at wake-up
    /// and off again when the system sleeps.
    pub fn new(
        features: Arc<dyn FeatureControl>,
        timeouts: WakeTimeouts,
        origin_vad: bool,
        sink: EventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            Self {
                inner: Mutex::new(Inner::default()),
                features,
                timeouts,
                origin_vad,
                timer: SoftTimer::new("wakeup_timer", move || {
                    if let Some(machine) = weak.upgrade() {
                        machine.update(WakeEvent::TimerExpired, None);
                    }
                }),
                sink,
            }
        })
    }

    /// Current state.
    pub fn state(&self) -> WakeState {
        self.inner.lock().state
    }

    /// Whether the wake window is held open.
    pub fn keep_wake(&self) -> bool {
        self.inner.lock().keep_wake
    }

    /// Feeds one fetched frame.
    pub fn monitor(&self, result: &FetchResult) {
        let event = WakeEvent::from_result(result);
        self.update(event, result.wakeup);
    }

    /// Holds the wake window open (`true`) or lets it time out again.
    pub fn set_keep_wake(&self, keep: bool) {
        self.inner.lock().keep_wake = keep;
        self.update(WakeEvent::KeepWakeModified, None);
    }

    /// Wakes the system as if a wake word was heard.
    pub fn trigger_wakeup(&self) {
        self.update(WakeEvent::WakeWord, Some(WakeupInfo::default()));
    }

    /// Disarms the wake timer.
    pub fn stop_timer(&self) {
        self.timer.stop();
    }

    /// Applies one event.
    pub fn update(&self, event: WakeEvent, info: Option<WakeupInfo>) {
        let emitted = {
            let mut inner = self.inner.lock();
            if event != WakeEvent::KeepWakeModified && inner.last_event == Some(event) {
                return;
            }
            tracing::trace!(state = ?inner.state, ?event, "wake state update");
            inner.last_event = Some(event);
            self.transition(&mut inner, event, info)
        };
        if let Some(ev) = emitted {
            tracing::debug!(event = ev.name(), "afe event");
            (self.sink)(&ev);
        }
    }

    fn transition(&self, inner: &mut Inner, event: WakeEvent, info: Option<WakeupInfo>) -> Option<AfeEvent> {
        if event == WakeEvent::WakeWord && inner.state != WakeState::Idle {
            self.reset(inner);
        }
        let wakeup_enabled = self.features.features().wakeup;
        match (inner.state, event) {
            (WakeState::Idle, WakeEvent::WakeWord) => {
                inner.state = WakeState::Wakeup;
                if !inner.keep_wake {
                    self.arm_timer(inner.state);
                }
                if self.origin_vad {
                    self.set_vad(true);
                }
                Some(AfeEvent::WakeupStart(info.unwrap_or_default()))
            }
            (WakeState::Idle, WakeEvent::Speech) if !wakeup_enabled => {
                inner.state = WakeState::Speeching;
                Some(AfeEvent::VadStart)
            }
            (WakeState::Wakeup, WakeEvent::Speech) => {
                self.timer.stop();
                inner.state = WakeState::Speeching;
                Some(AfeEvent::VadStart)
            }
            (WakeState::Wakeup, WakeEvent::KeepWakeModified) => {
                if inner.keep_wake {
                    self.timer.stop();
                } else {
                    self.arm_timer(inner.state);
                }
                None
            }
            (WakeState::Wakeup, WakeEvent::TimerExpired) => {
                inner.state = WakeState::Idle;
                self.timer.stop();
                Some(AfeEvent::WakeupEnd)
            }
            (WakeState::Speeching, WakeEvent::Noise) => {
                inner.state = if !wakeup_enabled {
                    WakeState::Idle
                } else if inner.keep_wake {
                    WakeState::Wakeup
                } else {
                    self.arm_timer(WakeState::WaitForSleep);
                    WakeState::WaitForSleep
                };
                Some(AfeEvent::VadEnd)
            }
            (WakeState::WaitForSleep, WakeEvent::Speech) => {
                inner.state = WakeState::Speeching;
                Some(AfeEvent::VadStart)
            }
            (WakeState::WaitForSleep, WakeEvent::TimerExpired) => {
                inner.state = WakeState::Idle;
                if self.origin_vad {
                    self.set_vad(false);
                }
                Some(AfeEvent::WakeupEnd)
            }
            (WakeState::WaitForSleep, WakeEvent::KeepWakeModified) => {
                if inner.keep_wake {
                    self.timer.stop();
                    inner.state = WakeState::Wakeup;
                } else {
                    self.arm_timer(inner.state);
                }
                None
            }
            _ => None,
        }
    }

    fn reset(&self, inner: &mut Inner) {
        self.timer.stop();
        inner.state = WakeState::Idle;
        if self.origin_vad && self.features.features().wakeup {
            self.set_vad(false);
        }
    }

    fn arm_timer(&self, state: WakeState) {
        let timeout = match state {
            WakeState::Wakeup => self.timeouts.wakeup_time,
            WakeState::WaitForSleep => self.timeouts.wakeup_end,
            _ => Duration::ZERO,
        };
        self.timer.stop();
        if !timeout.is_zero() {
            if let Err(e) = self.timer.start_once(timeout) {
                tracing::error!("wake timer start failed: {e}");
            }
        }
    }

    fn set_vad(&self, enable: bool) {
        if let Err(e) = self.features.enable_feature(Feature::Vad, enable) {
            tracing::warn!(enable, "VAD switch failed: {e}");
        }
    }
}

impl Drop for WakeMachine {
    fn drop(&mut self) {
        self.timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afe::engine::Features;
    use gmf_core::Result;

    struct Flags(Mutex<Features>);

    impl FeatureControl for Flags {
        fn features(&self) -> Features {
            *self.0.lock()
        }

        fn enable_feature(&self, feature: Feature, enable: bool) -> Result<()> {
            self.0.lock().set(feature, enable);
            Ok(())
        }
    }

    fn machine(wakeup: bool, origin_vad: bool, timeouts: WakeTimeouts) -> (Arc<WakeMachine>, Arc<Flags>, Arc<Mutex<Vec<AfeEvent>>>) {
        let flags = Arc::new(Flags(Mutex::new(Features {
            wakeup,
            vad: !origin_vad,
            ..Features::default()
        })));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let m = WakeMachine::new(
            Arc::clone(&flags) as Arc<dyn FeatureControl>,
            timeouts,
            origin_vad,
            Arc::new(move |e: &AfeEvent| sink.lock().push(e.clone())),
        );
        (m, flags, events)
    }

    fn long() -> WakeTimeouts {
        WakeTimeouts {
            wakeup_time: Duration::from_secs(60),
            wakeup_end: Duration::from_secs(60),
        }
    }

    fn names(events: &Mutex<Vec<AfeEvent>>) -> Vec<&'static str> {
        events.lock().iter().map(AfeEvent::name).collect()
    }

    // --- wake word flow ---

    #[test]
    fn wake_word_from_idle_wakes_once() {
        let (m, _, events) = machine(true, false, long());
        m.update(WakeEvent::WakeWord, Some(WakeupInfo::default()));
        assert_eq!(m.state(), WakeState::Wakeup);
        assert_eq!(names(&events), ["WAKEUP_START"]);
    }

    #[test]
    fn full_conversation_cycle() {
        let (m, _, events) = machine(true, false, long());
        m.update(WakeEvent::WakeWord, None);
        m.update(WakeEvent::Speech, None);
        assert_eq!(m.state(), WakeState::Speeching);
        m.update(WakeEvent::Noise, None);
        assert_eq!(m.state(), WakeState::WaitForSleep);
        m.update(WakeEvent::Speech, None);
        m.update(WakeEvent::Noise, None);
        m.update(WakeEvent::TimerExpired, None);
        assert_eq!(m.state(), WakeState::Idle);
        assert_eq!(
            names(&events),
            ["WAKEUP_START", "VAD_START", "VAD_END", "VAD_START", "VAD_END", "WAKEUP_END"]
        );
    }

    #[test]
    fn duplicates_are_suppressed() {
        let (m, _, events) = machine(true, false, long());
        m.update(WakeEvent::WakeWord, None);
        m.update(WakeEvent::WakeWord, None);
        m.update(WakeEvent::Speech, None);
        m.update(WakeEvent::Speech, None);
        assert_eq!(names(&events), ["WAKEUP_START", "VAD_START"]);
    }

    #[test]
    fn speech_in_idle_is_ignored_with_wake_words_on() {
        let (m, _, events) = machine(true, false, long());
        m.update(WakeEvent::Speech, None);
        assert_eq!(m.state(), WakeState::Idle);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn wake_word_while_speeching_restarts_the_window() {
        let (m, _, events) = machine(true, false, long());
        m.update(WakeEvent::WakeWord, None);
        m.update(WakeEvent::Speech, None);
        m.update(WakeEvent::WakeWord, None);
        assert_eq!(m.state(), WakeState::Wakeup);
        assert_eq!(names(&events), ["WAKEUP_START", "VAD_START", "WAKEUP_START"]);
    }

    // --- VAD only ---

    #[test]
    fn vad_only_toggles_between_idle_and_speeching() {
        let (m, _, events) = machine(false, false, long());
        m.update(WakeEvent::Speech, None);
        assert_eq!(m.state(), WakeState::Speeching);
        m.update(WakeEvent::Noise, None);
        assert_eq!(m.state(), WakeState::Idle);
        assert_eq!(names(&events), ["VAD_START", "VAD_END"]);
    }

    // --- timers and keep-awake ---

    #[test]
    fn wake_window_times_out() {
        let (m, _, events) = machine(
            true,
            false,
            WakeTimeouts {
                wakeup_time: Duration::from_millis(20),
                wakeup_end: Duration::from_millis(20),
            },
        );
        m.update(WakeEvent::WakeWord, None);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(m.state(), WakeState::Idle);
        assert_eq!(names(&events), ["WAKEUP_START", "WAKEUP_END"]);
    }

    #[test]
    fn keep_wake_holds_the_window_open() {
        let (m, _, events) = machine(
            true,
            false,
            WakeTimeouts {
                wakeup_time: Duration::from_millis(30),
                wakeup_end: Duration::from_millis(30),
            },
        );
        m.update(WakeEvent::WakeWord, None);
        m.set_keep_wake(true);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(m.state(), WakeState::Wakeup);

        m.update(WakeEvent::Speech, None);
        m.update(WakeEvent::Noise, None);
        assert_eq!(m.state(), WakeState::Wakeup);

        m.set_keep_wake(false);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(m.state(), WakeState::Idle);
        assert_eq!(names(&events), ["WAKEUP_START", "VAD_START", "VAD_END", "WAKEUP_END"]);
    }

    #[test]
    fn keep_wake_in_wait_for_sleep_returns_to_wakeup() {
        let (m, _, _) = machine(true, false, long());
        m.update(WakeEvent::WakeWord, None);
        m.update(WakeEvent::Speech, None);
        m.update(WakeEvent::Noise, None);
        m.set_keep_wake(true);
        assert_eq!(m.state(), WakeState::Wakeup);
        assert!(m.keep_wake());
    }

    // --- VAD parking ---

    #[test]
    fn parked_vad_follows_the_wake_window() {
        let (m, flags, _) = machine(true, true, long());
        assert!(!flags.features().vad);
        m.update(WakeEvent::WakeWord, None);
        assert!(flags.features().vad);
        m.update(WakeEvent::Speech, None);
        m.update(WakeEvent::Noise, None);
        m.update(WakeEvent::TimerExpired, None);
        assert!(!flags.features().vad);
    }

    #[test]
    fn manual_trigger_acts_as_wake_word() {
        let (m, _, events) = machine(true, false, long());
        m.trigger_wakeup();
        assert_eq!(m.state(), WakeState::Wakeup);
        assert_eq!(events.lock()[0], AfeEvent::WakeupStart(WakeupInfo::default()));
    }
}
