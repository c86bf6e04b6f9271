//! Drives an [`AfeEngine`] from a feed thread and a fetch thread.
//!
//! The feed thread pulls one chunk of interleaved capture through the read
//! callback and feeds the engine; the fetch thread drains processed frames
//! and hands each to the result callback. Both run only while the manager
//! is resumed, and both exit when it is dropped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use gmf_core::{Error, IoError, IoResult, Result};
use parking_lot::{Condvar, Mutex};

use super::engine::{AfeEngine, Feature, FeatureControl, FetchResult, Features};

/// How long the feed thread waits for one chunk of capture.
pub const FEED_READ_WAIT: Duration = Duration::from_millis(500);

const FETCH_POLL: Duration = Duration::from_millis(100);

/// Fills the buffer with interleaved 16-bit capture, waiting at most the
/// given time; returns the bytes read.
pub type ReadCb = Box<dyn Fn(&mut [u8], Duration) -> IoResult<usize> + Send + Sync>;

/// Receives every processed frame on the fetch thread.
pub type ResultCb = Box<dyn Fn(&FetchResult) + Send + Sync>;

#[derive(Debug, Default)]
struct Ctrl {
    run: bool,
    destroy: bool,
}

struct Shared {
    engine: Mutex<Box<dyn AfeEngine>>,
    features: Mutex<Features>,
    read_cb: ArcSwapOption<ReadCb>,
    read_lock: Mutex<()>,
    result_cb: ArcSwapOption<ResultCb>,
    ctrl: Mutex<Ctrl>,
    ctrl_cv: Condvar,
    chunk_size: usize,
    channels: usize,
}

impl Shared {
    /// Blocks until running or destroyed; returns `false` on destroy.
    fn wait_run(&self) -> bool {
        let mut ctrl = self.ctrl.lock();
        while !ctrl.run && !ctrl.destroy {
            self.ctrl_cv.wait(&mut ctrl);
        }
        !ctrl.destroy
    }

    fn set_run(&self, run: bool) {
        self.ctrl.lock().run = run;
        self.ctrl_cv.notify_all();
    }
}

/// Owner of an AFE engine and its worker threads.
pub struct AfeManager {
    shared: Arc<Shared>,
    feed: Option<JoinHandle<()>>,
    fetch: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AfeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeManager")
            .field("chunk_size", &self.shared.chunk_size)
            .field("channels", &self.shared.channels)
            .field("features", &*self.shared.features.lock())
            .finish_non_exhaustive()
    }
}

impl AfeManager {
    /// Starts the worker threads around `engine`.
    ///
    /// The threads run as soon as a read callback is present.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for an engine with a zero chunk size or channel
    /// count; [`Error::Fail`] if a thread cannot be spawned.
    pub fn new(engine: Box<dyn AfeEngine>, read_cb: Option<ReadCb>) -> Result<Self> {
        let chunk_size = engine.feed_chunk_size();
        let channels = engine.feed_channels();
        if chunk_size == 0 || channels == 0 {
            return Err(Error::invalid_arg("engine reports an empty feed chunk"));
        }
        let features = engine.initial_features();
        let run = read_cb.is_some();
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            features: Mutex::new(features),
            read_cb: ArcSwapOption::new(read_cb.map(Arc::new)),
            read_lock: Mutex::new(()),
            result_cb: ArcSwapOption::empty(),
            ctrl: Mutex::new(Ctrl { run, destroy: false }),
            ctrl_cv: Condvar::new(),
            chunk_size,
            channels,
        });

        let (fed_tx, fed_rx) = bounded(16);
        let mut manager = Self {
            shared,
            feed: None,
            fetch: None,
        };
        let shared = Arc::clone(&manager.shared);
        manager.feed = Some(
            thread::Builder::new()
                .name("afe_feed".into())
                .spawn(move || feed_loop(&shared, &fed_tx))
                .map_err(|e| Error::fail(format!("afe feed thread: {e}")))?,
        );
        let shared = Arc::clone(&manager.shared);
        manager.fetch = Some(
            thread::Builder::new()
                .name("afe_fetch".into())
                .spawn(move || fetch_loop(&shared, &fed_rx))
                .map_err(|e| Error::fail(format!("afe fetch thread: {e}")))?,
        );
        tracing::info!(chunk_size, channels, ?features, "AFE manager created");
        Ok(manager)
    }

    /// Samples per channel per feed.
    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    /// Interleaved input channels.
    pub fn input_channels(&self) -> usize {
        self.shared.channels
    }

    /// Bytes the read callback is asked for on each feed.
    pub fn feed_bytes(&self) -> usize {
        self.shared.chunk_size * self.shared.channels * 2
    }

    /// Currently enabled features.
    pub fn features(&self) -> Features {
        *self.shared.features.lock()
    }

    /// Parks (`true`) or resumes the worker threads.
    pub fn suspend(&self, suspend: bool) {
        tracing::info!(suspend, "AFE manager suspend");
        self.shared.set_run(!suspend);
    }

    /// Replaces the read callback.
    ///
    /// Suspends the threads and waits out a read in flight; resumes only
    /// when a new callback is given.
    pub fn set_read_cb(&self, cb: Option<ReadCb>) {
        self.suspend(true);
        let resume = cb.is_some();
        {
            let _in_flight = self.shared.read_lock.lock();
            self.shared.read_cb.store(cb.map(Arc::new));
        }
        if resume {
            self.suspend(false);
        }
    }

    /// Replaces the result callback.
    pub fn set_result_cb(&self, cb: Option<ResultCb>) {
        self.shared.result_cb.store(cb.map(Arc::new));
    }

    /// Switches an engine feature.
    ///
    /// Switching voice activity detection also clears its history.
    ///
    /// # Errors
    ///
    /// The engine's error for an unsupported feature.
    pub fn enable_features(&self, feature: Feature, enable: bool) -> Result<()> {
        tracing::debug!(?feature, enable, "AFE feature ctrl");
        let mut engine = self.shared.engine.lock();
        let res = engine.set_feature(feature, enable);
        if let Ok(now) = res {
            self.shared.features.lock().set(feature, now);
        }
        if feature == Feature::Vad {
            engine.reset_vad();
        }
        res.map(|_| ())
    }
}

impl FeatureControl for AfeManager {
    fn features(&self) -> Features {
        AfeManager::features(self)
    }

    fn enable_feature(&self, feature: Feature, enable: bool) -> Result<()> {
        self.enable_features(feature, enable)
    }
}

fn feed_loop(shared: &Shared, fed: &Sender<()>) {
    let mut bytes = vec![0u8; shared.chunk_size * shared.channels * 2];
    let mut samples = vec![0i16; shared.chunk_size * shared.channels];
    tracing::info!(
        channels = shared.channels,
        chunk = shared.chunk_size,
        buf_size = bytes.len(),
        "feed thread started"
    );
    while shared.wait_run() {
        let read = {
            let in_flight = shared.read_lock.lock();
            match shared.read_cb.load_full() {
                Some(cb) => cb(&mut bytes, FEED_READ_WAIT),
                None => {
                    drop(in_flight);
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }
        };
        match read {
            Ok(n) if n == bytes.len() => {
                for (s, b) in samples.iter_mut().zip(bytes.chunks_exact(2)) {
                    *s = i16::from_le_bytes([b[0], b[1]]);
                }
                shared.engine.lock().feed(&samples);
                let _ = fed.try_send(());
            }
            Ok(n) => tracing::error!(read = n, wanted = bytes.len(), "AFE read failed"),
            Err(IoError::Abort) => {
                tracing::debug!("AFE read aborted");
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => tracing::error!("AFE read failed: {e}"),
        }
    }
    tracing::debug!("feed thread exit");
}

fn fetch_loop(shared: &Shared, fed: &Receiver<()>) {
    while shared.wait_run() {
        match fed.recv_timeout(FETCH_POLL) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        loop {
            let Some(result) = shared.engine.lock().fetch() else {
                break;
            };
            if let Some(cb) = shared.result_cb.load_full() {
                cb(&result);
            }
        }
    }
    tracing::debug!("fetch thread exit");
}

impl Drop for AfeManager {
    fn drop(&mut self) {
        {
            let mut ctrl = self.shared.ctrl.lock();
            ctrl.destroy = true;
        }
        self.shared.ctrl_cv.notify_all();
        for handle in [self.feed.take(), self.fetch.take()].into_iter().flatten() {
            let _ = handle.join();
        }
        tracing::info!("AFE manager destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afe::energy::{EnergyVadConfig, EnergyVadEngine};
    use crate::afe::engine::VadState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> Box<dyn AfeEngine> {
        Box::new(
            EnergyVadEngine::new(&EnergyVadConfig {
                chunk_size: 32,
                channels: 2,
                ..EnergyVadConfig::default()
            })
            .unwrap(),
        )
    }

    fn loud_reader(calls: Arc<AtomicUsize>) -> ReadCb {
        Box::new(move |buf: &mut [u8], _wait: Duration| -> IoResult<usize> {
            calls.fetch_add(1, Ordering::SeqCst);
            for pair in buf.chunks_exact_mut(2) {
                pair.copy_from_slice(&8000i16.to_le_bytes());
            }
            thread::sleep(Duration::from_millis(2));
            Ok(buf.len())
        })
    }

    #[test]
    fn reports_engine_geometry() {
        let m = AfeManager::new(engine(), None).unwrap();
        assert_eq!(m.chunk_size(), 32);
        assert_eq!(m.input_channels(), 2);
        assert_eq!(m.feed_bytes(), 128);
        assert!(m.features().vad);
    }

    #[test]
    fn frames_flow_from_read_to_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let m = AfeManager::new(engine(), Some(loud_reader(Arc::clone(&calls)))).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        m.set_result_cb(Some(Box::new(move |r: &FetchResult| {
            let _ = tx.send((r.data.len(), r.vad_state));
        })));
        let (len, state) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(len, 64);
        assert_eq!(state, VadState::Speech);
    }

    #[test]
    fn suspend_stops_reading() {
        let calls = Arc::new(AtomicUsize::new(0));
        let m = AfeManager::new(engine(), Some(loud_reader(Arc::clone(&calls)))).unwrap();
        thread::sleep(Duration::from_millis(30));
        m.suspend(true);
        thread::sleep(Duration::from_millis(20));
        let frozen = calls.load(Ordering::SeqCst);
        assert!(frozen > 0);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(calls.load(Ordering::SeqCst), frozen);
        m.suspend(false);
        thread::sleep(Duration::from_millis(40));
        assert!(calls.load(Ordering::SeqCst) > frozen);
    }

    #[test]
    fn clearing_read_cb_parks_threads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let m = AfeManager::new(engine(), Some(loud_reader(Arc::clone(&calls)))).unwrap();
        thread::sleep(Duration::from_millis(20));
        m.set_read_cb(None);
        let frozen = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(calls.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn short_reads_are_not_fed() {
        let m = AfeManager::new(
            engine(),
            Some(Box::new(|buf: &mut [u8], _: Duration| -> IoResult<usize> {
                thread::sleep(Duration::from_millis(2));
                Ok(buf.len() / 2)
            })),
        )
        .unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        m.set_result_cb(Some(Box::new(move |_: &FetchResult| {
            let _ = tx.send(());
        })));
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn feature_switches_are_recorded() {
        let m = AfeManager::new(engine(), None).unwrap();
        m.enable_features(Feature::Vad, false).unwrap();
        assert!(!m.features().vad);
        m.enable_features(Feature::WakeNet, true).unwrap();
        assert!(m.features().wakeup);
        assert!(m.enable_features(Feature::Aec, true).is_err());
        assert!(!m.features().aec);
    }
}
