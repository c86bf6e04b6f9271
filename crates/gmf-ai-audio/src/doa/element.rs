//! Pipeline element that estimates direction while passing capture through.

use crossbeam_channel::Sender;
use gmf_core::elements::pass_through;
use gmf_core::{Capability, Element, ElementConfig, ElementCore, ElementOps, IoError, JobStatus, Result};

use super::estimator::{CAPTURE_CHANNELS, DoaConfig, DoaProcessor};

/// Sends one calibrated angle per whole chunk of 4-channel capture and
/// forwards the capture unchanged.
pub struct DoaElement {
    processor: DoaProcessor,
    chunk_bytes: usize,
    pending: Vec<u8>,
    angles: Sender<f32>,
}

impl std::fmt::Debug for DoaElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoaElement")
            .field("chunk_bytes", &self.chunk_bytes)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl DoaElement {
    /// Element publishing angles on `angles`.
    ///
    /// # Errors
    ///
    /// Propagates geometry errors from [`DoaProcessor::new`].
    pub fn new(config: &DoaConfig, angles: Sender<f32>) -> Result<Self> {
        Ok(Self {
            processor: DoaProcessor::new(config)?,
            chunk_bytes: config.chunk_bytes,
            pending: Vec::with_capacity(config.chunk_bytes * 2),
            angles,
        })
    }

    /// Wraps into a pipeline element.
    pub fn into_element(self, tag: &str) -> Element {
        let config = ElementConfig {
            data_size: self.chunk_bytes,
            alignment: 2 * CAPTURE_CHANNELS,
            ..ElementConfig::default()
        };
        Element::new(tag, config, Box::new(self))
    }

    fn consume(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        let whole = self.pending.len() / self.chunk_bytes * self.chunk_bytes;
        for chunk in self.pending[..whole].chunks_exact(self.chunk_bytes) {
            let angle = self.processor.process_chunk(chunk);
            // a dropped receiver only silences the estimates
            let _ = self.angles.send(angle);
        }
        self.pending.drain(..whole);
    }
}

impl ElementOps for DoaElement {
    fn open(&mut self, _core: &mut ElementCore) -> JobStatus {
        self.pending.clear();
        self.processor.reset();
        JobStatus::Ok
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let tag = core.tag().to_owned();
        let (Some(inp), out) = core.ports_mut() else {
            return JobStatus::Fail;
        };
        match inp.acquire_in(self.chunk_bytes) {
            Ok(_) => {}
            Err(IoError::Abort) => {
                tracing::debug!(el = %tag, "input aborted");
                return JobStatus::Ok;
            }
            Err(e) => {
                tracing::error!(el = %tag, "doa input failed: {e}");
                return JobStatus::Fail;
            }
        }
        let mut done = false;
        if let Some(load) = inp.payload() {
            done = load.is_done();
            let valid = load.valid_size();
            let data = load.data();
            self.consume(&data[..valid]);
        }
        if let Some(out) = out {
            if let Err(e) = pass_through(inp, out) {
                if let Err(release) = inp.release_in() {
                    tracing::warn!(el = %tag, "input release after failure: {release}");
                }
                if e.is_abort() {
                    return JobStatus::Ok;
                }
                tracing::error!(el = %tag, "doa output failed: {e}");
                return JobStatus::Fail;
            }
        }
        if let Err(e) = inp.release_in() {
            tracing::error!(el = %tag, "input release failed: {e}");
            return JobStatus::Fail;
        }
        if done {
            if !self.pending.is_empty() {
                tracing::debug!(el = %tag, left = self.pending.len(), "partial doa chunk dropped at end");
            }
            JobStatus::Done
        } else {
            JobStatus::Ok
        }
    }

    fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
        self.pending.clear();
        JobStatus::Ok
    }

    fn caps(&self) -> Vec<Capability> {
        vec![Capability::new("DOA")]
    }
}
