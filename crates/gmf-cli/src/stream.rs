//! Drives a pipeline between two in-memory rings: a feeder thread writes the
//! input, a drain thread collects the output.

use std::sync::Arc;
use std::thread;

use anyhow::{Context, bail};
use crossbeam_channel::unbounded;
use gmf_core::{
    BusReader, BusWriter, DataBus, EventKind, EventPacket, EventState, IoError, IoResult, Pipeline, PortIo, Task,
    TaskConfig, Wait, new_ringbuf,
};

const RING_BYTES: usize = 64 * 1024;
const FEED_CHUNK: usize = 4096;

/// Source and sink rings with their pipeline IOs.
pub struct Rings {
    pub src: Arc<dyn DataBus>,
    pub dst: Arc<dyn DataBus>,
}

impl Rings {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            src: new_ringbuf(1, RING_BYTES)?,
            dst: new_ringbuf(1, RING_BYTES)?,
        })
    }

    pub fn reader(&self) -> Arc<dyn PortIo> {
        Arc::new(BusReader(Arc::clone(&self.src)))
    }

    pub fn writer(&self) -> Arc<dyn PortIo> {
        Arc::new(BusWriter(Arc::clone(&self.dst)))
    }
}

fn feed(bus: &dyn DataBus, input: &[u8]) -> IoResult<()> {
    if input.is_empty() {
        bus.done_write();
        return Ok(());
    }
    let chunks = input.len().div_ceil(FEED_CHUNK);
    for (i, chunk) in input.chunks(FEED_CHUNK).enumerate() {
        bus.write(chunk, i + 1 == chunks, Wait::Forever)?;
    }
    Ok(())
}

fn drain(bus: &dyn DataBus) -> IoResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; FEED_CHUNK];
    loop {
        let (n, last) = bus.read(&mut buf, Wait::Forever)?;
        out.extend_from_slice(&buf[..n]);
        if last {
            return Ok(out);
        }
    }
}

/// Runs `pipeline` over `input` and returns everything it wrote to `rings.dst`.
pub fn run_through(pipeline: &mut Pipeline, rings: &Rings, input: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (tx, rx) = unbounded();
    pipeline.set_event(Arc::new(move |evt: &EventPacket| {
        if evt.kind == EventKind::ChangeState
            && matches!(evt.state, EventState::Finished | EventState::Stopped | EventState::Error)
        {
            let _ = tx.send(evt.state);
        }
    }));
    pipeline.bind_task(Task::new(TaskConfig::default())?);
    pipeline.loading_jobs()?;
    pipeline.run()?;

    let (state, fed, drained) = thread::scope(|s| {
        let feeder = s.spawn(|| feed(rings.src.as_ref(), input));
        let drainer = s.spawn(|| drain(rings.dst.as_ref()));
        let state = rx.recv().unwrap_or(EventState::Error);
        if state != EventState::Finished {
            rings.src.abort();
            rings.dst.abort();
        }
        let fed = feeder.join().unwrap_or(Err(IoError::Fail));
        let drained = drainer.join().unwrap_or(Err(IoError::Fail));
        (state, fed, drained)
    });

    if state != EventState::Finished {
        bail!("pipeline '{}' ended in state {}", pipeline.name(), state.as_str());
    }
    fed.context("feeding the pipeline failed")?;
    let out = drained.context("collecting pipeline output failed")?;
    tracing::info!(pipeline = pipeline.name(), input = input.len(), output = out.len(), "pipeline finished");
    Ok(out)
}
