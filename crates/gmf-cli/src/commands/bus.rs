//! Push a generated byte stream through a data bus and check it arrives intact.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use clap::Args;
use gmf_config::BusType;
use gmf_core::{BusKind, DataBus, IoError, IoResult, Payload, Wait};

use crate::profile;

/// pbuf never blocks; both sides poll at this period instead.
const PBUF_POLL: Duration = Duration::from_millis(1);

/// Stream bytes through a bus between a producer and a consumer thread.
#[derive(Args)]
pub struct BusArgs {
    /// Profile to take the [bus] section from
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Bus flavour: ringbuf, block, fifo or pbuf
    #[arg(short, long)]
    pub kind: Option<BusType>,

    /// Blocks (block, ringbuf) or buffers (fifo, pbuf)
    #[arg(long)]
    pub blocks: Option<usize>,

    /// Bytes per block
    #[arg(long)]
    pub size: Option<usize>,

    /// Total bytes to send
    #[arg(long, default_value_t = 65536)]
    pub bytes: usize,

    /// Bytes per write
    #[arg(short, long, default_value_t = 1000)]
    pub write: usize,

    /// Bytes per read
    #[arg(short, long, default_value_t = 700)]
    pub read: usize,
}

/// Run the bus command.
pub fn run(args: BusArgs) -> anyhow::Result<()> {
    if args.write == 0 || args.read == 0 {
        bail!("--write and --read must be non-zero");
    }
    let mut section = profile::load(args.profile.as_deref())?.bus;
    if let Some(kind) = args.kind {
        section.kind = kind;
    }
    if let Some(blocks) = args.blocks {
        section.blocks = blocks;
    }
    if let Some(size) = args.size {
        section.size = size;
    }
    gmf_config::validate_bus(&section)?;
    let bus = section.build()?;
    let polls = section.kind == BusType::Pbuf;

    let input = pattern(args.bytes);
    let sent = fnv1a(&input);
    let start = Instant::now();

    let (written, received) = thread::scope(|s| {
        let producer = s.spawn(|| produce(bus.as_ref(), &input, args.write, polls));
        let consumer = s.spawn(|| consume(bus.as_ref(), args.read, polls));
        let written = producer.join().unwrap_or(Err(IoError::Fail));
        if written.is_err() {
            bus.abort();
        }
        let received = consumer.join().unwrap_or(Err(IoError::Fail));
        (written, received)
    });
    let elapsed = start.elapsed();
    let writes = written.map_err(|e| anyhow::anyhow!("producer failed: {e}"))?;
    let received = received.map_err(|e| anyhow::anyhow!("consumer failed: {e}"))?;
    let got = fnv1a(&received.data);

    println!("Bus:       {} ({} x {} bytes)", bus.name(), section.blocks, section.size);
    println!("Written:   {} bytes in {} writes", input.len(), writes);
    println!("Read:      {} bytes in {} reads", received.data.len(), received.reads);
    println!("Checksum:  {:016x} / {:016x}", sent, got);
    println!("Elapsed:   {:.3} ms", elapsed.as_secs_f64() * 1000.0);

    if received.data != input {
        bail!("stream corrupted: {} bytes sent, {} bytes received", input.len(), received.data.len());
    }
    println!("Result:    ok");
    Ok(())
}

/// Deterministic test stream that does not repeat on short periods.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) ^ (i >> 8)) as u8).collect()
}

fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |h, &b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
}

fn produce(bus: &dyn DataBus, input: &[u8], write: usize, polls: bool) -> IoResult<usize> {
    if input.is_empty() {
        bus.done_write();
        return Ok(0);
    }
    let chunks = input.len().div_ceil(write);
    for (i, chunk) in input.chunks(write).enumerate() {
        loop {
            match bus.write(chunk, i + 1 == chunks, Wait::Forever) {
                Ok(()) => break,
                Err(IoError::Fail) if polls => thread::sleep(PBUF_POLL),
                Err(e) => return Err(e),
            }
        }
    }
    Ok(chunks)
}

struct Received {
    data: Vec<u8>,
    reads: usize,
}

fn consume(bus: &dyn DataBus, read: usize, polls: bool) -> IoResult<Received> {
    let mut data = Vec::new();
    let mut reads = 0;
    loop {
        let mut load = match bus.kind() {
            BusKind::Byte => Payload::with_len(read).map_err(|_| IoError::Fail)?,
            BusKind::Block => Payload::new(),
        };
        match bus.acquire_read(&mut load, read, Wait::Forever) {
            Ok(()) => {}
            Err(IoError::Fail) if polls => {
                thread::sleep(PBUF_POLL);
                continue;
            }
            Err(e) => return Err(e),
        }
        let n = load.valid_size();
        data.extend_from_slice(&load.data()[..n]);
        let done = load.is_done();
        bus.release_read(&mut load, Wait::Forever)?;
        if n > 0 {
            reads += 1;
        }
        if done {
            tracing::debug!(bus = bus.name(), reads, bytes = data.len(), "consumer saw end of stream");
            return Ok(Received { data, reads });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn pattern_is_not_constant() {
        let p = pattern(512);
        assert_ne!(p[..256], p[256..]);
    }

    #[test]
    fn every_bus_kind_delivers_the_stream() {
        let input = pattern(20_000);
        for (bus, polls) in [
            (gmf_core::new_ringbuf(1, 4096).unwrap(), false),
            (gmf_core::new_block(1, 4096).unwrap(), false),
            (gmf_core::new_fifo(4, 1024).unwrap(), false),
            (gmf_core::new_pbuf(4).unwrap(), true),
        ] {
            let bus: Arc<dyn DataBus> = bus;
            let received = thread::scope(|s| {
                s.spawn(|| produce(bus.as_ref(), &input, 1000, polls).unwrap());
                s.spawn(|| consume(bus.as_ref(), 1024, polls).unwrap()).join().unwrap()
            });
            assert_eq!(received.data, input, "{}", bus.name());
        }
    }
}
