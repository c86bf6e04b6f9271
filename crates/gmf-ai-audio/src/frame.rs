//! Fixed-quantum processing shared by the wake word and echo cancel elements.
//!
//! Both elements consume exactly one frame of interleaved 16-bit capture per
//! call and produce one mono chunk. A [`PayloadCache`] cuts whatever the
//! upstream element delivers into those frames, and a [`ChannelFormat`]
//! puts the channels into the order the engines expect.

use gmf_core::{Error, EventKind, EventPacket, IoError, IoResult, JobStatus, PayloadCache, Port, Result, SoundInfo};

/// Bytes per 16-bit sample.
pub const SAMPLE_BYTES: usize = 2;

/// Sample rate accepted by the fixed-quantum elements.
pub const AI_SAMPLE_RATE: u32 = 16_000;

/// Sample width accepted by the fixed-quantum elements.
pub const AI_BITS: u16 = 16;

/// Channel layout of interleaved capture, one letter per channel.
///
/// `M` marks a microphone, `R` a playback reference and `N` an unused
/// channel. Sorting moves microphones first, then references, then unused
/// channels, keeping the relative order within each group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFormat {
    format: String,
    order: Vec<usize>,
    mics: usize,
    refs: usize,
}

impl ChannelFormat {
    /// Parses a format such as `"MMNR"`. Letters are case-insensitive.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for an empty format, an unknown letter or a
    /// format without a microphone.
    pub fn parse(format: &str) -> Result<Self> {
        let format = format.to_ascii_uppercase();
        if let Some(bad) = format.chars().find(|c| !matches!(c, 'M' | 'R' | 'N')) {
            return Err(Error::invalid_arg(format!("channel format {format:?}: unknown channel '{bad}'")));
        }
        let positions = |want: char| format.char_indices().filter(move |&(_, c)| c == want).map(|(i, _)| i);
        let mut order: Vec<usize> = positions('M').collect();
        let mics = order.len();
        if mics == 0 {
            return Err(Error::invalid_arg(format!("channel format {format:?} has no microphone")));
        }
        order.extend(positions('R'));
        let refs = order.len() - mics;
        order.extend(positions('N'));
        Ok(Self {
            format,
            order,
            mics,
            refs,
        })
    }

    /// Interleaved channel count.
    pub fn channels(&self) -> usize {
        self.order.len()
    }

    /// Microphone channels, placed first after sorting.
    pub fn mics(&self) -> usize {
        self.mics
    }

    /// Reference channels, placed right after the microphones.
    pub fn refs(&self) -> usize {
        self.refs
    }

    /// The normalised format string.
    pub fn as_str(&self) -> &str {
        &self.format
    }

    /// Reorders whole interleaved frames of `input` into `out`.
    ///
    /// Both slices hold the same number of samples; a trailing partial frame
    /// is left untouched.
    pub fn sort(&self, input: &[i16], out: &mut [i16]) {
        let ch = self.channels();
        for (src, dst) in input.chunks_exact(ch).zip(out.chunks_exact_mut(ch)) {
            for (slot, &from) in dst.iter_mut().zip(&self.order) {
                *slot = src[from];
            }
        }
    }
}

/// Rejects an upstream format report other than 16 kHz 16-bit.
pub(crate) fn check_format(tag: &str, event: &EventPacket) -> Result<()> {
    let Some(info) = event.info.filter(|_| event.kind == EventKind::ReportInfo) else {
        return Ok(());
    };
    if info.sample_rate != AI_SAMPLE_RATE || info.bits != AI_BITS {
        tracing::error!(el = tag, from = %event.from, rate = info.sample_rate, bits = info.bits, "unsupported format");
        return Err(Error::not_support(format!("{} Hz {}-bit input", info.sample_rate, info.bits)));
    }
    Ok(())
}

/// Format of the mono output both elements produce.
pub(crate) fn mono_info() -> SoundInfo {
    SoundInfo {
        sample_rate: AI_SAMPLE_RATE,
        channels: 1,
        bits: AI_BITS,
    }
}

/// Little-endian bytes to samples, reusing `out`.
pub(crate) fn to_samples(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(bytes.chunks_exact(SAMPLE_BYTES).map(|b| i16::from_le_bytes([b[0], b[1]])));
}

/// Samples to little-endian bytes, reusing `out`.
pub(crate) fn to_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
}

enum Step {
    /// Not a whole frame; the flag is the end of the stream.
    Short(bool),
    /// A frame went out; the flag is the end of the stream.
    Frame(IoResult<bool>),
    Failed,
}

/// One process call of a fixed-quantum element.
///
/// Loads input into `cache` when it is drained, then hands one whole
/// `frame_len`-byte frame to `compute`, which fills `out_buf` with the
/// output bytes.
///
/// Returns `Continue` when the cache holds less than a frame, `Truncate`
/// while the held input still has bytes, and `Done` at the end of the
/// stream. A short final frame is dropped.
pub(crate) fn process_frame(
    tag: &str,
    cache: &mut PayloadCache,
    inp: &mut Port,
    out: Option<&mut Port>,
    frame_len: usize,
    out_buf: &mut Vec<u8>,
    compute: impl FnOnce(&[u8], &mut Vec<u8>),
) -> JobStatus {
    if cache.ready_for_load() {
        let loaded = match inp.acquire_in(frame_len) {
            Ok(load) => cache.load(load),
            Err(IoError::Abort) => {
                tracing::debug!(el = tag, "input aborted");
                return JobStatus::Ok;
            }
            Err(e) => {
                tracing::error!(el = tag, "input acquire failed: {e}");
                return JobStatus::Fail;
            }
        };
        if let Err(e) = loaded {
            tracing::error!(el = tag, "cache load failed: {e}");
            return release_failed(tag, inp);
        }
    }
    let Some(load) = inp.payload() else {
        return JobStatus::Fail;
    };
    let step = match cache.acquire(load, frame_len) {
        Ok(chunk) if chunk.len() < frame_len => Step::Short(chunk.is_done()),
        Ok(chunk) => {
            let done = chunk.is_done();
            compute(&chunk, &mut *out_buf);
            Step::Frame(write_out(out, out_buf.as_slice(), done).map(|()| done))
        }
        Err(e) => {
            tracing::error!(el = tag, "cache acquire failed: {e}");
            Step::Failed
        }
    };
    cache.release();

    match step {
        Step::Short(done) => {
            tracing::trace!(el = tag, cached = cache.cached_size(), done, "short frame");
            match release(tag, inp) {
                JobStatus::Ok if done => JobStatus::Done,
                JobStatus::Ok => JobStatus::Continue,
                status => status,
            }
        }
        Step::Frame(Ok(_)) if !cache.ready_for_load() => JobStatus::Truncate,
        Step::Frame(Ok(done)) => match release(tag, inp) {
            JobStatus::Ok if done => JobStatus::Done,
            status => status,
        },
        Step::Frame(Err(IoError::Abort)) => release(tag, inp),
        Step::Frame(Err(e)) => {
            tracing::error!(el = tag, "output failed: {e}");
            release_failed(tag, inp)
        }
        Step::Failed => release_failed(tag, inp),
    }
}

fn write_out(out: Option<&mut Port>, data: &[u8], done: bool) -> IoResult<()> {
    let Some(out) = out else {
        return Ok(());
    };
    let load = out.acquire_out(data.len())?;
    if let Err(e) = load.fill_from(data) {
        tracing::error!("output buffer too small: {e}");
        let _ = load.set_valid_size(0);
        out.release_out()?;
        return Err(IoError::Fail);
    }
    load.set_done(done);
    out.release_out()
}

fn release(tag: &str, inp: &mut Port) -> JobStatus {
    match inp.release_in() {
        Ok(()) => JobStatus::Ok,
        Err(e) => {
            tracing::error!(el = tag, "input release failed: {e}");
            JobStatus::Fail
        }
    }
}

fn release_failed(tag: &str, inp: &mut Port) -> JobStatus {
    if let Err(e) = inp.release_in() {
        tracing::warn!(el = tag, "input release after failure: {e}");
    }
    JobStatus::Fail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_microphones_then_references() {
        let format = ChannelFormat::parse("rmnm").unwrap();
        assert_eq!(format.as_str(), "RMNM");
        assert_eq!((format.channels(), format.mics(), format.refs()), (4, 2, 1));
        let input = [10, 11, 12, 13, 20, 21, 22, 23];
        let mut out = [0i16; 8];
        format.sort(&input, &mut out);
        assert_eq!(out, [11, 13, 10, 12, 21, 23, 20, 22]);
    }

    #[test]
    fn rejects_bad_formats() {
        for bad in ["", "MX", "RRN"] {
            assert!(matches!(ChannelFormat::parse(bad), Err(Error::InvalidArg(_))), "{bad:?}");
        }
    }

    #[test]
    fn only_16k_16bit_reports_pass() {
        let report = |sample_rate, bits| {
            EventPacket::info(
                "up",
                SoundInfo {
                    sample_rate,
                    channels: 2,
                    bits,
                },
            )
        };
        assert!(check_format("el", &report(16_000, 16)).is_ok());
        assert!(matches!(check_format("el", &report(48_000, 16)), Err(Error::NotSupport(_))));
        assert!(matches!(check_format("el", &report(16_000, 24)), Err(Error::NotSupport(_))));
    }

    #[test]
    fn sample_conversion_is_little_endian() {
        let mut samples = Vec::new();
        to_samples(&[0x01, 0x02, 0xff, 0xff], &mut samples);
        assert_eq!(samples, [0x0201, -1]);
        let mut bytes = Vec::new();
        to_bytes(&samples, &mut bytes);
        assert_eq!(bytes, [0x01, 0x02, 0xff, 0xff]);
    }
}
