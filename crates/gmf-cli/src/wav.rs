//! 16-bit PCM WAV files as interleaved little-endian bytes.

use std::path::Path;

use anyhow::{Context, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

/// Decoded recording.
pub struct Pcm {
    pub spec: WavSpec,
    pub bytes: Vec<u8>,
}

impl Pcm {
    /// Bytes per interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        2 * usize::from(self.spec.channels)
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        let frames = self.bytes.len() / self.frame_bytes();
        frames as f64 / f64::from(self.spec.sample_rate)
    }
}

/// Reads a 16-bit integer PCM file.
pub fn read_pcm16(path: &Path) -> anyhow::Result<Pcm> {
    let reader = WavReader::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!(
            "{}: expected 16-bit integer PCM, found {}-bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    let mut bytes = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.into_samples::<i16>() {
        bytes.extend_from_slice(&sample?.to_le_bytes());
    }
    tracing::debug!(path = %path.display(), channels = spec.channels, bytes = bytes.len(), "wav read");
    Ok(Pcm { spec, bytes })
}

/// Writes interleaved bytes as 16-bit PCM. A trailing partial frame is dropped.
pub fn write_pcm16(path: &Path, spec: WavSpec, bytes: &[u8]) -> anyhow::Result<()> {
    let frame = 2 * usize::from(spec.channels);
    let whole = bytes.len() / frame * frame;
    let mut writer = WavWriter::create(path, spec).with_context(|| format!("failed to create {}", path.display()))?;
    for pair in bytes[..whole].chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}
