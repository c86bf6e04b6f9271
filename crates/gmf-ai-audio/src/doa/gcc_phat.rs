//! GCC-PHAT direction estimation for a two-microphone pair.
//!
//! The cross spectrum of the pair is whitened (phase transform) and then
//! steered over a grid of candidate angles; the angle whose expected
//! inter-microphone delay best aligns the phases wins.
//!
//! Angles follow the array convention used throughout this crate: 0° points
//! towards the left microphone, 90° is broadside and 180° points towards the
//! right microphone.

use std::f32::consts::PI;
use std::sync::Arc;

use gmf_core::{Error, Result};
use rustfft::{FftPlanner, num_complex::Complex};

/// Speed of sound in air, m/s.
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Turns a block of left/right samples into an angle in degrees.
pub trait DirectionEstimator: Send {
    /// Samples per channel expected by [`process`](Self::process).
    fn frame_size(&self) -> usize;

    /// Estimates the source angle in [0, 180].
    fn process(&mut self, left: &[i16], right: &[i16]) -> f32;
}

/// Geometry and resolution of a [`GccPhatEstimator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GccPhatParams {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Angle grid step in degrees.
    pub resolution_deg: f32,
    /// Distance between the two microphones in metres.
    pub mic_distance: f32,
    /// Samples per channel per estimate.
    pub frame_size: usize,
}

impl Default for GccPhatParams {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            resolution_deg: 10.0,
            mic_distance: 0.06,
            frame_size: 256,
        }
    }
}

/// Phase-transform weighted cross-correlation estimator.
pub struct GccPhatEstimator {
    fft: Arc<dyn rustfft::Fft<f32>>,
    fft_size: usize,
    frame_size: usize,
    /// Candidate angles and their delays in samples.
    grid: Vec<(f32, f32)>,
    left: Vec<Complex<f32>>,
    right: Vec<Complex<f32>>,
    cross: Vec<Complex<f32>>,
}

impl std::fmt::Debug for GccPhatEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GccPhatEstimator")
            .field("fft_size", &self.fft_size)
            .field("frame_size", &self.frame_size)
            .field("angles", &self.grid.len())
            .finish_non_exhaustive()
    }
}

impl GccPhatEstimator {
    /// Plans the FFT and the steering grid.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] when any parameter is zero, negative or not
    /// finite, or the resolution exceeds 180°.
    pub fn new(params: GccPhatParams) -> Result<Self> {
        let GccPhatParams {
            sample_rate,
            resolution_deg,
            mic_distance,
            frame_size,
        } = params;
        if sample_rate == 0 || frame_size == 0 {
            return Err(Error::invalid_arg("sample rate and frame size must be non-zero"));
        }
        if !(resolution_deg.is_finite() && resolution_deg > 0.0 && resolution_deg <= 180.0) {
            return Err(Error::invalid_arg(format!("resolution {resolution_deg}°")));
        }
        if !(mic_distance.is_finite() && mic_distance > 0.0) {
            return Err(Error::invalid_arg(format!("mic distance {mic_distance} m")));
        }

        let fft_size = (2 * frame_size).next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        #[allow(clippy::cast_precision_loss)]
        let max_delay = mic_distance * sample_rate as f32 / SPEED_OF_SOUND;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let steps = (180.0 / resolution_deg).floor() as usize;
        let grid = (0..=steps)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let angle = i as f32 * resolution_deg;
                (angle, max_delay * libm::cosf(angle.to_radians()))
            })
            .collect();

        tracing::debug!(fft_size, frame_size, max_delay, "gcc-phat planned");
        Ok(Self {
            fft,
            fft_size,
            frame_size,
            grid,
            left: Vec::with_capacity(fft_size),
            right: Vec::with_capacity(fft_size),
            cross: Vec::with_capacity(fft_size / 2 + 1),
        })
    }

    /// FFT length used per estimate.
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn spectrum(fft: &dyn rustfft::Fft<f32>, samples: &[i16], buffer: &mut Vec<Complex<f32>>, size: usize) {
        buffer.clear();
        buffer.extend(samples.iter().map(|&s| Complex::new(f32::from(s) / 32768.0, 0.0)));
        buffer.resize(size, Complex::new(0.0, 0.0));
        fft.process(buffer);
    }
}

impl DirectionEstimator for GccPhatEstimator {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn process(&mut self, left: &[i16], right: &[i16]) -> f32 {
        let n = left.len().min(right.len()).min(self.frame_size);
        Self::spectrum(self.fft.as_ref(), &left[..n], &mut self.left, self.fft_size);
        Self::spectrum(self.fft.as_ref(), &right[..n], &mut self.right, self.fft_size);

        // Whitened cross spectrum over the positive bins, DC skipped
        self.cross.clear();
        let mut energy = 0.0f32;
        for k in 1..=self.fft_size / 2 {
            let g = self.left[k] * self.right[k].conj();
            let mag = g.norm();
            energy += mag;
            if mag > 1e-12 {
                self.cross.push(g / mag);
            } else {
                self.cross.push(Complex::new(0.0, 0.0));
            }
        }
        if energy <= 1e-9 {
            return 90.0;
        }

        #[allow(clippy::cast_precision_loss)]
        let bin_step = 2.0 * PI / self.fft_size as f32;
        let mut best = (90.0, f32::NEG_INFINITY);
        for &(angle, delay) in &self.grid {
            let score: f32 = self
                .cross
                .iter()
                .enumerate()
                .map(|(i, g)| {
                    #[allow(clippy::cast_precision_loss)]
                    let phase = bin_step * (i + 1) as f32 * delay;
                    g.re * libm::cosf(phase) + g.im * libm::sinf(phase)
                })
                .sum();
            if score > best.1 {
                best = (angle, score);
            }
        }
        best.0
    }
}

/// Gaussian window of `size` taps centred on the middle tap, normalised to
/// sum to one.
pub fn gaussian_weights(size: usize, sigma: f32) -> Vec<f32> {
    if size == 0 {
        return Vec::new();
    }
    #[allow(clippy::cast_precision_loss)]
    let centre = (size - 1) as f32 / 2.0;
    let mut weights: Vec<f32> = (0..size)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let x = i as f32 - centre;
            libm::expf(-(x * x) / (2.0 * sigma * sigma))
        })
        .collect();
    let sum: f32 = weights.iter().sum();
    if sum > 0.0 {
        for w in &mut weights {
            *w /= sum;
        }
    }
    weights
}

/// Pulls angles away from broadside; the correction grows linearly with the
/// offset from 90°. The result is clamped to [0, 180].
pub fn calibrate(angle: f32) -> f32 {
    let angle = angle.clamp(0.0, 180.0);
    let offset = angle - 90.0;
    let factor = 1.0 + offset.abs() / 90.0 * 0.25;
    (90.0 + offset * factor).clamp(0.0, 180.0)
}
