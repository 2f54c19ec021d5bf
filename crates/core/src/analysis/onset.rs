// Spectral-flux onset detection over one analysis window.
//
// 1. Hann-windowed STFT frames of `frame_length`, advanced by `hop_length`
// 2. Log-compressed magnitudes: ln(1 + |X[k]|)
// 3. Onset strength: mean over bins of max(0, S_t[k] - S_(t-1)[k])
// 4. Normalise the strength curve to [0, 1]; the raw curve is kept for
//    loudness-dependent beat strength
// 5. Peak pick: local max over the last 30 ms, above the ±100 ms local mean
//    by `threshold`, at least 30 ms after the previous onset

use super::spectrum::{hann_window, Spectrum};
use crate::Result;

/// Raw strength curves below this are treated as silence.
const MIN_STRENGTH: f32 = 1e-4;
const PRE_MAX_SECONDS: f64 = 0.03;
const AVG_SECONDS: f64 = 0.10;
const WAIT_SECONDS: f64 = 0.03;

/// Result of running the detector over one window.
#[derive(Debug, Clone, Default)]
pub struct OnsetAnalysis {
    /// Onset strength per STFT frame, normalised to [0, 1]. Used for peak
    /// picking only.
    pub envelope: Vec<f32>,
    /// Unnormalised onset strength per STFT frame.
    pub raw: Vec<f32>,
    /// Frame indices picked as onsets.
    pub onset_frames: Vec<usize>,
    /// Centre time of each frame, in seconds from the window start.
    pub frame_times: Vec<f64>,
}

impl OnsetAnalysis {
    /// Onset times in seconds from the window start.
    pub fn onset_times(&self) -> impl Iterator<Item = f64> + '_ {
        self.onset_frames.iter().map(|&frame| self.frame_times[frame])
    }

    /// Largest raw strength over the trailing `frames` frames.
    pub fn recent_strength(&self, frames: usize) -> f32 {
        let start = self.raw.len().saturating_sub(frames);
        self.raw[start..]
            .iter()
            .copied()
            .fold(0.0_f32, f32::max)
    }
}

#[derive(Debug)]
pub struct OnsetDetector {
    sample_rate: u32,
    frame_length: usize,
    hop_length: usize,
    threshold: f32,
    window: Vec<f32>,
    spectrum: Spectrum,
    current: Vec<f32>,
    previous: Vec<f32>,
}

impl OnsetDetector {
    pub fn new(sample_rate: u32, frame_length: usize, hop_length: usize, threshold: f64) -> Self {
        let frame_length = frame_length.max(2);
        Self {
            sample_rate,
            frame_length,
            hop_length: hop_length.max(1),
            threshold: threshold as f32,
            window: hann_window(frame_length),
            spectrum: Spectrum::new(),
            current: Vec::with_capacity(frame_length / 2 + 1),
            previous: Vec::with_capacity(frame_length / 2 + 1),
        }
    }

    pub fn frames_per_second(&self) -> f64 {
        self.sample_rate as f64 / self.hop_length as f64
    }

    /// Computes the raw (unnormalised) onset-strength curve.
    pub fn strength(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() < self.frame_length {
            return Ok(Vec::new());
        }

        let frames = (samples.len() - self.frame_length) / self.hop_length + 1;
        let mut strength = Vec::with_capacity(frames);
        self.previous.clear();

        for frame in 0..frames {
            let start = frame * self.hop_length;
            let chunk = &samples[start..start + self.frame_length];
            self.spectrum
                .magnitudes(chunk, Some(&self.window), &mut self.current)?;
            for magnitude in self.current.iter_mut() {
                *magnitude = magnitude.ln_1p();
            }

            let flux = if self.previous.is_empty() {
                0.0
            } else {
                let rise: f32 = self
                    .current
                    .iter()
                    .zip(&self.previous)
                    .map(|(now, before)| (now - before).max(0.0))
                    .sum();
                rise / self.current.len() as f32
            };
            strength.push(flux);
            std::mem::swap(&mut self.current, &mut self.previous);
        }

        Ok(strength)
    }

    /// Runs strength computation, normalisation and peak picking.
    pub fn detect(&mut self, samples: &[f32]) -> Result<OnsetAnalysis> {
        let raw = self.strength(samples)?;
        let rate = self.sample_rate.max(1) as f64;
        let frame_times = (0..raw.len())
            .map(|frame| (frame * self.hop_length + self.frame_length / 2) as f64 / rate)
            .collect();

        let envelope = normalise(&raw);
        let onset_frames = if envelope.is_empty() {
            Vec::new()
        } else {
            self.pick_peaks(&envelope)
        };

        Ok(OnsetAnalysis {
            envelope,
            raw,
            onset_frames,
            frame_times,
        })
    }

    fn pick_peaks(&self, envelope: &[f32]) -> Vec<usize> {
        let fps = self.frames_per_second();
        let pre_max = (PRE_MAX_SECONDS * fps) as usize;
        let avg = (AVG_SECONDS * fps) as usize;
        let wait = (WAIT_SECONDS * fps) as usize;

        let mut peaks = Vec::new();
        let mut last: Option<usize> = None;

        for (index, &value) in envelope.iter().enumerate() {
            let max_start = index.saturating_sub(pre_max);
            let local_max = envelope[max_start..=index]
                .iter()
                .copied()
                .fold(f32::MIN, f32::max);
            if value < local_max {
                continue;
            }

            let avg_start = index.saturating_sub(avg);
            let avg_end = (index + avg + 1).min(envelope.len());
            let neighbourhood = &envelope[avg_start..avg_end];
            let mean = neighbourhood.iter().sum::<f32>() / neighbourhood.len() as f32;
            if value < mean + self.threshold {
                continue;
            }

            if last.map_or(true, |previous| index - previous > wait) {
                peaks.push(index);
                last = Some(index);
            }
        }

        peaks
    }
}

fn normalise(raw: &[f32]) -> Vec<f32> {
    let (min, max) = raw
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if raw.is_empty() || max < MIN_STRENGTH || max - min <= f32::EPSILON {
        return vec![0.0; raw.len()];
    }

    raw.iter().map(|value| (value - min) / (max - min)).collect()
}
