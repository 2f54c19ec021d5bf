//! Feature extraction from the streaming audio buffer.
//!
//! One [`FeatureExtractor::tick`] per analysis period turns the latest
//! [`AudioWindow`] into an immutable [`AudioFeatures`] snapshot, which is
//! published through a [`FeatureSlot`] for the effects loop and status
//! readers.

mod onset;
mod spectrum;
mod tempo;

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::{
    config::{AnalysisConfig, BandRange},
    AudioWindow, LightshowError, Result, RingBuffer,
};

pub use onset::{OnsetAnalysis, OnsetDetector};
pub use tempo::{OnsetHistory, TempoEstimator, DEFAULT_TEMPO_BPM, ONSET_HISTORY_CAPACITY};

use spectrum::Spectrum;

/// Onsets closer to the window end than this count as a beat.
const BEAT_TAIL_SECONDS: f64 = 0.1;
/// Frames of the raw onset-strength curve inspected for beat strength.
const STRENGTH_FRAMES: usize = 10;
/// The same onset seen in consecutive overlapping windows is reported once.
const MIN_ONSET_SPACING_SECONDS: f64 = 0.1;

/// Mean spectral magnitude per configured band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandEnergy {
    pub bass: f64,
    pub mid: f64,
    pub treble: f64,
}

/// Snapshot of the musical features for one analysis tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub volume: f64,
    pub smoothed_volume: f64,
    pub beat_detected: bool,
    /// Peak of the raw onset-strength curve over the last few frames. Louder
    /// onsets give larger values; not bounded to [0, 1].
    pub beat_strength: f64,
    /// Beats reported since the extractor started. Consumers compare it with
    /// the last count they saw so no beat is missed or handled twice.
    pub beat_count: u64,
    pub tempo_bpm: f64,
    pub band_energy: BandEnergy,
    pub time_since_beat: f64,
}

impl Default for AudioFeatures {
    fn default() -> Self {
        Self {
            volume: 0.0,
            smoothed_volume: 0.0,
            beat_detected: false,
            beat_strength: 0.0,
            beat_count: 0,
            tempo_bpm: DEFAULT_TEMPO_BPM,
            band_energy: BandEnergy::default(),
            time_since_beat: 0.0,
        }
    }
}

/// Single-writer, multi-reader slot holding the latest features. Readers
/// always see a complete snapshot.
#[derive(Debug)]
pub struct FeatureSlot {
    current: ArcSwap<AudioFeatures>,
}

impl FeatureSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(AudioFeatures::default()),
        }
    }

    pub fn publish(&self, features: AudioFeatures) {
        self.current.store(Arc::new(features));
    }

    pub fn load(&self) -> Arc<AudioFeatures> {
        self.current.load_full()
    }
}

impl Default for FeatureSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes volume, band energy, beats and tempo from analysis windows.
pub struct FeatureExtractor {
    config: AnalysisConfig,
    sample_rate: u32,
    window_len: usize,
    spectrum: Spectrum,
    magnitudes: Vec<f32>,
    onsets: OnsetDetector,
    tempo: TempoEstimator,
    features: AudioFeatures,
    last_beat_at: Option<f64>,
    last_onset_sample: Option<u64>,
    failed_ticks: u64,
}

impl FeatureExtractor {
    pub fn new(config: AnalysisConfig, sample_rate: u32) -> Self {
        let window_len = config.window_len(sample_rate);
        let onsets = OnsetDetector::new(
            sample_rate,
            config.frame_length,
            config.hop_length,
            config.onset_threshold,
        );
        let tempo = TempoEstimator::new(config.min_tempo, config.max_tempo);
        let features = AudioFeatures {
            tempo_bpm: tempo.bpm(),
            ..AudioFeatures::default()
        };

        Self {
            config,
            sample_rate,
            window_len,
            spectrum: Spectrum::new(),
            magnitudes: Vec::new(),
            onsets,
            tempo,
            features,
            last_beat_at: None,
            last_onset_sample: None,
            failed_ticks: 0,
        }
    }

    /// Samples per analysis window.
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Features produced by the most recent successful (or skipped) tick.
    pub fn features(&self) -> &AudioFeatures {
        &self.features
    }

    pub fn tempo(&self) -> &TempoEstimator {
        &self.tempo
    }

    pub fn failed_ticks(&self) -> u64 {
        self.failed_ticks
    }

    /// One analysis tick against the ring buffer. Returns `None` while the
    /// buffer holds less than one window. A failed computation is logged, the
    /// previous snapshot is kept and its beat flag cleared.
    pub fn tick(&mut self, ring: &RingBuffer, now: f64) -> Option<AudioFeatures> {
        let window = match ring.read_latest(self.window_len) {
            Ok(window) => window,
            Err(LightshowError::InsufficientData { .. }) => return None,
            Err(err) => {
                tracing::warn!(%err, "could not read analysis window");
                return None;
            }
        };

        match self.analyze(&window, now) {
            Ok(features) => Some(features),
            Err(err) => {
                self.failed_ticks += 1;
                tracing::warn!(%err, failed_ticks = self.failed_ticks, "analysis tick skipped");
                self.features.beat_detected = false;
                self.features.time_since_beat = self.time_since_beat(now);
                Some(self.features.clone())
            }
        }
    }

    /// Analyses one window. State is only committed when every step succeeds.
    pub fn analyze(&mut self, window: &AudioWindow, now: f64) -> Result<AudioFeatures> {
        let samples = window.samples();
        if samples.len() < 2 {
            return Err(LightshowError::Analysis(format!(
                "window of {} samples is too short",
                samples.len()
            )));
        }
        if let Some(index) = samples.iter().position(|sample| !sample.is_finite()) {
            return Err(LightshowError::Analysis(format!(
                "non-finite sample at index {index}"
            )));
        }

        let volume = self.volume(samples);
        let band_energy = self.band_energy(samples)?;
        let onsets = self.onsets.detect(samples)?;

        let duration = window.duration_seconds();
        let rate = self.sample_rate.max(1) as f64;
        let window_start = window.end_position().saturating_sub(samples.len() as u64);
        let spacing = (MIN_ONSET_SPACING_SECONDS * rate) as u64;
        let fresh_onset = onsets
            .onset_times()
            .filter(|time| *time > duration - BEAT_TAIL_SECONDS)
            .map(|time| window_start + (time * rate) as u64)
            .filter(|position| {
                self.last_onset_sample
                    .map_or(true, |last| *position > last + spacing)
            })
            .last();

        let smoothing = self.config.volume.smoothing_factor;
        let smoothed_volume = smoothing * self.features.smoothed_volume + (1.0 - smoothing) * volume;

        let mut beat_strength = self.features.beat_strength;
        let mut beat_count = self.features.beat_count;
        let beat_detected = fresh_onset.is_some();
        if let Some(position) = fresh_onset {
            self.last_onset_sample = Some(position);
            self.last_beat_at = Some(now);
            beat_strength = onsets.recent_strength(STRENGTH_FRAMES) as f64;
            beat_count += 1;
            let bpm = self.tempo.record_onset(position as f64 / rate);
            tracing::trace!(bpm, beat_strength, "beat");
        }

        self.features = AudioFeatures {
            volume,
            smoothed_volume,
            beat_detected,
            beat_strength,
            beat_count,
            tempo_bpm: self.tempo.bpm(),
            band_energy,
            time_since_beat: self.time_since_beat(now),
        };
        Ok(self.features.clone())
    }

    fn volume(&self, samples: &[f32]) -> f64 {
        let rms = compute_rms(samples);
        (rms * self.config.volume.gain).max(self.config.volume.noise_floor)
    }

    fn band_energy(&mut self, samples: &[f32]) -> Result<BandEnergy> {
        self.spectrum.magnitudes(samples, None, &mut self.magnitudes)?;
        let bin_hz = self.sample_rate as f64 / samples.len() as f64;
        let bands = &self.config.bands;

        Ok(BandEnergy {
            bass: mean_in_band(&self.magnitudes, bin_hz, bands.bass),
            mid: mean_in_band(&self.magnitudes, bin_hz, bands.mid),
            treble: mean_in_band(&self.magnitudes, bin_hz, bands.treble),
        })
    }

    fn time_since_beat(&self, now: f64) -> f64 {
        (now - self.last_beat_at.unwrap_or(0.0)).max(0.0)
    }
}

impl fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("sample_rate", &self.sample_rate)
            .field("window_len", &self.window_len)
            .field("features", &self.features)
            .field("onsets", &self.tempo.history().len())
            .field("failed_ticks", &self.failed_ticks)
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f64 {
    let sum: f64 = samples.iter().map(|&sample| (sample as f64) * (sample as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

fn mean_in_band(magnitudes: &[f32], bin_hz: f64, band: BandRange) -> f64 {
    let (sum, count) = magnitudes
        .iter()
        .enumerate()
        .filter(|(bin, _)| band.contains(*bin as f64 * bin_hz))
        .fold((0.0_f64, 0_usize), |(sum, count), (_, &magnitude)| {
            (sum + magnitude as f64, count + 1)
        });

    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
