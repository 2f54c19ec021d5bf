use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{LightshowError, Result, Rgb};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub analysis: AnalysisConfig,
    pub dmx: DmxConfig,
    pub fixtures: Vec<FixtureConfig>,
    pub effects: EffectsConfig,
}

impl AppConfig {
    /// Defaults for a four-par rig on consecutive five-channel addresses.
    pub fn live_defaults() -> Self {
        let fixtures = (0..4)
            .map(|index| FixtureConfig::five_channel(format!("par_{}", index + 1), 1 + index * 5))
            .collect();

        Self {
            fixtures,
            ..Self::default()
        }
    }

    /// Loads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::info!(?path, fixtures = config.fixtures.len(), "loaded configuration");
        Ok(config)
    }

    /// Serialises the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Rejects settings the pipeline cannot run with. Per-fixture channel
    /// defects are not checked here; the fixture model degrades those.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(LightshowError::Config("audio.sample_rate must be positive".into()));
        }
        if self.audio.channels == 0 {
            return Err(LightshowError::Config("audio.channels must be positive".into()));
        }
        if !(self.analysis.window_seconds > 0.0) {
            return Err(LightshowError::Config(
                "analysis.window_seconds must be positive".into(),
            ));
        }
        if self.audio.buffer_seconds < self.analysis.window_seconds {
            return Err(LightshowError::Config(
                "audio.buffer_seconds must hold at least one analysis window".into(),
            ));
        }
        if !(self.analysis.tick_rate_hz > 0.0)
            || !(self.effects.tick_rate_hz > 0.0)
            || !(self.dmx.refresh_rate_hz > 0.0)
        {
            return Err(LightshowError::Config("tick and refresh rates must be positive".into()));
        }
        if self.analysis.hop_length == 0 || self.analysis.frame_length < 2 {
            return Err(LightshowError::Config(
                "analysis.hop_length and analysis.frame_length are too small".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.analysis.volume.smoothing_factor) {
            return Err(LightshowError::Config(
                "analysis.volume.smoothing_factor must lie in [0, 1]".into(),
            ));
        }
        if self.analysis.min_tempo > self.analysis.max_tempo || self.analysis.min_tempo <= 0.0 {
            return Err(LightshowError::Config("tempo bounds are inverted or non-positive".into()));
        }
        if self.effects.palettes.is_empty() {
            return Err(LightshowError::Config("at least one palette is required".into()));
        }
        if let Some((name, _)) = self.effects.palettes.iter().find(|(_, colors)| colors.is_empty()) {
            return Err(LightshowError::Config(format!("palette `{name}` has no colors")));
        }
        Ok(())
    }
}

/// Configuration specific to the audio capture side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Channel count delivered by the capture source before down-mixing.
    pub channels: u16,
    /// Ring buffer length in seconds.
    pub buffer_seconds: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            buffer_seconds: 4.0,
        }
    }
}

impl AudioConfig {
    pub fn ring_capacity(&self) -> usize {
        (self.sample_rate as f64 * self.buffer_seconds).round() as usize
    }
}

/// Frequency band in Hz, half-open `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandRange {
    pub low: f64,
    pub high: f64,
}

impl BandRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, frequency: f64) -> bool {
        frequency >= self.low && frequency < self.high
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyBands {
    pub bass: BandRange,
    pub mid: BandRange,
    pub treble: BandRange,
}

impl Default for FrequencyBands {
    fn default() -> Self {
        Self {
            bass: BandRange::new(20.0, 250.0),
            mid: BandRange::new(250.0, 4_000.0),
            treble: BandRange::new(4_000.0, 20_000.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub gain: f64,
    pub noise_floor: f64,
    /// Weight of the previous smoothed value in the moving average.
    pub smoothing_factor: f64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            gain: 2.0,
            noise_floor: 0.01,
            smoothing_factor: 0.8,
        }
    }
}

/// Feature extractor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub window_seconds: f64,
    pub tick_rate_hz: f64,
    /// Peak-picking margin over the local mean of the normalised onset curve.
    pub onset_threshold: f64,
    /// STFT frame length used for the onset-strength curve.
    pub frame_length: usize,
    pub hop_length: usize,
    pub min_tempo: f64,
    pub max_tempo: f64,
    pub bands: FrequencyBands,
    pub volume: VolumeConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_seconds: 1.0,
            tick_rate_hz: 60.0,
            onset_threshold: 0.3,
            frame_length: 2048,
            hop_length: 512,
            min_tempo: 60.0,
            max_tempo: 180.0,
            bands: FrequencyBands::default(),
            volume: VolumeConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn window_len(&self, sample_rate: u32) -> usize {
        (sample_rate as f64 * self.window_seconds).round() as usize
    }
}

/// Output link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmxConfig {
    pub refresh_rate_hz: f64,
    pub baud_rate: u32,
}

impl Default for DmxConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 40.0,
            baud_rate: 250_000,
        }
    }
}

/// Logical channel to DMX address mapping. Addresses are 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMap {
    pub red: Option<u16>,
    pub green: Option<u16>,
    pub blue: Option<u16>,
    pub intensity: Option<u16>,
    pub strobe: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub name: String,
    pub dmx_address: u16,
    #[serde(default)]
    pub channels: ChannelMap,
}

impl FixtureConfig {
    /// Common RGB par layout: intensity, red, green, blue, strobe.
    pub fn five_channel(name: impl Into<String>, dmx_address: u16) -> Self {
        Self {
            name: name.into(),
            dmx_address,
            channels: ChannelMap {
                intensity: Some(dmx_address),
                red: Some(dmx_address + 1),
                green: Some(dmx_address + 2),
                blue: Some(dmx_address + 3),
                strobe: Some(dmx_address + 4),
            },
        }
    }
}

/// Effects engine tuning and palette table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub tick_rate_hz: f64,
    /// Fraction of the remaining distance to the target covered per tick.
    pub transition_speed: f64,
    pub intensity_multiplier: f64,
    pub beat_response_strength: f64,
    pub color_change_probability: f64,
    pub auto_rotate: bool,
    pub initial_mode: String,
    pub initial_palette: String,
    pub palettes: BTreeMap<String, Vec<Rgb>>,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60.0,
            transition_speed: 0.15,
            intensity_multiplier: 1.2,
            beat_response_strength: 0.8,
            color_change_probability: 0.3,
            auto_rotate: true,
            initial_mode: "auto".to_string(),
            initial_palette: "energetic".to_string(),
            palettes: default_palettes(),
        }
    }
}

fn default_palettes() -> BTreeMap<String, Vec<Rgb>> {
    let mut palettes = BTreeMap::new();
    palettes.insert(
        "energetic".to_string(),
        vec![
            Rgb::new(255, 0, 0),
            Rgb::new(255, 128, 0),
            Rgb::new(255, 0, 255),
            Rgb::new(0, 255, 255),
            Rgb::new(255, 255, 0),
        ],
    );
    palettes.insert(
        "calm".to_string(),
        vec![
            Rgb::new(0, 0, 255),
            Rgb::new(0, 128, 255),
            Rgb::new(128, 0, 255),
            Rgb::new(0, 255, 128),
        ],
    );
    palettes.insert(
        "warm".to_string(),
        vec![
            Rgb::new(255, 64, 0),
            Rgb::new(255, 128, 0),
            Rgb::new(255, 200, 64),
            Rgb::new(255, 32, 32),
        ],
    );
    palettes
}
