//! Effects engine: turns audio features into per-fixture colors.
//!
//! Each tick runs in a fixed order: feature history, palette selection,
//! base intensity, beat boost, mode targets, smoothing, then output to the
//! fixture rig. Everything up to the output step works on local buffers, so
//! a tick that fails leaves the rig untouched.

mod modes;

use std::collections::{BTreeMap, VecDeque};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use modes::EffectMode;
use modes::{ModeScratch, Tick};

use crate::{
    analysis::AudioFeatures, config::EffectsConfig, fixture::FixtureRig, LightshowError, Result,
    Rgb,
};

const VOLUME_HISTORY: usize = 10;
const BEAT_HISTORY: usize = 5;
/// Seconds in one mode before auto-rotation may switch.
const ROTATION_PERIOD: f64 = 30.0;
const ROTATION_PROBABILITY: f64 = 0.3;
/// Seconds for the beat boost to decay to zero.
const BOOST_DECAY: f64 = 3.0;
const MAX_BOOST: f64 = 0.5;
const FALLBACK_DT: f64 = 1.0 / 60.0;
const MAX_DT: f64 = 0.1;

/// Snapshot of the engine for the status surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectStatus {
    pub mode: EffectMode,
    pub palette: String,
    pub palette_pinned: bool,
    pub auto_rotate: bool,
    pub base_intensity: f64,
    pub beat_boost: f64,
    /// Beats among the last five ticks.
    pub recent_beats: usize,
    pub transition_speed: f64,
    pub available_palettes: Vec<String>,
    pub available_modes: Vec<EffectMode>,
}

pub struct EffectsEngine {
    transition_speed: f64,
    intensity_multiplier: f64,
    beat_response_strength: f64,
    color_change_probability: f64,
    palettes: BTreeMap<String, Vec<Rgb>>,
    palette: String,
    palette_pinned: bool,
    mode: EffectMode,
    auto_rotate: bool,
    /// Set on the first tick after a mode change.
    mode_started: Option<f64>,
    fixtures: Vec<String>,
    current: Vec<[f64; 3]>,
    targets: Vec<Rgb>,
    scratch: ModeScratch,
    volume_history: VecDeque<f64>,
    beat_history: VecDeque<bool>,
    base_intensity: f64,
    boost_peak: f64,
    beat_boost: f64,
    last_beat: Option<f64>,
    /// `beat_count` of the last snapshot handled.
    beats_seen: Option<u64>,
    last_tick: Option<f64>,
    rng: StdRng,
}

impl EffectsEngine {
    /// Builds the engine for the rig's fixtures. A `seed` makes every random
    /// choice reproducible.
    pub fn new(config: &EffectsConfig, rig: &FixtureRig, seed: Option<u64>) -> Result<Self> {
        let palettes: BTreeMap<String, Vec<Rgb>> = config
            .palettes
            .iter()
            .filter(|(name, colors)| {
                if colors.is_empty() {
                    tracing::warn!(palette = %name, "ignoring empty palette");
                }
                !colors.is_empty()
            })
            .map(|(name, colors)| (name.clone(), colors.clone()))
            .collect();

        let palette = if palettes.contains_key(&config.initial_palette) {
            config.initial_palette.clone()
        } else {
            let fallback = palettes
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| LightshowError::Config("no usable color palette".into()))?;
            tracing::warn!(
                palette = %config.initial_palette,
                fallback = %fallback,
                "unknown initial palette"
            );
            fallback
        };

        let mode = config.initial_mode.parse().unwrap_or_else(|_| {
            tracing::warn!(mode = %config.initial_mode, "unknown initial mode, using auto");
            EffectMode::Auto
        });

        let fixtures: Vec<String> = rig.fixture_names().map(str::to_owned).collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        tracing::info!(
            fixtures = fixtures.len(),
            mode = %mode,
            palette = %palette,
            "effects engine initialised"
        );

        Ok(Self {
            transition_speed: config.transition_speed,
            intensity_multiplier: config.intensity_multiplier,
            beat_response_strength: config.beat_response_strength,
            color_change_probability: config.color_change_probability,
            palettes,
            palette,
            palette_pinned: false,
            mode,
            auto_rotate: config.auto_rotate,
            mode_started: None,
            current: vec![[0.0; 3]; fixtures.len()],
            targets: vec![Rgb::BLACK; fixtures.len()],
            fixtures,
            scratch: ModeScratch::new(),
            volume_history: VecDeque::with_capacity(VOLUME_HISTORY),
            beat_history: VecDeque::with_capacity(BEAT_HISTORY),
            base_intensity: 0.5,
            boost_peak: 0.0,
            beat_boost: 0.0,
            last_beat: None,
            beats_seen: None,
            last_tick: None,
            rng,
        })
    }

    pub fn mode(&self) -> EffectMode {
        self.mode
    }

    pub fn palette(&self) -> &str {
        &self.palette
    }

    pub fn base_intensity(&self) -> f64 {
        self.base_intensity
    }

    pub fn beat_boost(&self) -> f64 {
        self.beat_boost
    }

    /// Output intensity the next write uses, in DMX units.
    pub fn output_intensity(&self) -> u8 {
        let level = (255.0 * (self.base_intensity + self.beat_boost)) as i64;
        level.clamp(0, 255) as u8
    }

    pub fn target_color(&self, fixture: &str) -> Option<Rgb> {
        self.slot(fixture).map(|slot| self.targets[slot])
    }

    pub fn current_color(&self, fixture: &str) -> Option<Rgb> {
        self.slot(fixture).map(|slot| to_rgb(self.current[slot]))
    }

    /// Switches mode. Scratch state restarts, current colors carry over.
    pub fn set_mode(&mut self, mode: EffectMode) {
        self.mode = mode;
        self.mode_started = None;
        self.scratch = ModeScratch::new();
        tracing::info!(mode = %mode, "effect mode set");
    }

    pub fn set_mode_by_name(&mut self, name: &str) {
        match name.parse() {
            Ok(mode) => self.set_mode(mode),
            Err(_) => tracing::warn!(mode = name, "unknown effect mode"),
        }
    }

    /// Selects a palette and pins it until [`release_palette`](Self::release_palette).
    pub fn set_palette(&mut self, name: &str) {
        if self.palettes.contains_key(name) {
            self.palette = name.to_owned();
            self.palette_pinned = true;
            tracing::info!(palette = name, "color palette set");
        } else {
            tracing::warn!(palette = name, "unknown palette");
        }
    }

    /// Hands palette choice back to the audio-driven selection.
    pub fn release_palette(&mut self) {
        self.palette_pinned = false;
    }

    pub fn set_auto_rotate(&mut self, enabled: bool) {
        self.auto_rotate = enabled;
        self.mode_started = None;
    }

    pub fn status(&self) -> EffectStatus {
        EffectStatus {
            mode: self.mode,
            palette: self.palette.clone(),
            palette_pinned: self.palette_pinned,
            auto_rotate: self.auto_rotate,
            base_intensity: self.base_intensity,
            beat_boost: self.beat_boost,
            recent_beats: self.beat_history.iter().filter(|beat| **beat).count(),
            transition_speed: self.transition_speed,
            available_palettes: self.palettes.keys().cloned().collect(),
            available_modes: EffectMode::ALL.to_vec(),
        }
    }

    /// Runs one tick at show time `now` (seconds) and writes the rig.
    pub fn update(
        &mut self,
        features: &AudioFeatures,
        now: f64,
        rig: &mut FixtureRig,
    ) -> Result<()> {
        check_features(features)?;

        let dt = match self.last_tick {
            Some(previous) => (now - previous).clamp(0.0, MAX_DT),
            None => FALLBACK_DT,
        };
        self.last_tick = Some(now);
        let beat = self.take_beat(features);

        push_bounded(&mut self.volume_history, features.smoothed_volume, VOLUME_HISTORY);
        push_bounded(&mut self.beat_history, beat, BEAT_HISTORY);

        self.select_palette(features);
        self.rotate_mode(now);

        let palette = self
            .palettes
            .get(&self.palette)
            .filter(|colors| !colors.is_empty())
            .ok_or_else(|| LightshowError::Effects(format!("palette {} unavailable", self.palette)))?
            .clone();

        self.base_intensity =
            (features.smoothed_volume * self.intensity_multiplier + 0.1).clamp(0.1, 1.0);

        let mut targets = self.targets.clone();
        self.beat_response(beat, features, now, &palette, &mut targets);

        let tick = Tick {
            features,
            beat,
            palette: &palette,
            now,
            dt,
        };
        self.mode
            .render(&tick, &mut self.scratch, &mut self.rng, &mut targets);

        let mut current = self.current.clone();
        for (color, target) in current.iter_mut().zip(&targets) {
            for (channel, goal) in color.iter_mut().zip(target.channels()) {
                *channel += (goal as f64 - *channel) * self.transition_speed;
                *channel = channel.clamp(0.0, 255.0);
            }
        }

        let intensity = self.output_intensity() as i64;
        for (name, color) in self.fixtures.iter().zip(&current) {
            let rgb = to_rgb(*color);
            rig.set_rgb(name, rgb.r as i64, rgb.g as i64, rgb.b as i64, Some(intensity));
        }

        self.targets = targets;
        self.current = current;
        Ok(())
    }

    /// True when a beat arrived since the previous tick. Snapshots are read
    /// at the effects rate, so one may be seen twice or skipped; the count
    /// catches both.
    fn take_beat(&mut self, features: &AudioFeatures) -> bool {
        let beat = match self.beats_seen {
            Some(seen) if features.beat_count >= seen => features.beat_count > seen,
            // First snapshot, or the count went backwards (new extractor).
            _ => features.beat_detected,
        };
        self.beats_seen = Some(features.beat_count);
        beat
    }

    fn slot(&self, fixture: &str) -> Option<usize> {
        self.fixtures.iter().position(|name| name == fixture)
    }

    fn select_palette(&mut self, features: &AudioFeatures) {
        if self.palette_pinned || self.volume_history.is_empty() {
            return;
        }

        let average =
            self.volume_history.iter().sum::<f64>() / self.volume_history.len() as f64;
        let tempo = features.tempo_bpm;
        let wanted = if tempo > 140.0 && average > 0.6 {
            "energetic"
        } else if tempo < 80.0 && average < 0.3 {
            "calm"
        } else if average > 0.4 {
            "warm"
        } else {
            return;
        };

        if self.palette != wanted && self.palettes.contains_key(wanted) {
            tracing::debug!(palette = wanted, "palette follows the music");
            self.palette = wanted.to_owned();
        }
    }

    fn rotate_mode(&mut self, now: f64) {
        let started = *self.mode_started.get_or_insert(now);
        if !self.auto_rotate || now - started < ROTATION_PERIOD {
            return;
        }

        if self.rng.gen::<f64>() < ROTATION_PROBABILITY {
            let others: Vec<EffectMode> = EffectMode::ALL
                .into_iter()
                .filter(|mode| *mode != self.mode)
                .collect();
            if let Some(&next) = others.choose(&mut self.rng) {
                tracing::info!(from = %self.mode, to = %next, "rotating effect mode");
                self.mode = next;
                self.scratch = ModeScratch::new();
            }
        }
        self.mode_started = Some(now);
    }

    fn beat_response(
        &mut self,
        beat: bool,
        features: &AudioFeatures,
        now: f64,
        palette: &[Rgb],
        targets: &mut [Rgb],
    ) {
        if !beat {
            let since = self.last_beat.map_or(f64::INFINITY, |beat| now - beat);
            self.beat_boost = self.boost_peak * (1.0 - since / BOOST_DECAY).max(0.0);
            return;
        }

        self.last_beat = Some(now);
        self.boost_peak = (features.beat_strength * self.beat_response_strength).min(MAX_BOOST);
        self.beat_boost = self.boost_peak;

        if self.rng.gen::<f64>() >= self.color_change_probability {
            return;
        }

        match self.mode {
            EffectMode::Auto => {
                for target in targets.iter_mut() {
                    if let Some(color) = palette.choose(&mut self.rng) {
                        *target = *color;
                    }
                }
            }
            EffectMode::Chase => {
                let offset = (now * 2.0).max(0.0) as usize;
                for (index, target) in targets.iter_mut().enumerate() {
                    *target = palette[(index + offset) % palette.len()];
                }
            }
            EffectMode::Pulse | EffectMode::Strobe => {
                if let Some(&color) = palette.choose(&mut self.rng) {
                    targets.fill(color);
                }
            }
            EffectMode::Fade | EffectMode::PingPong | EffectMode::FlashStorm => {}
        }
    }
}

impl std::fmt::Debug for EffectsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectsEngine")
            .field("mode", &self.mode)
            .field("palette", &self.palette)
            .field("fixtures", &self.fixtures.len())
            .field("base_intensity", &self.base_intensity)
            .field("beat_boost", &self.beat_boost)
            .finish()
    }
}

fn check_features(features: &AudioFeatures) -> Result<()> {
    let values = [
        features.volume,
        features.smoothed_volume,
        features.beat_strength,
        features.tempo_bpm,
        features.band_energy.bass,
        features.band_energy.mid,
        features.band_energy.treble,
    ];
    if values.iter().all(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(LightshowError::Effects("non-finite audio features".into()))
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, capacity: usize) {
    if history.len() == capacity {
        history.pop_front();
    }
    history.push_back(value);
}

fn to_rgb(color: [f64; 3]) -> Rgb {
    let channel = |value: f64| value.round().clamp(0.0, 255.0) as u8;
    Rgb::new(channel(color[0]), channel(color[1]), channel(color[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FixtureConfig, dmx::Universe};

    fn rig(count: u16) -> FixtureRig {
        let configs: Vec<FixtureConfig> = (0..count)
            .map(|i| FixtureConfig::five_channel(format!("par_{}", i + 1), 1 + i * 5))
            .collect();
        FixtureRig::new(&configs, Universe::shared())
    }

    fn engine(config: EffectsConfig, rig: &FixtureRig) -> EffectsEngine {
        EffectsEngine::new(&config, rig, Some(42)).unwrap()
    }

    fn quiet() -> AudioFeatures {
        AudioFeatures {
            volume: 0.2,
            smoothed_volume: 0.2,
            tempo_bpm: 120.0,
            ..AudioFeatures::default()
        }
    }

    /// Snapshot carrying the `count`th beat.
    fn beat(count: u64, strength: f64) -> AudioFeatures {
        AudioFeatures {
            beat_detected: true,
            beat_strength: strength,
            beat_count: count,
            ..quiet()
        }
    }

    fn fixed_config() -> EffectsConfig {
        EffectsConfig {
            auto_rotate: false,
            initial_mode: "strobe".into(),
            ..EffectsConfig::default()
        }
    }

    #[test]
    fn strobe_without_beat_targets_black() {
        let mut rig = rig(4);
        let mut engine = engine(fixed_config(), &rig);
        engine.update(&quiet(), 0.0, &mut rig).unwrap();

        for name in ["par_1", "par_2", "par_3", "par_4"] {
            assert_eq!(engine.target_color(name), Some(Rgb::BLACK));
        }
    }

    #[test]
    fn strobe_beat_paints_every_fixture_the_same() {
        let mut rig = rig(4);
        let mut engine = engine(fixed_config(), &rig);
        engine.update(&beat(1, 1.0), 0.0, &mut rig).unwrap();

        let defaults = EffectsConfig::default();
        let palette = &defaults.palettes[engine.palette()];
        let first = engine.target_color("par_1").unwrap();
        assert!(palette.contains(&first));
        for name in ["par_2", "par_3", "par_4"] {
            assert_eq!(engine.target_color(name), Some(first));
        }
    }

    #[test]
    fn converged_color_matches_request() {
        let requested = Rgb::new(200, 37, 151);
        let mut config = fixed_config();
        config.palettes = BTreeMap::from([("solo".to_string(), vec![requested])]);
        config.initial_palette = "solo".into();

        let mut rig = rig(3);
        let mut engine = engine(config, &rig);
        for step in 0..300 {
            engine.update(&beat(step + 1, 0.5), step as f64 / 60.0, &mut rig).unwrap();
        }

        for state in rig.get_all_lights_state() {
            for (got, want) in state.rgb.channels().into_iter().zip(requested.channels()) {
                assert!((got as i16 - want as i16).abs() <= 1, "{:?}", state.rgb);
            }
        }
    }

    #[test]
    fn boost_decays_linearly_over_three_seconds() {
        let mut rig = rig(2);
        let mut engine = engine(fixed_config(), &rig);
        let config = EffectsConfig::default();

        engine.update(&beat(1, 0.5), 10.0, &mut rig).unwrap();
        let peak = (0.5 * config.beat_response_strength).min(MAX_BOOST);
        assert!((engine.beat_boost() - peak).abs() < 1e-9);

        engine.update(&quiet(), 11.5, &mut rig).unwrap();
        assert!((engine.beat_boost() - peak * 0.5).abs() < 1e-9);

        engine.update(&quiet(), 13.5, &mut rig).unwrap();
        assert_eq!(engine.beat_boost(), 0.0);
    }

    #[test]
    fn snapshot_read_twice_is_one_beat() {
        let mut rig = rig(2);
        let mut engine = engine(fixed_config(), &rig);
        let peak = (0.5 * EffectsConfig::default().beat_response_strength).min(MAX_BOOST);

        engine.update(&beat(1, 0.5), 0.0, &mut rig).unwrap();
        engine.update(&beat(1, 0.5), 1.5, &mut rig).unwrap();

        assert!((engine.beat_boost() - peak * 0.5).abs() < 1e-9);
        assert_eq!(engine.status().recent_beats, 1);
        assert_eq!(engine.target_color("par_1"), Some(Rgb::BLACK));
    }

    #[test]
    fn skipped_snapshot_still_fires_beat() {
        let mut rig = rig(2);
        let mut engine = engine(fixed_config(), &rig);
        let peak = (0.5 * EffectsConfig::default().beat_response_strength).min(MAX_BOOST);

        engine.update(&beat(1, 0.5), 0.0, &mut rig).unwrap();
        // Beat 2 was published and replaced before the engine looked.
        let later = AudioFeatures {
            beat_detected: false,
            beat_strength: 0.5,
            beat_count: 2,
            ..quiet()
        };
        engine.update(&later, 1.5, &mut rig).unwrap();

        assert!((engine.beat_boost() - peak).abs() < 1e-9);
        assert_eq!(engine.status().recent_beats, 2);
        assert_ne!(engine.target_color("par_1"), Some(Rgb::BLACK));
    }

    #[test]
    fn intensity_tracks_volume_and_boost() {
        let mut rig = rig(1);
        let mut engine = engine(fixed_config(), &rig);
        let loud = AudioFeatures {
            smoothed_volume: 0.5,
            ..quiet()
        };
        engine.update(&loud, 0.0, &mut rig).unwrap();

        // 0.5 * 1.2 + 0.1
        assert!((engine.base_intensity() - 0.7).abs() < 1e-9);
        assert_eq!(rig.get_light_state("par_1").unwrap().intensity, 178);
    }

    #[test]
    fn unknown_names_are_ignored() {
        let mut rig = rig(2);
        let mut engine = engine(fixed_config(), &rig);
        engine.set_mode_by_name("laser_show");
        engine.set_palette("neon");
        assert_eq!(engine.mode(), EffectMode::Strobe);
        assert_eq!(engine.palette(), "energetic");
        engine.update(&quiet(), 0.0, &mut rig).unwrap();
    }

    #[test]
    fn palette_follows_music_unless_pinned() {
        let mut rig = rig(2);
        let mut engine = engine(fixed_config(), &rig);
        let calm = AudioFeatures {
            smoothed_volume: 0.1,
            tempo_bpm: 70.0,
            ..quiet()
        };
        engine.update(&calm, 0.0, &mut rig).unwrap();
        assert_eq!(engine.palette(), "calm");

        engine.set_palette("warm");
        engine.update(&calm, 0.1, &mut rig).unwrap();
        assert_eq!(engine.palette(), "warm");

        engine.release_palette();
        engine.update(&calm, 0.2, &mut rig).unwrap();
        assert_eq!(engine.palette(), "calm");
    }

    #[test]
    fn mode_change_keeps_current_colors() {
        let mut rig = rig(2);
        let mut engine = engine(fixed_config(), &rig);
        for step in 0..30 {
            engine.update(&beat(step + 1, 1.0), step as f64 / 60.0, &mut rig).unwrap();
        }
        let before = engine.current_color("par_1");
        engine.set_mode(EffectMode::Fade);
        assert_eq!(engine.current_color("par_1"), before);
        assert_eq!(engine.status().mode, EffectMode::Fade);
    }

    #[test]
    fn auto_rotation_eventually_switches() {
        let mut rig = rig(3);
        let config = EffectsConfig {
            auto_rotate: true,
            ..fixed_config()
        };
        let mut engine = engine(config, &rig);

        engine.update(&quiet(), 0.0, &mut rig).unwrap();
        engine.update(&quiet(), 29.0, &mut rig).unwrap();
        assert_eq!(engine.mode(), EffectMode::Strobe);

        let mut now = 30.0;
        while engine.mode() == EffectMode::Strobe && now < 3_000.0 {
            engine.update(&quiet(), now, &mut rig).unwrap();
            now += 30.0;
        }
        assert_ne!(engine.mode(), EffectMode::Strobe);
    }

    #[test]
    fn non_finite_features_leave_rig_untouched() {
        let mut rig = rig(1);
        let mut engine = engine(fixed_config(), &rig);
        engine.update(&beat(1, 1.0), 0.0, &mut rig).unwrap();
        let before = rig.get_all_lights_state();

        let broken = AudioFeatures {
            smoothed_volume: f64::NAN,
            ..quiet()
        };
        assert!(engine.update(&broken, 0.1, &mut rig).is_err());
        assert_eq!(rig.get_all_lights_state(), before);
    }
}
