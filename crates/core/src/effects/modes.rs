use std::{f64::consts::PI, fmt, str::FromStr};

use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{analysis::AudioFeatures, LightshowError, Rgb};

/// Animation modes of the effects engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMode {
    Auto,
    Pulse,
    Chase,
    Strobe,
    Fade,
    PingPong,
    FlashStorm,
}

impl EffectMode {
    pub const ALL: [EffectMode; 7] = [
        EffectMode::Auto,
        EffectMode::Pulse,
        EffectMode::Chase,
        EffectMode::Strobe,
        EffectMode::Fade,
        EffectMode::PingPong,
        EffectMode::FlashStorm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EffectMode::Auto => "auto",
            EffectMode::Pulse => "pulse",
            EffectMode::Chase => "chase",
            EffectMode::Strobe => "strobe",
            EffectMode::Fade => "fade",
            EffectMode::PingPong => "ping_pong",
            EffectMode::FlashStorm => "flash_storm",
        }
    }

    /// Computes this tick's target colors in place. `targets` holds the
    /// previous targets on entry; modes that only touch some fixtures leave
    /// the rest as they were.
    pub(crate) fn render(
        self,
        tick: &Tick<'_>,
        scratch: &mut ModeScratch,
        rng: &mut StdRng,
        targets: &mut [Rgb],
    ) {
        match self {
            EffectMode::Auto => auto(tick, targets),
            EffectMode::Pulse => pulse(tick, targets),
            EffectMode::Chase => chase(tick, targets),
            EffectMode::Strobe => strobe(tick, rng, targets),
            EffectMode::Fade => fade(tick, scratch, targets),
            EffectMode::PingPong => ping_pong(tick, scratch, targets),
            EffectMode::FlashStorm => flash_storm(tick, scratch, rng, targets),
        }
    }
}

impl fmt::Display for EffectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EffectMode {
    type Err = LightshowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EffectMode::ALL
            .into_iter()
            .find(|mode| mode.name() == value)
            .ok_or_else(|| LightshowError::Effects(format!("unknown effect mode: {value}")))
    }
}

/// Inputs shared by every mode for one tick.
pub(crate) struct Tick<'a> {
    pub features: &'a AudioFeatures,
    /// A beat arrived since the previous tick.
    pub beat: bool,
    pub palette: &'a [Rgb],
    pub now: f64,
    /// Seconds since the previous tick.
    pub dt: f64,
}

const COLOR_CYCLE_RATE: f64 = 1.2;
const FADE_PHASE_OFFSET: f64 = 0.2;
const PING_PONG_SPEED: f64 = 2.0;
const PING_PONG_WIDTH: f64 = 2.0;
const STORM_RECOLOR_INTERVAL: f64 = 0.3;
const STORM_FLICKER_INTERVAL: f64 = 0.15;
const STORM_FLICKER_PROBABILITY: f64 = 0.4;

/// Per-mode state, reset whenever the mode changes.
#[derive(Debug, Clone)]
pub(crate) struct ModeScratch {
    color_cycle: f64,
    ping_pong_position: f64,
    ping_pong_forward: bool,
    ping_pong_color: usize,
    storm_recolor_timer: f64,
    storm_flicker_timer: f64,
    /// Unscaled colors flash storm recolors; targets are derived each tick.
    storm_colors: Vec<Rgb>,
}

impl ModeScratch {
    pub fn new() -> Self {
        Self {
            color_cycle: 0.0,
            ping_pong_position: 0.0,
            ping_pong_forward: true,
            ping_pong_color: 0,
            storm_recolor_timer: 0.0,
            storm_flicker_timer: 0.0,
            storm_colors: Vec::new(),
        }
    }
}

fn auto(tick: &Tick<'_>, targets: &mut [Rgb]) {
    let bands = &tick.features.band_energy;
    let loudest = bands.bass.max(bands.mid).max(bands.treble).max(0.1);
    let ratios = [bands.bass / loudest, bands.mid / loudest, bands.treble / loudest];
    let primaries = [Rgb::new(255, 0, 0), Rgb::new(0, 255, 0), Rgb::new(0, 0, 255)];

    for (index, target) in targets.iter_mut().enumerate() {
        *target = primaries[index % 3].scaled(ratios[index % 3]);
    }
}

fn pulse(tick: &Tick<'_>, targets: &mut [Rgb]) {
    let level = if tick.beat { 1.0 } else { 0.3 };
    let index = (tick.now * 0.1).rem_euclid(tick.palette.len() as f64) as usize;
    let color = tick.palette[index % tick.palette.len()].scaled(level);
    targets.fill(color);
}

fn chase(tick: &Tick<'_>, targets: &mut [Rgb]) {
    let count = targets.len() as f64;
    let speed = tick.features.tempo_bpm / 120.0;

    for (index, target) in targets.iter_mut().enumerate() {
        let position = (tick.now * speed + index as f64).rem_euclid(count);
        let color = tick.palette[position as usize % tick.palette.len()];
        let fade = 1.0 - ((position.fract() - 0.5).abs() * 2.0);
        *target = color.scaled(fade);
    }
}

fn strobe(tick: &Tick<'_>, rng: &mut StdRng, targets: &mut [Rgb]) {
    let color = if tick.beat {
        tick.palette.choose(rng).copied().unwrap_or(Rgb::BLACK)
    } else {
        Rgb::BLACK
    };
    targets.fill(color);
}

fn fade(tick: &Tick<'_>, scratch: &mut ModeScratch, targets: &mut [Rgb]) {
    scratch.color_cycle = (scratch.color_cycle + COLOR_CYCLE_RATE * tick.dt).fract();
    let len = tick.palette.len();

    for (index, target) in targets.iter_mut().enumerate() {
        let phase = scratch.color_cycle + index as f64 * FADE_PHASE_OFFSET;
        let position = phase.fract() * len as f64;
        let from = position as usize % len;
        let to = (from + 1) % len;
        *target = tick.palette[from].lerp(tick.palette[to], position.fract());
    }
}

fn ping_pong(tick: &Tick<'_>, scratch: &mut ModeScratch, targets: &mut [Rgb]) {
    if targets.len() < 2 {
        return;
    }

    let last = (targets.len() - 1) as f64;
    let len = tick.palette.len();
    let beat = tick.beat;
    let speed = PING_PONG_SPEED * if beat { 1.5 } else { 0.5 };
    let step = speed * tick.dt;

    scratch.ping_pong_position += if scratch.ping_pong_forward { step } else { -step };
    if scratch.ping_pong_position >= last {
        scratch.ping_pong_position = last;
        scratch.ping_pong_forward = false;
        scratch.ping_pong_color = (scratch.ping_pong_color + 1) % len;
    } else if scratch.ping_pong_position <= 0.0 {
        scratch.ping_pong_position = 0.0;
        scratch.ping_pong_forward = true;
        scratch.ping_pong_color = (scratch.ping_pong_color + 1) % len;
    }

    let current = tick.palette[scratch.ping_pong_color % len];
    let next = tick.palette[(scratch.ping_pong_color + 1) % len];
    let blend = if beat {
        tick.features.beat_strength.clamp(0.0, 1.0)
    } else {
        0.2
    };
    let wave_color = current.lerp(next, blend);

    for (index, target) in targets.iter_mut().enumerate() {
        let distance = (index as f64 - scratch.ping_pong_position).abs();
        *target = if distance <= PING_PONG_WIDTH {
            let falloff = (distance * PI / (2.0 * PING_PONG_WIDTH)).cos().powi(2);
            wave_color.scaled(falloff)
        } else {
            current.scaled(0.1)
        };
    }
}

fn flash_storm(tick: &Tick<'_>, scratch: &mut ModeScratch, rng: &mut StdRng, targets: &mut [Rgb]) {
    let count = targets.len();
    if count == 0 {
        return;
    }
    if scratch.storm_colors.len() != count {
        scratch.storm_colors = targets.to_vec();
    }

    scratch.storm_recolor_timer += tick.dt;
    scratch.storm_flicker_timer += tick.dt;

    if scratch.storm_recolor_timer >= STORM_RECOLOR_INTERVAL {
        scratch.storm_recolor_timer = 0.0;
        let amount = rng.gen_range(1..=count);
        recolor_random(rng, tick.palette, &mut scratch.storm_colors, amount);
    }

    let mut boost = 1.0;
    if tick.beat {
        boost += tick.features.beat_strength.clamp(0.0, 1.0) * 0.5;
        let amount = rng.gen_range(1..=(count / 2).max(1));
        recolor_random(rng, tick.palette, &mut scratch.storm_colors, amount);
    } else if scratch.storm_flicker_timer >= STORM_FLICKER_INTERVAL {
        scratch.storm_flicker_timer = 0.0;
        if rng.gen::<f64>() < STORM_FLICKER_PROBABILITY {
            recolor_random(rng, tick.palette, &mut scratch.storm_colors, 1);
        }
    }

    let level = 0.4 + 0.6 * tick.features.smoothed_volume;
    let tempo_factor = (tick.features.tempo_bpm / 120.0).min(1.2);
    let scale = boost * level * tempo_factor;

    for (target, base) in targets.iter_mut().zip(&scratch.storm_colors) {
        *target = base.scaled(scale);
    }
}

fn recolor_random(rng: &mut StdRng, palette: &[Rgb], colors: &mut [Rgb], amount: usize) {
    for index in rand::seq::index::sample(rng, colors.len(), amount.min(colors.len())) {
        if let Some(color) = palette.choose(rng) {
            colors[index] = *color;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    const PALETTE: [Rgb; 3] = [
        Rgb::new(255, 0, 0),
        Rgb::new(0, 255, 0),
        Rgb::new(0, 0, 255),
    ];

    fn tick<'a>(features: &'a AudioFeatures, now: f64) -> Tick<'a> {
        Tick {
            features,
            beat: false,
            palette: &PALETTE,
            now,
            dt: 1.0 / 60.0,
        }
    }

    #[test]
    fn names_round_trip() {
        for mode in EffectMode::ALL {
            assert_eq!(mode.name().parse::<EffectMode>().unwrap(), mode);
        }
        assert!("disco".parse::<EffectMode>().is_err());
        assert_eq!(EffectMode::PingPong.to_string(), "ping_pong");
    }

    #[test]
    fn auto_splits_bands_across_fixtures() {
        let mut features = AudioFeatures::default();
        features.band_energy.bass = 2.0;
        features.band_energy.mid = 1.0;
        features.band_energy.treble = 0.0;

        let mut targets = [Rgb::BLACK; 4];
        auto(&tick(&features, 0.0), &mut targets);
        assert_eq!(targets[0], Rgb::new(255, 0, 0));
        assert_eq!(targets[1], Rgb::new(0, 127, 0));
        assert_eq!(targets[2], Rgb::BLACK);
        assert_eq!(targets[3], Rgb::new(255, 0, 0));
    }

    #[test]
    fn chase_peaks_mid_step() {
        let features = AudioFeatures::default();
        let mut targets = [Rgb::BLACK; 3];
        chase(&tick(&features, 0.5), &mut targets);
        assert_eq!(targets[0], Rgb::new(255, 0, 0));
        assert_eq!(targets[1], Rgb::new(0, 255, 0));
        assert_eq!(targets[2], Rgb::new(0, 0, 255));
    }

    #[test]
    fn ping_pong_bounces_and_advances_color() {
        let features = AudioFeatures::default();
        let mut scratch = ModeScratch::new();
        let mut targets = [Rgb::BLACK; 3];
        let mut tick = tick(&features, 0.0);
        tick.dt = 0.1;

        // 1 light/s without a beat: reaches the far end after 2 s.
        for _ in 0..25 {
            ping_pong(&tick, &mut scratch, &mut targets);
        }
        assert!(!scratch.ping_pong_forward);
        assert_eq!(scratch.ping_pong_color, 1);
        assert!(targets[2].g > targets[0].g);
    }

    #[test]
    fn ping_pong_blend_stays_between_palette_colors() {
        let features = AudioFeatures {
            beat_strength: 7.5,
            ..AudioFeatures::default()
        };
        let palette = [
            Rgb::new(100, 100, 100),
            Rgb::new(200, 50, 0),
            Rgb::new(10, 20, 30),
        ];
        let mut scratch = ModeScratch::new();
        let mut targets = [Rgb::BLACK; 2];
        let mut tick = tick(&features, 0.0);
        tick.palette = &palette;
        tick.beat = true;
        tick.dt = 0.0;

        // Standing at fixture 0 bounces onto the second color; the wave is a
        // full blend towards the third, not an overshoot past it.
        ping_pong(&tick, &mut scratch, &mut targets);
        assert_eq!(scratch.ping_pong_color, 1);
        assert_eq!(targets[0], palette[2]);
    }

    #[test]
    fn ping_pong_needs_two_fixtures() {
        let features = AudioFeatures::default();
        let mut scratch = ModeScratch::new();
        let mut targets = [Rgb::new(1, 2, 3)];
        ping_pong(&tick(&features, 0.0), &mut scratch, &mut targets);
        assert_eq!(targets[0], Rgb::new(1, 2, 3));
    }

    #[test]
    fn flash_storm_never_goes_dark() {
        let features = AudioFeatures {
            smoothed_volume: 0.0,
            tempo_bpm: 120.0,
            ..AudioFeatures::default()
        };
        let mut scratch = ModeScratch::new();
        let mut rng = StdRng::seed_from_u64(7);
        let mut targets = PALETTE;

        for step in 0..600 {
            flash_storm(&tick(&features, step as f64 / 60.0), &mut scratch, &mut rng, &mut targets);
        }
        for target in targets {
            assert!(target.channels().iter().any(|channel| *channel >= 100), "{target:?}");
        }
    }
}
