//! Light fixture model.
//!
//! A [`FixtureRig`] owns every configured fixture, validates its channel map
//! once at construction and turns logical writes (RGB, intensity, strobe)
//! into channel assignments on the shared DMX universe.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::{ChannelMap, FixtureConfig},
    dmx::{SharedUniverse, DMX_CHANNELS},
};

/// 8-bit RGB triple. Serialised as `[r, g, b]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Each channel multiplied by `factor` and truncated into `[0, 255]`.
    pub fn scaled(self, factor: f64) -> Self {
        let scale = |channel: u8| clamp_channel((channel as f64 * factor) as i64);
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }

    /// Linear blend towards `other`; `amount` 0 keeps `self`, 1 yields `other`.
    pub fn lerp(self, other: Rgb, amount: f64) -> Self {
        let mix = |a: u8, b: u8| clamp_channel((a as f64 * (1.0 - amount) + b as f64 * amount) as i64);
        Self::new(mix(self.r, other.r), mix(self.g, other.g), mix(self.b, other.b))
    }

    pub fn channels(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(color: Rgb) -> Self {
        color.channels()
    }
}

/// Clamps any integer into the DMX value range.
pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

/// One light with its validated channel map and last written state.
#[derive(Debug, Clone)]
pub struct Fixture {
    name: String,
    dmx_address: u16,
    channels: ChannelMap,
    current_rgb: Rgb,
    current_intensity: u8,
    strobe: u8,
}

impl Fixture {
    /// Builds a fixture, demoting missing or out-of-range channels to absent.
    pub fn from_config(config: &FixtureConfig) -> Self {
        let name = config.name.clone();
        let mut channels = config.channels;

        for (label, slot) in [
            ("red", channels.red),
            ("green", channels.green),
            ("blue", channels.blue),
        ] {
            if slot.is_none() {
                tracing::warn!(fixture = %name, channel = label, "missing required channel");
            }
        }

        for (label, slot) in [
            ("red", &mut channels.red),
            ("green", &mut channels.green),
            ("blue", &mut channels.blue),
            ("intensity", &mut channels.intensity),
            ("strobe", &mut channels.strobe),
        ] {
            if let Some(address) = *slot {
                if !(1..=DMX_CHANNELS as u16).contains(&address) {
                    tracing::warn!(
                        fixture = %name,
                        channel = label,
                        address,
                        "channel outside 1..=512, ignoring it"
                    );
                    *slot = None;
                }
            }
        }

        Self {
            name,
            dmx_address: config.dmx_address,
            channels,
            current_rgb: Rgb::BLACK,
            current_intensity: 0,
            strobe: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dmx_address(&self) -> u16 {
        self.dmx_address
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    pub fn current_rgb(&self) -> Rgb {
        self.current_rgb
    }

    pub fn current_intensity(&self) -> u8 {
        self.current_intensity
    }

    pub fn state(&self) -> LightState {
        LightState {
            name: self.name.clone(),
            dmx_address: self.dmx_address,
            rgb: self.current_rgb,
            intensity: self.current_intensity,
            strobe: self.strobe,
            channels: self.channels,
        }
    }
}

/// Read-only view of a fixture for the status surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    pub name: String,
    pub dmx_address: u16,
    pub rgb: Rgb,
    pub intensity: u8,
    pub strobe: u8,
    pub channels: ChannelMap,
}

/// All fixtures of the show, in configuration order.
#[derive(Debug)]
pub struct FixtureRig {
    fixtures: Vec<Fixture>,
    index: HashMap<String, usize>,
    universe: SharedUniverse,
}

impl FixtureRig {
    pub fn new(configs: &[FixtureConfig], universe: SharedUniverse) -> Self {
        let mut fixtures = Vec::with_capacity(configs.len());
        let mut index = HashMap::with_capacity(configs.len());

        for config in configs {
            if index.contains_key(&config.name) {
                tracing::warn!(fixture = %config.name, "duplicate fixture name, keeping the first");
                continue;
            }
            let fixture = Fixture::from_config(config);
            tracing::info!(
                fixture = %fixture.name,
                dmx_address = fixture.dmx_address,
                "initialised fixture"
            );
            index.insert(fixture.name.clone(), fixtures.len());
            fixtures.push(fixture);
        }

        Self {
            fixtures,
            index,
            universe,
        }
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    pub fn fixture_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.fixtures.iter().map(|fixture| fixture.name.as_str())
    }

    pub fn fixture(&self, name: &str) -> Option<&Fixture> {
        self.index.get(name).map(|&slot| &self.fixtures[slot])
    }

    pub fn universe(&self) -> &SharedUniverse {
        &self.universe
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        let slot = self.index.get(name).copied();
        if slot.is_none() {
            tracing::warn!(fixture = name, "unknown fixture");
        }
        slot
    }

    /// Sets color (and optionally intensity). Values are clamped to `[0, 255]`.
    pub fn set_rgb(&mut self, name: &str, r: i64, g: i64, b: i64, intensity: Option<i64>) {
        let Some(slot) = self.lookup(name) else {
            return;
        };

        let rgb = Rgb::new(clamp_channel(r), clamp_channel(g), clamp_channel(b));
        let intensity = intensity.map(clamp_channel);
        let fixture = &mut self.fixtures[slot];

        {
            let mut universe = self.universe.lock();
            universe.set_optional(fixture.channels.red, rgb.r);
            universe.set_optional(fixture.channels.green, rgb.g);
            universe.set_optional(fixture.channels.blue, rgb.b);
            if let Some(level) = intensity {
                universe.set_optional(fixture.channels.intensity, level);
            }
        }

        fixture.current_rgb = rgb;
        if let Some(level) = intensity {
            fixture.current_intensity = level;
        }
    }

    /// Sets the intensity channel. A fixture without one keeps its state.
    pub fn set_intensity(&mut self, name: &str, intensity: i64) {
        let Some(slot) = self.lookup(name) else {
            return;
        };

        let level = clamp_channel(intensity);
        let fixture = &mut self.fixtures[slot];
        if let Some(channel) = fixture.channels.intensity {
            self.universe.lock().set(channel, level);
            fixture.current_intensity = level;
        }
    }

    pub fn set_strobe(&mut self, name: &str, speed: i64) {
        let Some(slot) = self.lookup(name) else {
            return;
        };

        let speed = clamp_channel(speed);
        let fixture = &mut self.fixtures[slot];
        if let Some(channel) = fixture.channels.strobe {
            self.universe.lock().set(channel, speed);
            fixture.strobe = speed;
        }
    }

    pub fn set_all_rgb(&mut self, r: i64, g: i64, b: i64, intensity: Option<i64>) {
        for slot in 0..self.fixtures.len() {
            let name = self.fixtures[slot].name.clone();
            self.set_rgb(&name, r, g, b, intensity);
        }
    }

    pub fn set_all_intensity(&mut self, intensity: i64) {
        for slot in 0..self.fixtures.len() {
            let name = self.fixtures[slot].name.clone();
            self.set_intensity(&name, intensity);
        }
    }

    /// Every fixture to black with zero intensity.
    pub fn blackout(&mut self) {
        self.set_all_rgb(0, 0, 0, Some(0));
    }

    pub fn get_light_state(&self, name: &str) -> Option<LightState> {
        self.fixture(name).map(Fixture::state)
    }

    pub fn get_all_lights_state(&self) -> Vec<LightState> {
        self.fixtures.iter().map(Fixture::state).collect()
    }
}
