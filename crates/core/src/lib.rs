//! Core library for the audio-reactive DMX lightshow.
//!
//! Audio enters through a [`CaptureHandle`] into a lock-protected
//! [`RingBuffer`]. The [`FeatureExtractor`] turns fixed windows of it into
//! [`AudioFeatures`], the [`EffectsEngine`] maps those onto fixture colors
//! and the [`DmxTransmitter`] streams the resulting universe to a serial
//! sink. [`Lightshow`] owns all of it and runs each stage on its own loop.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod dmx;
pub mod effects;
pub mod error;
pub mod fixture;
pub mod show;
pub mod timeline;

pub use analysis::{AudioFeatures, BandEnergy, FeatureExtractor, FeatureSlot};
pub use audio::{AudioWindow, CaptureHandle, ClickTrack, RingBuffer};
pub use config::{AppConfig, AudioConfig, EffectsConfig, FixtureConfig};
pub use dmx::{DmxTransmitter, SerialSink, TransmitterStats, Universe, WriteSink};
pub use effects::{EffectMode, EffectStatus, EffectsEngine};
pub use error::{LightshowError, Result};
pub use fixture::{FixtureRig, LightState, Rgb};
pub use show::{Lightshow, StatusReport};
pub use timeline::{FrameClock, ShowClock};
