//! Runtime context that owns every component and drives the three loops:
//! analysis (ring buffer to feature slot), effects (feature slot to fixture
//! rig) and DMX output (universe to serial sink).

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{AudioFeatures, FeatureExtractor, FeatureSlot},
    audio::{CaptureHandle, RingBuffer},
    config::AppConfig,
    dmx::{DmxStatus, DmxTransmitter, SerialSink, SharedUniverse, TransmitterStats, Universe},
    effects::{EffectMode, EffectStatus, EffectsEngine},
    fixture::{FixtureRig, LightState},
    timeline::{FrameClock, ShowClock},
    LightshowError, Result,
};

/// Ring buffer diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingStatus {
    pub capacity: usize,
    pub occupancy: usize,
    pub dropped_pushes: u64,
    pub contended_pushes: u64,
}

/// Loop counters for the analysis and effects threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub analysis_ticks: u64,
    pub analysis_failures: u64,
    pub effects_ticks: u64,
    pub effects_failures: u64,
    /// Effects updates per second since start.
    pub effects_fps: f64,
}

/// Everything the status surface reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub uptime_seconds: f64,
    pub features: AudioFeatures,
    pub dmx: DmxStatus,
    pub lights: Vec<LightState>,
    pub effects: EffectStatus,
    pub ring: RingStatus,
    pub loops: LoopStatus,
}

#[derive(Debug, Default)]
struct LoopCounters {
    analysis_ticks: AtomicU64,
    analysis_failures: AtomicU64,
    effects_ticks: AtomicU64,
    effects_failures: AtomicU64,
}

pub struct Lightshow {
    config: AppConfig,
    clock: ShowClock,
    ring: Arc<RingBuffer>,
    features: Arc<FeatureSlot>,
    universe: SharedUniverse,
    rig: Arc<Mutex<FixtureRig>>,
    effects: Arc<Mutex<EffectsEngine>>,
    dmx_stats: Arc<TransmitterStats>,
    counters: Arc<LoopCounters>,
    transmitter: Option<DmxTransmitter>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    started_at: Option<f64>,
}

impl Lightshow {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_seed(config, None)
    }

    /// Like [`new`](Self::new) with a fixed seed for the effects engine.
    pub fn with_seed(config: AppConfig, seed: Option<u64>) -> Result<Self> {
        config.validate()?;

        let ring = Arc::new(RingBuffer::new(
            config.audio.ring_capacity(),
            config.audio.sample_rate,
        ));
        let universe = Universe::shared();
        let rig = FixtureRig::new(&config.fixtures, Arc::clone(&universe));
        if rig.is_empty() {
            tracing::warn!("no fixtures configured, output stays dark");
        }
        let effects = EffectsEngine::new(&config.effects, &rig, seed)?;
        let transmitter = DmxTransmitter::new(Arc::clone(&universe), &config.dmx);

        Ok(Self {
            clock: ShowClock::start(),
            ring,
            features: Arc::new(FeatureSlot::new()),
            universe,
            rig: Arc::new(Mutex::new(rig)),
            effects: Arc::new(Mutex::new(effects)),
            dmx_stats: transmitter.stats(),
            counters: Arc::new(LoopCounters::default()),
            transmitter: Some(transmitter),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            started_at: None,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Handle for the capture collaborator.
    pub fn capture_handle(&self) -> CaptureHandle {
        CaptureHandle::new(Arc::clone(&self.ring), self.config.audio.channels)
    }

    /// Flag raised by [`stop`](Self::stop); sources feeding the capture
    /// handle can share it.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn universe(&self) -> &SharedUniverse {
        &self.universe
    }

    /// Attaches the serial sink. Must happen before [`start`](Self::start);
    /// a sink that fails to configure leaves the show in simulation mode.
    pub fn attach_sink(&mut self, sink: Box<dyn SerialSink>) -> Result<()> {
        let transmitter = self
            .transmitter
            .as_mut()
            .ok_or_else(|| LightshowError::msg("output loop already started"))?;
        transmitter.attach_sink(sink)
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && !self.stop.load(Ordering::Relaxed)
    }

    /// Spawns the analysis, effects and output loops.
    pub fn start(&mut self) -> Result<()> {
        let transmitter = self
            .transmitter
            .take()
            .ok_or_else(|| LightshowError::msg("lightshow already started"))?;

        self.started_at = Some(self.clock.now_seconds());
        tracing::info!(
            fixtures = self.rig.lock().len(),
            sample_rate = self.config.audio.sample_rate,
            simulation = transmitter.is_simulation(),
            "starting lightshow"
        );

        match self.spawn_analysis() {
            Ok(handle) => self.workers.push(handle),
            Err(err) => return Err(self.abort(err)),
        }

        match self.spawn_effects() {
            Ok(handle) => self.workers.push(handle),
            Err(err) => return Err(self.abort(err)),
        }

        match transmitter.spawn(Arc::clone(&self.stop)) {
            Ok(handle) => self.workers.push(handle),
            Err(err) => return Err(self.abort(err)),
        }

        Ok(())
    }

    fn spawn_analysis(&self) -> Result<JoinHandle<()>> {
        let mut extractor =
            FeatureExtractor::new(self.config.analysis.clone(), self.config.audio.sample_rate);
        let ring = Arc::clone(&self.ring);
        let slot = Arc::clone(&self.features);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop);
        let clock = self.clock;
        let rate = self.config.analysis.tick_rate_hz;

        thread::Builder::new()
            .name("analysis".to_string())
            .spawn(move || {
                let mut pacing = FrameClock::from_rate(rate);
                while !stop.load(Ordering::Relaxed) {
                    pacing.begin();
                    if let Some(features) = extractor.tick(&ring, clock.now_seconds()) {
                        slot.publish(features);
                        counters.analysis_ticks.fetch_add(1, Ordering::Relaxed);
                    }
                    counters
                        .analysis_failures
                        .store(extractor.failed_ticks(), Ordering::Relaxed);
                    pacing.finish();
                }
                tracing::debug!(overruns = pacing.overruns(), "analysis loop stopped");
            })
            .map_err(|err| LightshowError::Thread(err.to_string()))
    }

    fn spawn_effects(&self) -> Result<JoinHandle<()>> {
        let slot = Arc::clone(&self.features);
        let effects = Arc::clone(&self.effects);
        let rig = Arc::clone(&self.rig);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop);
        let clock = self.clock;
        let rate = self.config.effects.tick_rate_hz;

        thread::Builder::new()
            .name("effects".to_string())
            .spawn(move || {
                let mut pacing = FrameClock::from_rate(rate);
                while !stop.load(Ordering::Relaxed) {
                    pacing.begin();
                    let features = slot.load();
                    let result = {
                        let mut engine = effects.lock();
                        let mut rig = rig.lock();
                        engine.update(&features, clock.now_seconds(), &mut rig)
                    };
                    match result {
                        Ok(()) => {
                            counters.effects_ticks.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            counters.effects_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(%err, "effects tick failed");
                        }
                    }
                    pacing.finish();
                }
                tracing::debug!(overruns = pacing.overruns(), "effects loop stopped");
            })
            .map_err(|err| LightshowError::Thread(err.to_string()))
    }

    fn abort(&mut self, err: LightshowError) -> LightshowError {
        tracing::error!(%err, "failed to start lightshow");
        if let Err(stop_err) = self.stop() {
            tracing::warn!(%stop_err, "cleanup after failed start");
        }
        err
    }

    /// Raises the stop flag, joins every loop and blacks out the rig. The
    /// output loop sends one all-zero frame on its way out.
    pub fn stop(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }

        tracing::info!("stopping lightshow");
        self.stop.store(true, Ordering::Relaxed);

        let mut panicked = 0usize;
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                tracing::error!(thread = %name, "worker panicked");
                panicked += 1;
            }
        }

        self.rig.lock().blackout();
        tracing::info!(frames = self.dmx_stats.frame_count(), "lightshow stopped");

        if panicked > 0 {
            return Err(LightshowError::Thread(format!("{panicked} worker(s) panicked")));
        }
        Ok(())
    }

    pub fn set_mode(&self, mode: EffectMode) {
        self.effects.lock().set_mode(mode);
    }

    pub fn set_mode_by_name(&self, name: &str) {
        self.effects.lock().set_mode_by_name(name);
    }

    pub fn set_palette(&self, name: &str) {
        self.effects.lock().set_palette(name);
    }

    pub fn release_palette(&self) {
        self.effects.lock().release_palette();
    }

    pub fn set_auto_rotate(&self, enabled: bool) {
        self.effects.lock().set_auto_rotate(enabled);
    }

    /// Latest published features.
    pub fn features(&self) -> Arc<AudioFeatures> {
        self.features.load()
    }

    pub fn dmx_stats(&self) -> Arc<TransmitterStats> {
        Arc::clone(&self.dmx_stats)
    }

    pub fn get_light_state(&self, name: &str) -> Option<LightState> {
        self.rig.lock().get_light_state(name)
    }

    pub fn get_all_lights_state(&self) -> Vec<LightState> {
        self.rig.lock().get_all_lights_state()
    }

    pub fn status(&self) -> StatusReport {
        let uptime = self
            .started_at
            .map_or(0.0, |start| self.clock.now_seconds() - start);
        let effects = self.effects.lock().status();
        let lights = self.get_all_lights_state();
        let effects_ticks = self.counters.effects_ticks.load(Ordering::Relaxed);

        StatusReport {
            running: self.is_running(),
            uptime_seconds: uptime,
            features: (*self.features.load()).clone(),
            dmx: self.dmx_stats.snapshot(),
            lights,
            effects,
            ring: RingStatus {
                capacity: self.ring.capacity(),
                occupancy: self.ring.occupancy(),
                dropped_pushes: self.ring.dropped_pushes(),
                contended_pushes: self.ring.contended_pushes(),
            },
            loops: LoopStatus {
                analysis_ticks: self.counters.analysis_ticks.load(Ordering::Relaxed),
                analysis_failures: self.counters.analysis_failures.load(Ordering::Relaxed),
                effects_ticks,
                effects_failures: self.counters.effects_failures.load(Ordering::Relaxed),
                effects_fps: if uptime > 0.0 {
                    effects_ticks as f64 / uptime
                } else {
                    0.0
                },
            },
        }
    }

    /// One-line performance summary at info level.
    pub fn log_performance(&self) {
        let status = self.status();
        tracing::info!(
            fps = format_args!("{:.1}", status.loops.effects_fps),
            dmx_fps = format_args!("{:.1}", status.dmx.measured_fps),
            volume = format_args!("{:.2}", status.features.smoothed_volume),
            beats = status.features.beat_count,
            tempo = format_args!("{:.0}", status.features.tempo_bpm),
            mode = %status.effects.mode,
            palette = %status.effects.palette,
            "performance"
        );
    }
}

impl Drop for Lightshow {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "lightshow did not stop cleanly");
        }
    }
}

impl std::fmt::Debug for Lightshow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lightshow")
            .field("running", &self.is_running())
            .field("ring", &self.ring)
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::FixtureConfig;

    fn small_config() -> AppConfig {
        let mut config = AppConfig::live_defaults();
        config.audio.sample_rate = 8_000;
        config.analysis.window_seconds = 0.5;
        config.analysis.frame_length = 512;
        config.analysis.hop_length = 128;
        config
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = small_config();
        config.dmx.refresh_rate_hz = 0.0;
        assert!(matches!(
            Lightshow::new(config),
            Err(LightshowError::Config(_))
        ));
    }

    #[test]
    fn commands_reach_the_engine() {
        let show = Lightshow::with_seed(small_config(), Some(1)).unwrap();
        show.set_mode(EffectMode::Chase);
        show.set_palette("calm");
        show.set_mode_by_name("not_a_mode");

        let status = show.status();
        assert_eq!(status.effects.mode, EffectMode::Chase);
        assert_eq!(status.effects.palette, "calm");
        assert!(status.effects.palette_pinned);
        assert!(!status.running);
        assert_eq!(status.lights.len(), 4);
    }

    #[test]
    fn start_stop_runs_and_blacks_out() {
        let mut config = small_config();
        config.fixtures = vec![FixtureConfig::five_channel("solo", 1)];
        let mut show = Lightshow::with_seed(config, Some(3)).unwrap();
        let capture = show.capture_handle();
        capture.push_samples(&vec![0.3; 8_000]);

        show.start().unwrap();
        assert!(show.is_running());
        assert!(show.start().is_err());
        thread::sleep(Duration::from_millis(300));
        show.stop().unwrap();

        let status = show.status();
        assert!(!status.running);
        assert!(status.dmx.frame_count > 0);
        assert!(status.loops.effects_ticks > 0);
        assert!(status.loops.analysis_ticks > 0);
        let light = show.get_light_state("solo").unwrap();
        assert_eq!(light.intensity, 0);
        assert!(show.universe().lock().payload().iter().all(|v| *v == 0));
    }

    #[test]
    fn status_serialises() {
        let show = Lightshow::new(small_config()).unwrap();
        let json = serde_json::to_value(show.status()).unwrap();
        assert_eq!(json["effects"]["mode"], "auto");
        assert_eq!(json["dmx"]["simulation"], true);
        assert_eq!(json["lights"][0]["name"], "par_1");
    }
}
