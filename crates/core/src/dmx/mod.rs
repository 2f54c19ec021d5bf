//! DMX512 universe and the fixed-rate frame transmitter.
//!
//! Fixture writes land in a [`Universe`] shared behind a `parking_lot`
//! mutex. The output loop copies the payload under that lock, releases it,
//! then drives the break / mark-after-break / data sequence on the
//! [`SerialSink`]. Without a sink the loop runs in simulation mode and only
//! advances its counters.

use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{config::DmxConfig, timeline::FrameClock, LightshowError, Result};

/// Addressable channels in one universe.
pub const DMX_CHANNELS: usize = 512;
/// Start code plus payload.
pub const FRAME_LEN: usize = DMX_CHANNELS + 1;
pub const START_CODE: u8 = 0x00;
/// Break is held a little longer than the 88 µs minimum.
pub const BREAK_DURATION: Duration = Duration::from_micros(100);
/// Mark-after-break, minimum 8 µs.
pub const MARK_AFTER_BREAK: Duration = Duration::from_micros(12);

pub type SharedUniverse = Arc<Mutex<Universe>>;

/// 512 channel values. Channel `c` (1-based) lives at payload offset `c - 1`.
#[derive(Clone, PartialEq, Eq)]
pub struct Universe {
    channels: [u8; DMX_CHANNELS],
}

impl Universe {
    pub fn new() -> Self {
        Self {
            channels: [0; DMX_CHANNELS],
        }
    }

    pub fn shared() -> SharedUniverse {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Writes one channel. Returns `false` for addresses outside `1..=512`.
    pub fn set(&mut self, channel: u16, value: u8) -> bool {
        match Self::offset(channel) {
            Some(offset) => {
                self.channels[offset] = value;
                true
            }
            None => false,
        }
    }

    /// Writes to an optional channel; absent channels are ignored.
    pub fn set_optional(&mut self, channel: Option<u16>, value: u8) {
        if let Some(channel) = channel {
            self.set(channel, value);
        }
    }

    pub fn get(&self, channel: u16) -> Option<u8> {
        Self::offset(channel).map(|offset| self.channels[offset])
    }

    pub fn payload(&self) -> &[u8; DMX_CHANNELS] {
        &self.channels
    }

    pub fn clear(&mut self) {
        self.channels.fill(0);
    }

    /// Copies start code and payload into `out`.
    pub fn write_frame(&self, out: &mut [u8; FRAME_LEN]) {
        out[0] = START_CODE;
        out[1..].copy_from_slice(&self.channels);
    }

    pub fn frame(&self) -> [u8; FRAME_LEN] {
        let mut out = [0; FRAME_LEN];
        self.write_frame(&mut out);
        out
    }

    fn offset(channel: u16) -> Option<usize> {
        let channel = channel as usize;
        (1..=DMX_CHANNELS).contains(&channel).then(|| channel - 1)
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.channels.iter().filter(|value| **value > 0).count();
        f.debug_struct("Universe").field("lit_channels", &lit).finish()
    }
}

/// Already-open serial link capable of DMX512 framing.
pub trait SerialSink: Send {
    /// Sets the line to `baud_rate`, 8 data bits, 2 stop bits, no parity.
    fn configure(&mut self, baud_rate: u32) -> io::Result<()>;
    fn set_break(&mut self, active: bool) -> io::Result<()>;
    /// Writes one complete frame in a single call.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink over any byte writer, for interfaces that generate the break
/// themselves (USB DMX dongles exposed as a tty, or a capture file).
#[derive(Debug)]
pub struct WriteSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> SerialSink for WriteSink<W> {
    fn configure(&mut self, baud_rate: u32) -> io::Result<()> {
        tracing::debug!(baud_rate, "line settings are owned by the interface");
        Ok(())
    }

    fn set_break(&mut self, _active: bool) -> io::Result<()> {
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame)?;
        self.writer.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Lock-free counters shared between the output loop and status readers.
#[derive(Debug)]
pub struct TransmitterStats {
    frame_count: AtomicU64,
    failed_writes: AtomicU64,
    last_update_micros: AtomicU64,
    measured_fps_bits: AtomicU64,
    target_fps_bits: AtomicU64,
    simulation: AtomicBool,
}

impl TransmitterStats {
    fn new(target_fps: f64, simulation: bool) -> Self {
        Self {
            frame_count: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            last_update_micros: AtomicU64::new(0),
            measured_fps_bits: AtomicU64::new(0f64.to_bits()),
            target_fps_bits: AtomicU64::new(target_fps.to_bits()),
            simulation: AtomicBool::new(simulation),
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the last successful frame.
    pub fn last_update(&self) -> Option<SystemTime> {
        match self.last_update_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(UNIX_EPOCH + Duration::from_micros(micros)),
        }
    }

    pub fn measured_fps(&self) -> f64 {
        f64::from_bits(self.measured_fps_bits.load(Ordering::Relaxed))
    }

    pub fn target_fps(&self) -> f64 {
        f64::from_bits(self.target_fps_bits.load(Ordering::Relaxed))
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DmxStatus {
        DmxStatus {
            frame_count: self.frame_count(),
            failed_writes: self.failed_writes(),
            last_update: self
                .last_update()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|since| since.as_secs_f64()),
            measured_fps: self.measured_fps(),
            target_fps: self.target_fps(),
            simulation: self.is_simulation(),
        }
    }

    fn record_frame(&self) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_micros() as u64)
            .unwrap_or(1);
        self.last_update_micros.store(micros.max(1), Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn set_measured_fps(&self, fps: f64) {
        self.measured_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    fn set_simulation(&self, simulation: bool) {
        self.simulation.store(simulation, Ordering::Relaxed);
    }
}

/// Serializable copy of [`TransmitterStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmxStatus {
    pub frame_count: u64,
    pub failed_writes: u64,
    /// Seconds since the Unix epoch.
    pub last_update: Option<f64>,
    pub measured_fps: f64,
    pub target_fps: f64,
    pub simulation: bool,
}

/// Emits the universe as DMX512 frames at a fixed refresh rate.
pub struct DmxTransmitter {
    universe: SharedUniverse,
    sink: Option<Box<dyn SerialSink>>,
    refresh_rate_hz: f64,
    baud_rate: u32,
    stats: Arc<TransmitterStats>,
    frame: [u8; FRAME_LEN],
}

impl DmxTransmitter {
    /// Creates a transmitter in simulation mode.
    pub fn new(universe: SharedUniverse, config: &DmxConfig) -> Self {
        Self {
            universe,
            sink: None,
            refresh_rate_hz: config.refresh_rate_hz,
            baud_rate: config.baud_rate,
            stats: Arc::new(TransmitterStats::new(config.refresh_rate_hz, true)),
            frame: [0; FRAME_LEN],
        }
    }

    /// Configures and attaches a sink. On failure the sink is discarded and
    /// the transmitter stays in simulation mode.
    pub fn attach_sink(&mut self, mut sink: Box<dyn SerialSink>) -> Result<()> {
        if let Err(err) = sink.configure(self.baud_rate) {
            tracing::warn!(error = %err, "serial sink configuration failed, running in simulation mode");
            self.sink = None;
            self.stats.set_simulation(true);
            return Err(LightshowError::Serial(err));
        }

        tracing::info!(baud_rate = self.baud_rate, "serial sink attached");
        self.sink = Some(sink);
        self.stats.set_simulation(false);
        Ok(())
    }

    pub fn stats(&self) -> Arc<TransmitterStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_simulation(&self) -> bool {
        self.sink.is_none()
    }

    /// Sends the current universe once.
    pub fn send_frame(&mut self) -> Result<()> {
        self.universe.lock().write_frame(&mut self.frame);

        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = transmit(sink.as_mut(), &self.frame) {
                self.stats.record_failure();
                return Err(LightshowError::Serial(err));
            }
        }

        self.stats.record_frame();
        Ok(())
    }

    /// Output loop. Returns after `stop` is raised, having sent one
    /// all-zero frame and closed the sink.
    pub fn run(&mut self, stop: &AtomicBool) {
        let mut clock = FrameClock::from_rate(self.refresh_rate_hz);
        let mut window_start = Instant::now();
        let mut window_frames = 0u64;

        tracing::info!(
            refresh_rate_hz = self.refresh_rate_hz,
            simulation = self.is_simulation(),
            "dmx output loop started"
        );

        while !stop.load(Ordering::Relaxed) {
            clock.begin();

            match self.send_frame() {
                Ok(()) => window_frames += 1,
                Err(err) => tracing::warn!(error = %err, "dmx frame failed"),
            }

            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                self.stats
                    .set_measured_fps(window_frames as f64 / elapsed.as_secs_f64());
                window_start = Instant::now();
                window_frames = 0;
            }

            clock.finish();
        }

        self.shutdown();
        tracing::info!(
            frames = self.stats.frame_count(),
            overruns = clock.overruns(),
            "dmx output loop stopped"
        );
    }

    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dmx-output".to_string())
            .spawn(move || self.run(&stop))
            .map_err(|err| LightshowError::Thread(err.to_string()))
    }

    fn shutdown(&mut self) {
        let Some(mut sink) = self.sink.take() else {
            return;
        };

        let mut blackout = [0u8; FRAME_LEN];
        blackout[0] = START_CODE;
        if let Err(err) = transmit(sink.as_mut(), &blackout) {
            tracing::warn!(error = %err, "failed to send blackout frame");
        }
        if let Err(err) = sink.close() {
            tracing::warn!(error = %err, "failed to close serial sink");
        }
    }
}

impl std::fmt::Debug for DmxTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmxTransmitter")
            .field("refresh_rate_hz", &self.refresh_rate_hz)
            .field("simulation", &self.is_simulation())
            .field("frames", &self.stats.frame_count())
            .finish()
    }
}

fn transmit(sink: &mut dyn SerialSink, frame: &[u8]) -> io::Result<()> {
    sink.set_break(true)?;
    thread::sleep(BREAK_DURATION);
    sink.set_break(false)?;
    thread::sleep(MARK_AFTER_BREAK);
    sink.write_frame(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Configure(u32),
        Break(bool),
        Frame(Vec<u8>),
        Close,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<Event>>>,
        fail_configure: bool,
        fail_writes: bool,
    }

    impl SerialSink for RecordingSink {
        fn configure(&mut self, baud_rate: u32) -> io::Result<()> {
            if self.fail_configure {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no access"));
            }
            self.events.lock().push(Event::Configure(baud_rate));
            Ok(())
        }

        fn set_break(&mut self, active: bool) -> io::Result<()> {
            self.events.lock().push(Event::Break(active));
            Ok(())
        }

        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            self.events.lock().push(Event::Frame(frame.to_vec()));
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.events.lock().push(Event::Close);
            Ok(())
        }
    }

    #[test]
    fn universe_maps_one_based_channels() {
        let mut universe = Universe::new();
        assert!(universe.set(1, 10));
        assert!(universe.set(512, 20));
        assert!(!universe.set(0, 30));
        assert!(!universe.set(513, 40));

        let frame = universe.frame();
        assert_eq!(frame.len(), 513);
        assert_eq!(frame[0], START_CODE);
        assert_eq!(frame[1], 10);
        assert_eq!(frame[512], 20);
    }

    #[test]
    fn frame_is_break_then_single_write() {
        let universe = Universe::shared();
        universe.lock().set(3, 99);
        let sink = RecordingSink::default();
        let events = Arc::clone(&sink.events);

        let mut transmitter = DmxTransmitter::new(universe, &DmxConfig::default());
        transmitter.attach_sink(Box::new(sink)).unwrap();
        transmitter.send_frame().unwrap();

        let events = events.lock();
        assert_eq!(events[0], Event::Configure(250_000));
        assert_eq!(events[1], Event::Break(true));
        assert_eq!(events[2], Event::Break(false));
        let Event::Frame(frame) = &events[3] else {
            panic!("expected a frame, got {:?}", events[3]);
        };
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(frame[0], 0);
        assert_eq!(frame[3], 99);
        assert_eq!(transmitter.stats().frame_count(), 1);
    }

    #[test]
    fn configure_failure_falls_back_to_simulation() {
        let sink = RecordingSink {
            fail_configure: true,
            ..Default::default()
        };
        let mut transmitter = DmxTransmitter::new(Universe::shared(), &DmxConfig::default());

        let err = transmitter.attach_sink(Box::new(sink)).unwrap_err();
        assert!(matches!(err, LightshowError::Serial(_)));
        assert!(transmitter.is_simulation());
        assert!(transmitter.stats().is_simulation());
        transmitter.send_frame().unwrap();
        assert_eq!(transmitter.stats().frame_count(), 1);
    }

    #[test]
    fn write_failures_are_counted() {
        let sink = RecordingSink {
            fail_writes: true,
            ..Default::default()
        };
        let mut transmitter = DmxTransmitter::new(Universe::shared(), &DmxConfig::default());
        transmitter.attach_sink(Box::new(sink)).unwrap();

        assert!(transmitter.send_frame().is_err());
        assert!(transmitter.send_frame().is_err());
        let stats = transmitter.stats();
        assert_eq!(stats.failed_writes(), 2);
        assert_eq!(stats.frame_count(), 0);
    }

    #[test]
    fn stop_sends_blackout_and_closes() {
        let universe = Universe::shared();
        universe.lock().set(1, 255);
        let sink = RecordingSink::default();
        let events = Arc::clone(&sink.events);

        let mut transmitter = DmxTransmitter::new(Arc::clone(&universe), &DmxConfig::default());
        transmitter.attach_sink(Box::new(sink)).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = transmitter.spawn(Arc::clone(&stop)).unwrap();
        thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let events = events.lock();
        assert_eq!(events.last(), Some(&Event::Close));
        let frames: Vec<&Vec<u8>> = events
            .iter()
            .filter_map(|event| match event {
                Event::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect();
        assert!(frames.len() >= 2);
        assert_eq!(frames[0][1], 255);
        assert!(frames.last().unwrap().iter().all(|value| *value == 0));
    }

    #[test]
    fn simulation_tracks_refresh_rate() {
        let config = DmxConfig {
            refresh_rate_hz: 40.0,
            ..DmxConfig::default()
        };
        let transmitter = DmxTransmitter::new(Universe::shared(), &config);
        let stats = transmitter.stats();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = transmitter.spawn(Arc::clone(&stop)).unwrap();
        thread::sleep(Duration::from_secs(1));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let frames = stats.frame_count();
        assert!((36..=44).contains(&frames), "frames = {frames}");
        assert!(stats.last_update().is_some());
        assert!(stats.is_simulation());
    }

    #[test]
    fn write_sink_passes_frames_through() {
        let mut sink = WriteSink::new(Vec::new());
        sink.configure(250_000).unwrap();
        sink.set_break(true).unwrap();
        sink.write_frame(&Universe::new().frame()).unwrap();
        assert_eq!(sink.into_inner().len(), FRAME_LEN);
    }
}
