use std::{
    f32::consts::PI,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{LightshowError, Result};

/// Fraction of capacity above which incoming chunks are dropped.
const HIGH_WATER_MARK: f64 = 0.9;

/// One analysis window of mono samples, immutable once extracted.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    samples: Vec<f32>,
    sample_rate: u32,
    end_position: u64,
}

impl AudioWindow {
    /// Window treated as the start of a stream: it ends at sample `len`.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let end_position = samples.len() as u64;
        Self {
            samples,
            sample_rate,
            end_position,
        }
    }

    /// Sets the absolute stream position (in samples) just past the window.
    pub fn with_end_position(mut self, end_position: u64) -> Self {
        self.end_position = end_position.max(self.samples.len() as u64);
        self
    }

    pub fn end_position(&self) -> u64 {
        self.end_position
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

struct RingState {
    samples: Box<[f32]>,
    write_pos: usize,
    total_written: u64,
    /// Samples pushed since the last `read_latest`.
    unread: usize,
}

impl RingState {
    fn write(&mut self, sample: f32) {
        self.samples[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
    }
}

/// Fixed-capacity mono sample ring fed by the capture callback.
///
/// `push` never waits on the lock and never allocates: when the consumer
/// has fallen behind (unread samples above 90 % of capacity) or the lock is
/// momentarily held by a reader, the chunk is discarded and counted.
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
    sample_rate: u32,
    high_water: usize,
    dropped: AtomicU64,
    contended: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                samples: vec![0.0; capacity].into_boxed_slice(),
                write_pos: 0,
                total_written: 0,
                unread: 0,
            }),
            capacity,
            sample_rate,
            high_water: (capacity as f64 * HIGH_WATER_MARK) as usize,
            dropped: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Ring sized for `seconds` of audio.
    pub fn with_duration(sample_rate: u32, seconds: f64) -> Self {
        Self::new((sample_rate as f64 * seconds).round() as usize, sample_rate)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Appends mono samples. Returns `false` if the chunk was dropped.
    pub fn push(&self, samples: &[f32]) -> bool {
        self.push_frames(samples.len(), |state| {
            for &sample in samples {
                state.write(sample);
            }
        })
    }

    /// Appends interleaved multi-channel samples, averaging each frame to mono.
    pub fn push_interleaved(&self, data: &[f32], channels: usize) -> bool {
        if channels <= 1 {
            return self.push(data);
        }

        let scale = 1.0 / channels as f32;
        self.push_frames(data.len() / channels, |state| {
            for frame in data.chunks_exact(channels) {
                state.write(frame.iter().sum::<f32>() * scale);
            }
        })
    }

    fn push_frames(&self, frames: usize, write: impl FnOnce(&mut RingState)) -> bool {
        if frames == 0 {
            return true;
        }

        let Some(mut state) = self.state.try_lock() else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        if state.unread + frames > self.high_water {
            drop(state);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        write(&mut *state);
        state.total_written += frames as u64;
        state.unread += frames;
        true
    }

    /// Copies out the most recent `n` samples and marks everything as read.
    pub fn read_latest(&self, n: usize) -> Result<AudioWindow> {
        let mut state = self.state.lock();
        let available = (state.total_written.min(self.capacity as u64)) as usize;
        if n == 0 || n > available {
            return Err(LightshowError::InsufficientData {
                needed: n,
                available,
            });
        }

        let start = (state.write_pos + self.capacity - n) % self.capacity;
        let mut samples = Vec::with_capacity(n);
        if start + n <= self.capacity {
            samples.extend_from_slice(&state.samples[start..start + n]);
        } else {
            samples.extend_from_slice(&state.samples[start..]);
            samples.extend_from_slice(&state.samples[..n - (self.capacity - start)]);
        }
        state.unread = 0;
        let end_position = state.total_written;
        drop(state);

        Ok(AudioWindow::new(samples, self.sample_rate).with_end_position(end_position))
    }

    /// Samples currently retrievable by `read_latest`.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.total_written.min(self.capacity as u64) as usize
    }

    /// Samples pushed since the last read.
    pub fn occupancy(&self) -> usize {
        self.state.lock().unread
    }

    /// Chunks dropped because the reader fell behind.
    pub fn dropped_pushes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Chunks dropped because the lock was held by a reader.
    pub fn contended_pushes(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("sample_rate", &self.sample_rate)
            .field("dropped", &self.dropped_pushes())
            .field("contended", &self.contended_pushes())
            .finish()
    }
}

/// Handle given to the capture collaborator. Cloning is cheap and every
/// clone feeds the same ring.
#[derive(Clone, Debug)]
pub struct CaptureHandle {
    ring: Arc<RingBuffer>,
    channels: usize,
}

impl CaptureHandle {
    pub fn new(ring: Arc<RingBuffer>, channels: u16) -> Self {
        Self {
            ring,
            channels: channels.max(1) as usize,
        }
    }

    /// Push-style entry point for the real-time callback.
    pub fn push_samples(&self, data: &[f32]) -> bool {
        self.ring.push_interleaved(data, self.channels)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.ring.sample_rate()
    }
}

/// Synthetic kick-drum track for running the show without an audio device.
#[derive(Debug, Clone)]
pub struct ClickTrack {
    sample_rate: u32,
    samples_per_beat: u64,
    position: u64,
    amplitude: f32,
}

impl ClickTrack {
    pub fn new(sample_rate: u32, bpm: f64) -> Self {
        let samples_per_beat = (sample_rate as f64 * 60.0 / bpm.max(1.0)).round() as u64;
        Self {
            sample_rate,
            samples_per_beat: samples_per_beat.max(1),
            position: 0,
            amplitude: 0.8,
        }
    }

    /// Renders the next `out.len()` mono samples: a decaying 60 Hz thump on
    /// every beat over a quiet 440 Hz bed.
    pub fn fill(&mut self, out: &mut [f32]) {
        let rate = self.sample_rate as f32;
        for sample in out.iter_mut() {
            let t = self.position as f32 / rate;
            let since_beat = (self.position % self.samples_per_beat) as f32 / rate;
            let envelope = (-since_beat * 30.0).exp();
            let kick = (2.0 * PI * 60.0 * since_beat).sin() * envelope * self.amplitude;
            let bed = (2.0 * PI * 440.0 * t).sin() * 0.02;
            *sample = kick + bed;
            self.position += 1;
        }
    }

    /// Feeds the capture handle in real time from a background thread.
    pub fn spawn(
        mut self,
        capture: CaptureHandle,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let chunk = (self.sample_rate / 100).max(1) as usize;
        let period = Duration::from_secs_f64(chunk as f64 / self.sample_rate as f64);

        thread::Builder::new()
            .name("click-track".to_string())
            .spawn(move || {
                let mut mono = vec![0.0_f32; chunk];
                let mut interleaved = vec![0.0_f32; chunk * capture.channels()];
                let mut next = Instant::now();
                while !stop.load(Ordering::Relaxed) {
                    self.fill(&mut mono);
                    for (frame, &value) in interleaved
                        .chunks_exact_mut(capture.channels())
                        .zip(mono.iter())
                    {
                        frame.fill(value);
                    }
                    capture.push_samples(&interleaved);

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|err| LightshowError::Thread(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_latest_returns_recent_samples_in_order() {
        let ring = RingBuffer::new(8, 100);
        ring.push(&[1.0, 2.0, 3.0, 4.0]);

        let window = ring.read_latest(3).unwrap();
        assert_eq!(window.samples(), &[2.0, 3.0, 4.0]);
        assert_eq!(window.sample_rate(), 100);
    }

    #[test]
    fn wraps_and_preserves_time_order() {
        let ring = RingBuffer::new(10, 100);
        ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        ring.read_latest(1).unwrap();
        ring.push(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);

        let window = ring.read_latest(10).unwrap();
        assert_eq!(
            window.samples(),
            &[3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]
        );
    }

    #[test]
    fn reports_insufficient_data() {
        let ring = RingBuffer::new(16, 100);
        ring.push(&[0.5; 4]);

        match ring.read_latest(5) {
            Err(LightshowError::InsufficientData { needed, available }) => {
                assert_eq!(needed, 5);
                assert_eq!(available, 4);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn drops_pushes_above_high_water_mark() {
        let ring = RingBuffer::new(100, 100);

        for _ in 0..9 {
            assert!(ring.push(&[0.1; 10]));
        }
        assert!(!ring.push(&[0.1; 10]));
        assert!(!ring.push(&[0.1; 1]));
        assert_eq!(ring.dropped_pushes(), 2);
        assert_eq!(ring.occupancy(), 90);

        ring.read_latest(50).unwrap();
        assert_eq!(ring.occupancy(), 0);
        assert!(ring.push(&[0.1; 10]));
        assert_eq!(ring.dropped_pushes(), 2);
    }

    #[test]
    fn downmixes_interleaved_input() {
        let ring = RingBuffer::new(8, 100);
        ring.push_interleaved(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2);

        let window = ring.read_latest(3).unwrap();
        assert_eq!(window.samples(), &[0.5, 0.5, 0.0]);
    }

    #[test]
    fn click_track_is_periodic() {
        let mut track = ClickTrack::new(1_000, 120.0);
        let mut samples = vec![0.0; 1_000];
        track.fill(&mut samples);

        let peak_first = samples[..100].iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        let tail_first = samples[400..500].iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        let peak_second = samples[500..600].iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!(peak_first > 0.3);
        assert!(tail_first < 0.1);
        assert!(peak_second > 0.3);
    }
}
