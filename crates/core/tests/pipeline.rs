use std::{
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use lightshow_core::{
    dmx::FRAME_LEN, AppConfig, ClickTrack, EffectMode, Lightshow, SerialSink, WriteSink,
};
use parking_lot::Mutex;

fn test_config() -> AppConfig {
    let mut config = AppConfig::live_defaults();
    config.audio.sample_rate = 16_000;
    config.analysis.window_seconds = 1.0;
    config.analysis.frame_length = 1024;
    config.analysis.hop_length = 256;
    config.effects.auto_rotate = false;
    config
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

#[test]
fn click_track_drives_lights_headless() {
    let mut show = Lightshow::with_seed(test_config(), Some(11)).unwrap();
    show.set_mode(EffectMode::Pulse);

    let capture = show.capture_handle();
    let track = ClickTrack::new(capture.sample_rate(), 150.0)
        .spawn(capture, show.stop_flag())
        .unwrap();
    show.start().unwrap();

    let noise_floor = test_config().analysis.volume.noise_floor;
    let lit = wait_for(Duration::from_secs(6), || {
        let status = show.status();
        status.features.volume > noise_floor
            && status.lights.iter().any(|light| light.intensity > 0)
    });
    assert!(lit, "lights never came up: {:?}", show.status());

    // 120 BPM is the starting value, so only a tracked 150 proves the
    // estimator followed the clicks.
    let tracked = wait_for(Duration::from_secs(10), || {
        (show.status().features.tempo_bpm - 150.0).abs() <= 1.0
    });
    let status = show.status();
    assert!(tracked, "tempo stuck at {}", status.features.tempo_bpm);
    assert!(status.features.beat_count >= 3);
    assert!(status.dmx.simulation);
    assert!(status.dmx.frame_count > 0);
    assert!(status.loops.analysis_ticks > 0);
    assert_eq!(status.ring.dropped_pushes, 0);

    show.stop().unwrap();
    track.join().unwrap();

    for light in show.get_all_lights_state() {
        assert_eq!(light.intensity, 0);
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn write_sink_receives_whole_frames() {
    let bytes = SharedBuffer::default();
    let mut show = Lightshow::with_seed(test_config(), Some(5)).unwrap();
    show.attach_sink(Box::new(WriteSink::new(bytes.clone()))).unwrap();
    show.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || bytes.0.lock().len() >= FRAME_LEN * 4));
    show.stop().unwrap();

    let written = bytes.0.lock();
    assert_eq!(written.len() % FRAME_LEN, 0);
    for frame in written.chunks(FRAME_LEN) {
        assert_eq!(frame[0], 0);
    }
    let last = written.chunks(FRAME_LEN).last().unwrap();
    assert!(last.iter().all(|value| *value == 0));
    assert!(!show.status().dmx.simulation);
}

#[test]
fn sink_trait_object_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<Box<dyn SerialSink>>();
    assert_send::<Lightshow>();
}
