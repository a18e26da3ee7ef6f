use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
#[cfg(unix)]
use parley_core::audio::process::{CommandSpec, ProcessPlaybackDevice};
use parley_core::audio::volume::VolumeControl;
use parley_core::audio::{PlaybackDevice, SampleWriter};
use parley_core::engine::diagnostics::StatusReporter;
use parley_core::playback::{PlaybackEngine, PlaybackMonitor};
use parley_core::{BlockFormat, CoreConfig, LoopStatus, ParleyError, Result, SoundSource};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Volume(u8),
    Write { rms: f32 },
    Drain,
}

type Log = Arc<Mutex<Vec<Event>>>;

struct LoggedVolume(Log);

impl VolumeControl for LoggedVolume {
    fn set_volume(&self, percent: u8) -> Result<()> {
        self.0.lock().push(Event::Volume(percent));
        Ok(())
    }
}

struct LoggedDevice(Log);

struct LoggedWriter(Log);

impl PlaybackDevice for LoggedDevice {
    fn name(&self) -> &str {
        "logged"
    }

    fn open(&mut self, _format: BlockFormat) -> Result<Box<dyn SampleWriter>> {
        Ok(Box::new(LoggedWriter(Arc::clone(&self.0))))
    }
}

impl SampleWriter for LoggedWriter {
    fn write(&mut self, samples: &[f32], _deadline: Instant) -> Result<()> {
        self.0.lock().push(Event::Write {
            rms: parley_core::buffering::block::rms(samples),
        });
        Ok(())
    }

    fn drain(&mut self, _deadline: Instant) -> Result<()> {
        self.0.lock().push(Event::Drain);
        Ok(())
    }
}

fn config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.playback.volume_ramp_steps = 4;
    config.playback.volume_ramp_ms = 0;
    config.playback.restore_volume_percent = 80;
    config.shutdown_timeout_ms = 500;
    config
}

fn engine(config: &CoreConfig, log: &Log) -> PlaybackEngine {
    let monitor = PlaybackMonitor::new(config.format.sample_rate, 500, 1e-4);
    PlaybackEngine::new(
        config,
        monitor,
        Arc::new(LoggedVolume(Arc::clone(log))),
        StatusReporter::detached(),
    )
}

fn tone(blocks: usize) -> SoundSource {
    SoundSource::samples(vec![0.25; 320 * blocks], 16_000)
}

fn writes(log: &Log) -> usize {
    log.lock()
        .iter()
        .filter(|e| matches!(e, Event::Write { .. }))
        .count()
}

#[test]
fn clear_queue_before_execution_plays_nothing() {
    let config = config();
    let log: Log = Arc::default();
    let engine = engine(&config, &log);

    assert!(engine.enqueue(tone(3), 0.0));
    assert!(engine.enqueue(tone(3), 0.0));
    assert!(engine.enqueue(tone(3), 0.0));
    assert_eq!(engine.clear_queue(), 3);

    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(writes(&log), 0);
    assert!(!engine.is_playing());
    engine.stop();
}

#[test]
fn volume_is_zero_until_first_sound_and_after_stop() {
    let config = config();
    let log: Log = Arc::default();
    let engine = engine(&config, &log);

    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();
    engine.play_blocking(tone(3), 0.0).unwrap();
    engine.stop();

    let events = log.lock().clone();
    let first_write = events
        .iter()
        .position(|e| matches!(e, Event::Write { .. }))
        .expect("sound was written");

    assert!(events[..first_write]
        .iter()
        .all(|e| *e == Event::Volume(0)));
    assert!(events[first_write..].contains(&Event::Volume(80)));
    assert_eq!(events.last(), Some(&Event::Volume(0)));
    assert_eq!(engine.status(), LoopStatus::Stopped);
}

#[test]
fn queued_sounds_play_in_order_at_target_loudness() {
    let config = config();
    let log: Log = Arc::default();
    let engine = engine(&config, &log);

    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();
    assert!(engine.enqueue(tone(2), 0.1));
    assert!(engine.enqueue(tone(2), 0.2));
    // Let the queue drain so the blocking request lands last.
    thread::sleep(Duration::from_millis(150));
    engine.play_blocking(tone(1), 0.0).unwrap();
    engine.stop();

    let levels: Vec<f32> = log
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::Write { rms } => Some(*rms),
            _ => None,
        })
        .collect();
    assert_eq!(levels.len(), 5);
    approx::assert_abs_diff_eq!(levels[0], 0.1, epsilon = 1e-4);
    approx::assert_abs_diff_eq!(levels[2], 0.2, epsilon = 1e-4);
    approx::assert_abs_diff_eq!(levels[4], 0.25, epsilon = 1e-4);
}

#[test]
fn undecodable_file_is_skipped_and_queue_continues() {
    let config = config();
    let log: Log = Arc::default();
    let engine = engine(&config, &log);

    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();
    let missing = SoundSource::file("/nonexistent/parley/beep.wav");
    assert!(engine.enqueue(missing.clone(), 0.0));
    assert!(engine.enqueue(tone(1), 0.0));

    let err = engine.play_blocking(missing, 0.0).unwrap_err();
    assert!(!matches!(err, ParleyError::EngineStopped | ParleyError::NotRunning));

    let deadline = Instant::now() + Duration::from_secs(2);
    while writes(&log) < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(writes(&log), 1);
    engine.stop();
}

#[test]
fn engine_restarts_after_stop() {
    let config = config();
    let log: Log = Arc::default();
    let engine = engine(&config, &log);

    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();
    engine.stop();
    assert!(!engine.enqueue(tone(1), 0.0));

    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();
    assert!(matches!(
        engine.start(Box::new(LoggedDevice(Arc::clone(&log)))),
        Err(ParleyError::AlreadyRunning)
    ));
    engine.play_blocking(tone(1), 0.0).unwrap();
    assert_eq!(writes(&log), 1);
    engine.stop();
}

#[test]
fn clear_queue_while_busy_keeps_the_current_entry_only() {
    let config = config();
    let log: Log = Arc::default();
    let engine = engine(&config, &log);

    // 25 blocks take about half a second at real-time pacing.
    assert!(engine.enqueue(tone(25), 0.0));
    for _ in 0..3 {
        assert!(engine.enqueue(tone(1), 0.1));
    }
    engine.start(Box::new(LoggedDevice(Arc::clone(&log)))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while writes(&log) < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(engine.queue_len(), 3);
    assert_eq!(engine.clear_queue(), 3);

    let deadline = Instant::now() + Duration::from_secs(3);
    while writes(&log) < 25 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(200));
    engine.stop();

    let levels: Vec<f32> = log
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::Write { rms } => Some(*rms),
            _ => None,
        })
        .collect();
    assert_eq!(levels.len(), 25);
    assert!(levels.iter().all(|&rms| (rms - 0.25).abs() < 1e-4));
}

#[cfg(unix)]
#[test]
fn stalled_playback_process_is_bounded_by_the_entry_timeout() {
    let mut config = config();
    config.playback.max_entry_ms = 3_000;
    let log: Log = Arc::default();
    let engine = engine(&config, &log);
    engine
        .start(Box::new(ProcessPlaybackDevice::new(
            "stalled",
            CommandSpec::new("sleep", ["60"]),
        )))
        .unwrap();

    let started = Instant::now();
    let thirty_seconds = SoundSource::samples(vec![0.25; 16_000 * 30], 16_000);
    let err = engine.play_blocking(thirty_seconds, 0.0).unwrap_err();
    assert!(matches!(err, ParleyError::EntryTimedOut(_)), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(8));

    // The device is reopened for the next entry.
    engine.play_blocking(tone(1), 0.0).unwrap();
    engine.stop();
}
