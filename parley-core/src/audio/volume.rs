//! System output volume.
//!
//! The speaker amp on small boards pops when the codec powers up. The
//! playback engine therefore holds volume at 0 until the first sound actually
//! starts and ramps it back down on stop.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ParleyError, Result};

pub trait VolumeControl: Send + Sync {
    /// Set output volume, `percent` in 0..=100.
    fn set_volume(&self, percent: u8) -> Result<()>;

    /// Current output volume, when the control can report it.
    fn volume(&self) -> Option<u8> {
        None
    }
}

/// Drives an ALSA mixer control through `amixer`.
#[derive(Debug, Clone)]
pub struct AmixerVolume {
    control: String,
}

impl AmixerVolume {
    pub fn new(control: impl Into<String>) -> Self {
        Self {
            control: control.into(),
        }
    }
}

impl VolumeControl for AmixerVolume {
    fn set_volume(&self, percent: u8) -> Result<()> {
        let status = Command::new("amixer")
            .args(["-q", "sset", &self.control, &format!("{}%", percent.min(100))])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ParleyError::Process(format!("amixer: {e}")))?;
        if !status.success() {
            return Err(ParleyError::Process(format!(
                "amixer sset {} exited with {status}",
                self.control
            )));
        }
        Ok(())
    }

    fn volume(&self) -> Option<u8> {
        let output = Command::new("amixer")
            .args(["sget", &self.control])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| debug!("amixer sget: {e}"))
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_amixer_percent(&String::from_utf8_lossy(&output.stdout))
    }
}

/// First `[NN%]` field of `amixer sget` output.
fn parse_amixer_percent(output: &str) -> Option<u8> {
    output.split('[').skip(1).find_map(|field| {
        let (value, _) = field.split_once("%]")?;
        value.parse::<u8>().ok().map(|v| v.min(100))
    })
}

/// Leaves system volume alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVolume;

impl VolumeControl for NoopVolume {
    fn set_volume(&self, _percent: u8) -> Result<()> {
        Ok(())
    }
}

/// Steps volume toward a target so changes are not audible clicks.
#[derive(Clone)]
pub struct VolumeRamp {
    control: Arc<dyn VolumeControl>,
    steps: u32,
    duration: Duration,
    current: Arc<parking_lot::Mutex<u8>>,
}

impl VolumeRamp {
    /// Starts from the control's reported level, or 0 when it cannot say.
    pub fn new(control: Arc<dyn VolumeControl>, steps: u32, duration: Duration) -> Self {
        let initial = control.volume().unwrap_or(0).min(100);
        Self {
            control,
            steps: steps.max(1),
            duration,
            current: Arc::new(parking_lot::Mutex::new(initial)),
        }
    }

    /// Ramp from the last level set to `target`. Failures are logged, never
    /// returned: a broken mixer must not stop audio.
    pub fn ramp_to(&self, target: u8) {
        let target = target.min(100);
        let mut current = self.current.lock();
        let from = *current as i32;
        let step_sleep = self.duration / self.steps;
        for step in 1..=self.steps {
            let level = from + (target as i32 - from) * step as i32 / self.steps as i32;
            if let Err(e) = self.control.set_volume(level as u8) {
                warn!("volume ramp to {target}% failed: {e}");
                break;
            }
            if step < self.steps && !step_sleep.is_zero() {
                std::thread::sleep(step_sleep);
            }
        }
        *current = target;
        debug!(from, target, "volume ramp complete");
    }

    pub fn current(&self) -> u8 {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u8>>);

    impl VolumeControl for Recorder {
        fn set_volume(&self, percent: u8) -> Result<()> {
            self.0.lock().push(percent);
            Ok(())
        }
    }

    #[test]
    fn ramp_steps_monotonically_to_target() {
        let recorder = Arc::new(Recorder::default());
        let ramp = VolumeRamp::new(recorder.clone(), 4, Duration::ZERO);
        ramp.ramp_to(80);
        assert_eq!(*recorder.0.lock(), vec![20, 40, 60, 80]);
        ramp.ramp_to(0);
        assert_eq!(recorder.0.lock()[4..], [60, 40, 20, 0]);
        assert_eq!(ramp.current(), 0);
    }

    struct Reporting(Recorder, u8);

    impl VolumeControl for Reporting {
        fn set_volume(&self, percent: u8) -> Result<()> {
            self.0.set_volume(percent)
        }

        fn volume(&self) -> Option<u8> {
            Some(self.1)
        }
    }

    #[test]
    fn first_ramp_starts_from_the_reported_level() {
        let control = Arc::new(Reporting(Recorder::default(), 60));
        let ramp = VolumeRamp::new(control.clone(), 4, Duration::ZERO);
        assert_eq!(ramp.current(), 60);
        ramp.ramp_to(0);
        assert_eq!(*control.0 .0.lock(), vec![45, 30, 15, 0]);
    }

    #[test]
    fn amixer_percent_is_read_from_the_first_channel() {
        let output = "Simple mixer control 'Speaker',0\n  \
            Front Left: Playback 52 [81%] [-15.00dB] [on]\n  \
            Front Right: Playback 40 [62%] [-20.00dB] [on]\n";
        assert_eq!(parse_amixer_percent(output), Some(81));
        assert_eq!(parse_amixer_percent("Mono: Playback [on]"), None);
    }

    #[test]
    fn noop_accepts_anything() {
        assert!(NoopVolume.set_volume(255).is_ok());
    }
}
