//! Persistent daemon settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::config::DeviceBackend;
use parley_core::CoreConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DaemonSettings {
    /// Everything the audio core needs.
    pub core: CoreConfig,
    /// Seconds between diagnostics log lines; 0 disables them.
    pub diagnostics_interval_secs: u64,
    /// Played once the core is up.
    pub startup_sound: Option<PathBuf>,
    pub startup_sound_loudness: f32,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            diagnostics_interval_secs: 30,
            startup_sound: None,
            startup_sound_loudness: 0.1,
        }
    }
}

impl DaemonSettings {
    pub fn normalize(&mut self) {
        self.core.normalize();
        self.diagnostics_interval_secs = self.diagnostics_interval_secs.min(3_600);
        self.startup_sound = self
            .startup_sound
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.startup_sound_loudness = if self.startup_sound_loudness.is_nan() {
            0.0
        } else {
            self.startup_sound_loudness.clamp(0.0, 1.0)
        };
    }
}

pub fn normalize_backend(raw: &str) -> Option<DeviceBackend> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "cpal" | "native" => Some(DeviceBackend::Cpal),
        "process" | "alsa" | "arecord" | "aplay" => Some(DeviceBackend::Process),
        _ => None,
    }
}

/// Environment overrides for quick field debugging without editing the file.
pub fn apply_env_overrides(settings: &mut DaemonSettings) {
    if let Ok(device) = std::env::var("PARLEY_INPUT_DEVICE") {
        settings.core.devices.input_device = Some(device);
    }
    if let Ok(device) = std::env::var("PARLEY_OUTPUT_DEVICE") {
        settings.core.devices.output_device = Some(device);
    }
    if let Ok(raw) = std::env::var("PARLEY_AUDIO_BACKEND") {
        match normalize_backend(&raw) {
            Some(backend) => settings.core.devices.backend = backend,
            None => warn!(value = raw.as_str(), "ignoring unknown PARLEY_AUDIO_BACKEND"),
        }
    }
    if let Ok(path) = std::env::var("PARLEY_VAD_MODEL") {
        settings.core.vad.model_path = Some(PathBuf::from(path));
    }
    settings.normalize();
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("PARLEY_SETTINGS") {
        return PathBuf::from(path);
    }
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("parley")
        .join("settings.json")
}

pub fn load_settings(path: &Path) -> DaemonSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<DaemonSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "invalid settings file, using defaults: {e}");
            DaemonSettings::default()
        }),
        Err(_) => DaemonSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &DaemonSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
