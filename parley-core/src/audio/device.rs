//! Audio device enumeration and name resolution.

use serde::{Deserialize, Serialize};

/// Which side of the audio path a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the host's default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture output audio (monitor
    /// sources). Capturing from one of these feeds the device its own speech.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "monitor of",
    "loopback",
    "stereo mix",
    "what u hear",
    "what you hear",
    "virtual output",
];

/// Best-effort heuristic for loopback/monitor capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Pick the index of the device named `wanted`: exact match first, then a
/// case-insensitive substring match (ALSA names are long and users abbreviate).
pub fn match_device_name<'a>(names: impl IntoIterator<Item = &'a str>, wanted: &str) -> Option<usize> {
    let wanted = wanted.trim();
    let names: Vec<&str> = names.into_iter().collect();
    if let Some(idx) = names.iter().position(|n| *n == wanted) {
        return Some(idx);
    }
    let lowered = wanted.to_ascii_lowercase();
    names
        .iter()
        .position(|n| n.to_ascii_lowercase().contains(&lowered))
}

/// List the host's input and output devices, defaults first.
///
/// Returns an empty `Vec` when the host cannot enumerate devices.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let mut list = Vec::new();

    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_in.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    direction: DeviceDirection::Input,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate input devices: {e}"),
    }

    let default_out = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_out.as_deref() == Some(name.as_str()),
                    is_loopback_like: false,
                    direction: DeviceDirection::Output,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate output devices: {e}"),
    }

    list.sort_by_key(|d| {
        (
            d.direction == DeviceDirection::Output,
            !d.is_default,
            d.is_loopback_like,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Resolve a cpal device by preferred name, falling back to the host default
/// and then to the first available device.
#[cfg(feature = "audio-cpal")]
pub fn resolve_device(
    direction: DeviceDirection,
    preferred: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::{info, warn};

    use crate::error::ParleyError;

    let host = cpal::default_host();
    let list = || -> crate::error::Result<Vec<cpal::Device>> {
        let devices = match direction {
            DeviceDirection::Input => host.input_devices().map(|d| d.collect()),
            DeviceDirection::Output => host.output_devices().map(|d| d.collect()),
        };
        devices.map_err(|e| ParleyError::AudioDevice(e.to_string()))
    };

    if let Some(wanted) = preferred {
        match list() {
            Ok(mut devices) => {
                let names: Vec<String> = devices
                    .iter()
                    .map(|d| d.name().unwrap_or_default())
                    .collect();
                if let Some(idx) = match_device_name(names.iter().map(String::as_str), wanted) {
                    let device = devices.swap_remove(idx);
                    info!(device = %names[idx], ?direction, "using configured device");
                    return Ok(device);
                }
                warn!(wanted, ?direction, "configured device not found, falling back");
            }
            Err(e) => warn!("failed to list devices while resolving preference: {e}"),
        }
    }

    let default = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    list()?.into_iter().next().ok_or_else(|| {
        ParleyError::DeviceUnavailable(preferred.unwrap_or("<default>").to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_monitor_sources() {
        assert!(is_loopback_like_name("Monitor of Built-in Audio Analog Stereo"));
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(!is_loopback_like_name("USB PnP Sound Device"));
    }

    #[test]
    fn exact_name_beats_substring() {
        let names = ["hw:CARD=Device,DEV=0", "hw", "plughw:CARD=Device,DEV=0"];
        assert_eq!(match_device_name(names, "hw"), Some(1));
        assert_eq!(match_device_name(names, "PLUGHW"), Some(2));
        assert_eq!(match_device_name(names, "seeed"), None);
    }

    #[test]
    fn device_info_serializes_camel_case() {
        let info = DeviceInfo {
            name: "default".into(),
            direction: DeviceDirection::Output,
            is_default: true,
            is_loopback_like: false,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"isDefault\":true"));
        assert!(json.contains("\"direction\":\"output\""));
    }
}
