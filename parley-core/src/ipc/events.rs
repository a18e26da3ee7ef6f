//! Event types broadcast by `AudioCore`.
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `CoreStatusEvent` | `AudioCore::subscribe_status` |
//! | `AudioActivityEvent` | `AudioCore::subscribe_activity` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Emitted for each block the capture loop processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the raw block in [0.0, 1.0].
    pub rms: f32,
    /// Gate state after this block.
    pub gate_closed: bool,
    /// Debounced speech state after this block.
    pub is_speech: bool,
}

// ---------------------------------------------------------------------------
// Loop status events
// ---------------------------------------------------------------------------

/// Which worker loop a status event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Capture,
    Playback,
}

/// Emitted whenever a loop changes status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatusEvent {
    pub component: Component,
    pub status: LoopStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Status of one worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    /// Created, `start()` not yet called.
    #[default]
    Idle,
    /// Opening the device.
    Starting,
    /// Device open, processing audio.
    Running,
    /// Last attempt failed; retrying with backoff.
    Failed,
    /// Retries exhausted. The loop has exited; restart the core to retry.
    Unavailable,
    /// Stopped on request.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_enums() {
        let event = CoreStatusEvent {
            component: Component::Capture,
            status: LoopStatus::Unavailable,
            detail: Some("no capture device".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["component"], "capture");
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["detail"], "no capture device");

        let round_trip: CoreStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, LoopStatus::Unavailable);
        assert_eq!(round_trip.component, Component::Capture);
    }

    #[test]
    fn loop_status_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<LoopStatus>(r#""Running""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn audio_activity_event_serializes_with_camel_case_fields() {
        let event = AudioActivityEvent {
            seq: 3,
            rms: 0.18,
            gate_closed: true,
            is_speech: false,
        };

        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        let rms = json["rms"].as_f64().expect("rms should serialize as number");
        assert!((rms - 0.18).abs() < 1e-5);
        assert_eq!(json["gateClosed"], true);
        assert_eq!(json["isSpeech"], false);
    }
}
