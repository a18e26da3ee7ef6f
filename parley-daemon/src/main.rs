//! Parley headless device daemon.
//!
//! Loads settings, starts the audio core and logs what it hears until Ctrl-C.
//!
//! ```text
//! parley [--settings PATH] [--list-devices] [--save-settings]
//! ```
//!
//! `RUST_LOG` controls log verbosity (default `parley=info`).

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parley_core::{
    audio::device::{list_devices, DeviceDirection},
    AudioCore, LoopStatus, SoundSource, SpeechListener,
};
use settings::{apply_env_overrides, default_settings_path, load_settings, save_settings};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
enum ListenerEvent {
    SpeechStart,
    SpeechEnd,
    BargeIn,
}

/// Forwards capture-thread callbacks to the async side without blocking.
struct ChannelListener(mpsc::UnboundedSender<ListenerEvent>);

impl SpeechListener for ChannelListener {
    fn on_speech_start(&self) {
        let _ = self.0.send(ListenerEvent::SpeechStart);
    }

    fn on_speech_end(&self) {
        let _ = self.0.send(ListenerEvent::SpeechEnd);
    }

    fn on_barge_in(&self) {
        let _ = self.0.send(ListenerEvent::BargeIn);
    }
}

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Parley headless device daemon")]
struct Cli {
    /// Settings file (default: $XDG_DATA_HOME/parley/settings.json)
    #[arg(long, env = "PARLEY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Write the normalized settings back to the file and exit
    #[arg(long)]
    save_settings: bool,
}

fn print_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("no audio devices found");
        return;
    }
    for dir in [DeviceDirection::Input, DeviceDirection::Output] {
        println!("{dir:?} devices:");
        for d in devices.iter().filter(|d| d.direction == dir) {
            let mut flags = Vec::new();
            if d.is_default {
                flags.push("default");
            }
            if d.is_loopback_like {
                flags.push("loopback");
            }
            if flags.is_empty() {
                println!("  {}", d.name);
            } else {
                println!("  {} ({})", d.name, flags.join(", "));
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info")),
        )
        .init();

    let args = Cli::parse();
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let settings_path = args.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if args.save_settings {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "normalized settings saved");
        return Ok(());
    }
    apply_env_overrides(&mut settings);

    info!(
        settings = %settings_path.display(),
        backend = ?settings.core.devices.backend,
        sample_rate = settings.core.format.sample_rate,
        block_len = settings.core.format.block_len,
        "Parley starting"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let core = Arc::new(AudioCore::new(
        settings.core.clone(),
        Arc::new(ChannelListener(events_tx)),
    ));
    let mut status_rx = core.subscribe_status();

    {
        let core = Arc::clone(&core);
        tokio::task::spawn_blocking(move || core.start_from_config())
            .await
            .context("start task panicked")?
            .context("starting audio core")?;
    }

    if let Some(path) = settings.startup_sound.clone() {
        if !core
            .playback()
            .enqueue(SoundSource::file(path), settings.startup_sound_loudness)
        {
            warn!("startup sound not queued");
        }
    }

    let interval_secs = settings.diagnostics_interval_secs;
    let mut diagnostics = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    diagnostics.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            Some(event) = events_rx.recv() => match event {
                ListenerEvent::SpeechStart => info!("speech started"),
                ListenerEvent::SpeechEnd => info!("speech ended"),
                ListenerEvent::BargeIn => {
                    let dropped = core.playback().clear_queue();
                    info!(dropped, "barge-in: pending sounds cancelled");
                }
            },
            status = status_rx.recv() => match status {
                Ok(ev) if ev.status == LoopStatus::Unavailable => {
                    warn!(component = ?ev.component, "audio path gave up; restart the daemon once the device is back");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "status events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = diagnostics.tick(), if interval_secs > 0 => {
                let snap = core.snapshot();
                info!(
                    rms = format_args!("{:.4}", snap.current_rms),
                    gate_closed = snap.gate_closed,
                    speech = snap.speech_active,
                    vad = snap.vad_backend,
                    gated = snap.gated_samples,
                    ungated = snap.ungated_samples,
                    barge_ins = snap.barge_ins,
                    playback_timeouts = snap.playback_timeouts,
                    capture = ?snap.capture_status,
                    playback = ?snap.playback_status,
                    "diagnostics"
                );
            }
        }
    }

    let core_for_stop = Arc::clone(&core);
    tokio::task::spawn_blocking(move || core_for_stop.stop())
        .await
        .context("stop task panicked")?
        .context("stopping audio core")?;
    info!("Parley stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_flags_and_settings_path() {
        let cli = Cli::try_parse_from([
            "parley",
            "--settings",
            "/etc/parley.json",
            "--list-devices",
        ])
        .unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/parley.json")));
        assert!(cli.list_devices);
        assert!(!cli.save_settings);
    }

    #[test]
    fn cli_rejects_unknown_arguments() {
        assert!(Cli::try_parse_from(["parley", "--bogus"]).is_err());
        assert!(Cli::try_parse_from(["parley", "--settings"]).is_err());
    }
}
