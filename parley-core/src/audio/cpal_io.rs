//! In-process capture and playback through cpal.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They must
//! not block on a mutex or perform I/O. Both directions therefore talk to
//! the worker thread through an SPSC ring whose `push_slice`/`pop_slice` are
//! lock-free. The mix buffers are sized once at open time.
//!
//! If the device cannot run at the pipeline rate, the device's native rate is
//! used and a `RateConverter` on the worker side bridges the two.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedStreamConfig};
use tracing::{error, info, warn};

use super::{
    device::{resolve_device, DeviceDirection},
    resample::RateConverter,
    BlockReader, CaptureDevice, PlaybackDevice, SampleWriter,
};
use crate::{
    buffering::{
        block::{AudioBlock, BlockFormat},
        create_sample_ring, Consumer, Observer, Producer, SampleConsumer, SampleProducer,
        CAPTURE_RING_CAPACITY,
    },
    error::{ParleyError, Result},
};

/// Poll interval while waiting for the callback to deliver or drain samples.
const POLL_INTERVAL: Duration = Duration::from_millis(2);
/// Largest callback buffer the preallocated mix buffers cover.
const MAX_CALLBACK_FRAMES: usize = 16_384;
/// Playback ring: 1 s at 48 kHz keeps enough lead without adding echo delay.
const PLAYBACK_RING_CAPACITY: usize = 48_000;

/// Prefer a config at `rate` with the fewest channels, else the device default.
fn pick_config(
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    default: SupportedStreamConfig,
    rate: u32,
) -> SupportedStreamConfig {
    let wanted = cpal::SampleRate(rate);
    ranges
        .into_iter()
        .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
        .filter(|r| {
            matches!(
                r.sample_format(),
                SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U8
            )
        })
        .min_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32))
        .map(|r| r.with_sample_rate(wanted))
        .unwrap_or(default)
}

fn stream_config(supported: &SupportedStreamConfig) -> StreamConfig {
    StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Capture from a named (or default) input device.
pub struct CpalCaptureDevice {
    name: String,
    preferred: Option<String>,
}

impl CpalCaptureDevice {
    pub fn new(preferred: Option<String>) -> Self {
        Self {
            name: preferred.clone().unwrap_or_else(|| "default input".into()),
            preferred,
        }
    }
}

impl CaptureDevice for CpalCaptureDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, format: BlockFormat) -> Result<Box<dyn BlockReader>> {
        let device = resolve_device(DeviceDirection::Input, self.preferred.as_deref())?;
        let device_name = device.name().unwrap_or_default();

        let ranges: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map(|r| r.collect())
            .unwrap_or_default();
        let default = device
            .default_input_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let supported = pick_config(ranges, default, format.sample_rate);
        let config = stream_config(&supported);
        let device_rate = config.sample_rate.0;

        info!(
            device = device_name.as_str(),
            device_rate,
            channels = config.channels,
            pipeline_rate = format.sample_rate,
            "opening input device"
        );

        let (producer, consumer) = create_sample_ring(CAPTURE_RING_CAPACITY);
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, producer, Arc::clone(&failed)),
            SampleFormat::I16 => build_input::<i16>(&device, &config, producer, Arc::clone(&failed)),
            SampleFormat::U8 => build_input::<u8>(&device, &config, producer, Arc::clone(&failed)),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        let converter = if device_rate == format.sample_rate {
            None
        } else {
            Some(RateConverter::new(device_rate, format.sample_rate, 1024)?)
        };

        Ok(Box::new(CpalBlockReader {
            _stream: stream,
            consumer,
            converter,
            failed,
            scratch: vec![0.0; MAX_CALLBACK_FRAMES],
            pending: Vec::with_capacity(format.block_len * 4),
            format,
        }))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: SampleProducer,
    failed: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mix = vec![0f32; MAX_CALLBACK_FRAMES];
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                for chunk in data.chunks(MAX_CALLBACK_FRAMES * channels) {
                    let frames = chunk.len() / channels;
                    for (f, out) in mix.iter_mut().take(frames).enumerate() {
                        let base = f * channels;
                        let sum: f32 = chunk[base..base + channels]
                            .iter()
                            .map(|s| s.to_sample::<f32>())
                            .sum();
                        *out = sum / channels as f32;
                    }
                    // A full ring drops the newest audio; the worker is behind.
                    let _ = producer.push_slice(&mix[..frames]);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

struct CpalBlockReader {
    /// Kept alive so the stream is not dropped prematurely.
    _stream: Stream,
    consumer: SampleConsumer,
    converter: Option<RateConverter>,
    failed: Arc<AtomicBool>,
    scratch: Vec<f32>,
    pending: Vec<f32>,
    format: BlockFormat,
}

impl CpalBlockReader {
    fn fill_pending(&mut self) {
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                return;
            }
            match self.converter.as_mut() {
                Some(converter) => {
                    let converted = converter.process(&self.scratch[..n]);
                    self.pending.extend_from_slice(&converted);
                }
                None => self.pending.extend_from_slice(&self.scratch[..n]),
            }
        }
    }
}

impl BlockReader for CpalBlockReader {
    fn read_block(&mut self, timeout: Duration) -> Result<Option<AudioBlock>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.failed.load(Ordering::Acquire) {
                return Err(ParleyError::AudioStream("input stream reported an error".into()));
            }
            if self.pending.len() < self.format.block_len {
                self.fill_pending();
            }
            if self.pending.len() >= self.format.block_len {
                let samples: Vec<f32> = self.pending.drain(..self.format.block_len).collect();
                return Ok(Some(AudioBlock::new(samples, self.format.sample_rate)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Playback to a named (or default) output device.
pub struct CpalPlaybackDevice {
    name: String,
    preferred: Option<String>,
}

impl CpalPlaybackDevice {
    pub fn new(preferred: Option<String>) -> Self {
        Self {
            name: preferred.clone().unwrap_or_else(|| "default output".into()),
            preferred,
        }
    }
}

impl PlaybackDevice for CpalPlaybackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, format: BlockFormat) -> Result<Box<dyn SampleWriter>> {
        let device = resolve_device(DeviceDirection::Output, self.preferred.as_deref())?;
        let device_name = device.name().unwrap_or_default();

        let ranges: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map(|r| r.collect())
            .unwrap_or_default();
        let default = device
            .default_output_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let supported = pick_config(ranges, default, format.sample_rate);
        let config = stream_config(&supported);
        let device_rate = config.sample_rate.0;

        info!(
            device = device_name.as_str(),
            device_rate,
            channels = config.channels,
            "opening output device"
        );

        let (producer, consumer) = create_sample_ring(PLAYBACK_RING_CAPACITY);
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, Arc::clone(&failed)),
            SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, Arc::clone(&failed)),
            SampleFormat::U8 => build_output::<u8>(&device, &config, consumer, Arc::clone(&failed)),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        let converter = if device_rate == format.sample_rate {
            None
        } else {
            warn!(device_rate, pipeline_rate = format.sample_rate, "output resampling enabled");
            Some(RateConverter::new(format.sample_rate, device_rate, format.block_len)?)
        };

        Ok(Box::new(CpalSampleWriter {
            _stream: stream,
            producer,
            converter,
            failed,
        }))
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: SampleConsumer,
    failed: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = vec![0f32; MAX_CALLBACK_FRAMES];
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                for chunk in data.chunks_mut(MAX_CALLBACK_FRAMES * channels) {
                    let frames = chunk.len() / channels;
                    let got = consumer.pop_slice(&mut mono[..frames]);
                    // Underrun: pad with silence.
                    mono[got..frames].fill(0.0);
                    for (frame, &sample) in chunk.chunks_mut(channels).zip(&mono[..frames]) {
                        frame.fill(T::from_sample(sample));
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

struct CpalSampleWriter {
    _stream: Stream,
    producer: SampleProducer,
    converter: Option<RateConverter>,
    failed: Arc<AtomicBool>,
}

impl CpalSampleWriter {
    fn check(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ParleyError::AudioStream("output stream reported an error".into()));
        }
        Ok(())
    }
}

impl SampleWriter for CpalSampleWriter {
    fn write(&mut self, samples: &[f32], deadline: Instant) -> Result<()> {
        let converted;
        let mut remaining = match self.converter.as_mut() {
            Some(converter) => {
                converted = converter.process(samples);
                &converted[..]
            }
            None => samples,
        };
        while !remaining.is_empty() {
            self.check()?;
            let pushed = self.producer.push_slice(remaining);
            remaining = &remaining[pushed..];
            if remaining.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ParleyError::AudioStream(
                    "output ring did not drain before deadline".into(),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn drain(&mut self, deadline: Instant) -> Result<()> {
        if let Some(converter) = self.converter.as_mut() {
            let tail = converter.flush();
            let _ = self.producer.push_slice(&tail);
        }
        while self.producer.occupied_len() > 0 {
            self.check()?;
            if Instant::now() >= deadline {
                warn!(
                    left = self.producer.occupied_len(),
                    "playback drain timed out"
                );
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}
