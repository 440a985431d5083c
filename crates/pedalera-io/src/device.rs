//! The PCM device seam.
//!
//! The engine assumes a period-synchronous, interleaved PCM device with
//! linked capture and playback streams. [`PcmDriver`] performs open and
//! format negotiation, yielding a [`PcmDevice`] the audio thread then drives
//! one period at a time. Concrete soundcard access (ALSA on the appliance)
//! plugs in behind these traits; this crate ships two implementations:
//!
//! - [`DummyDevice`] - the fallback device: the same period cadence, silent
//!   input, discarded output. The session switches to it when the real
//!   device disappears mid-run.
//! - [`MemoryDevice`] - an unpaced device that plays provided samples and
//!   records what the engine writes; it powers offline rendering and the
//!   deterministic end-to-end tests (including xrun injection).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::format::SampleFormat;
use crate::{IoError, Result};

/// What the caller asks a [`PcmDriver`] to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmRequest {
    /// Device identifier, driver-specific (e.g. `hw:0`).
    pub device_name: String,
    pub sample_rate: u32,
    /// Period size in frames (`F`).
    pub period_frames: usize,
    /// Periods in the device buffer (`P`).
    pub period_count: usize,
}

/// What negotiation actually produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    pub device_name: String,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub period_count: usize,
    pub capture_channels: usize,
    pub playback_channels: usize,
}

impl NegotiatedConfig {
    /// One-line summary for logs and status surfaces.
    pub fn description(&self) -> String {
        format!(
            "{}, {}, {} Hz, {}x{}, in: {}, out: {}",
            self.device_name,
            self.format.description(),
            self.sample_rate,
            self.period_frames,
            self.period_count,
            self.capture_channels,
            self.playback_channels,
        )
    }

    /// Bytes in one interleaved capture period.
    pub fn capture_period_bytes(&self) -> usize {
        self.period_frames * self.capture_channels * self.format.bytes_per_sample()
    }

    pub fn playback_period_bytes(&self) -> usize {
        self.period_frames * self.playback_channels * self.format.bytes_per_sample()
    }
}

/// Errors surfaced by the per-period device calls on the audio thread.
///
/// Messages are static: the audio thread never builds strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PcmError {
    /// Capture overrun or playback underrun; recoverable.
    #[error("xrun")]
    Xrun,
    /// The device is gone; the driver switches to silent pumping.
    #[error("device disconnected")]
    Disconnected,
    #[error("device failure: {0}")]
    Fatal(&'static str),
}

/// A negotiated, period-synchronous capture+playback device pair.
pub trait PcmDevice: Send {
    fn config(&self) -> &NegotiatedConfig;

    /// Prefill playback with silence and start capture.
    fn start(&mut self) -> Result<()>;

    /// Block until one capture period is available and fill `raw` with it.
    fn read_period(&mut self, raw: &mut [u8]) -> std::result::Result<(), PcmError>;

    /// Write exactly one playback period.
    fn write_period(&mut self, raw: &[u8]) -> std::result::Result<(), PcmError>;

    /// Recover from a capture overrun: unlink, drop both streams, prepare
    /// both, refill playback with silence, relink, restart capture.
    fn recover_capture(&mut self) -> std::result::Result<(), PcmError>;

    /// Recover from a playback underrun: prepare and refill with silence.
    fn recover_playback(&mut self) -> std::result::Result<(), PcmError>;
}

/// Opens and negotiates devices by name.
pub trait PcmDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, request: &PcmRequest) -> Result<Box<dyn PcmDevice>>;
}

// --- dummy device ---

/// Silent fallback device: zero input, discarded output, real cadence.
pub struct DummyDevice {
    config: NegotiatedConfig,
    period: Duration,
    next_deadline: Option<Instant>,
}

impl DummyDevice {
    pub fn new(request: &PcmRequest, channels: usize) -> Self {
        let config = NegotiatedConfig {
            device_name: request.device_name.clone(),
            format: SampleFormat::preferred_order()[0],
            sample_rate: request.sample_rate,
            period_frames: request.period_frames,
            period_count: request.period_count,
            capture_channels: channels,
            playback_channels: channels,
        };
        let period = Duration::from_secs_f64(request.period_frames as f64 / request.sample_rate as f64);
        Self {
            config,
            period,
            next_deadline: None,
        }
    }
}

impl PcmDevice for DummyDevice {
    fn config(&self) -> &NegotiatedConfig {
        &self.config
    }

    fn start(&mut self) -> Result<()> {
        self.next_deadline = Some(Instant::now() + self.period);
        Ok(())
    }

    fn read_period(&mut self, raw: &mut [u8]) -> std::result::Result<(), PcmError> {
        let deadline = self
            .next_deadline
            .ok_or(PcmError::Fatal("dummy device not started"))?;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Keep cadence even if we fell behind.
        self.next_deadline = Some(deadline.max(now) + self.period);
        raw.fill(0);
        Ok(())
    }

    fn write_period(&mut self, _raw: &[u8]) -> std::result::Result<(), PcmError> {
        Ok(())
    }

    fn recover_capture(&mut self) -> std::result::Result<(), PcmError> {
        self.next_deadline = Some(Instant::now() + self.period);
        Ok(())
    }

    fn recover_playback(&mut self) -> std::result::Result<(), PcmError> {
        Ok(())
    }
}

/// Opens [`DummyDevice`]s for any name.
pub struct DummyDriver {
    pub channels: usize,
}

impl PcmDriver for DummyDriver {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn open(&self, request: &PcmRequest) -> Result<Box<dyn PcmDevice>> {
        if request.period_frames == 0 || request.sample_rate == 0 {
            return Err(IoError::UnsupportedRate {
                device: request.device_name.clone(),
                rate: request.sample_rate,
            });
        }
        Ok(Box::new(DummyDevice::new(request, self.channels)))
    }
}

// --- memory device ---

/// Shared test/render hooks into a running [`MemoryDevice`].
#[derive(Clone)]
pub struct MemoryDeviceControl {
    inject_capture_xrun: Arc<AtomicBool>,
    recovered: Arc<AtomicU64>,
    periods_read: Arc<AtomicU64>,
    output: Arc<Mutex<Vec<f32>>>,
}

impl MemoryDeviceControl {
    /// Make the next capture read fail with an xrun.
    pub fn inject_capture_xrun(&self) {
        self.inject_capture_xrun.store(true, Ordering::Release);
    }

    /// How many times the device recovered from an injected xrun.
    pub fn recoveries(&self) -> u64 {
        self.recovered.load(Ordering::Acquire)
    }

    /// Capture periods delivered so far.
    pub fn periods_read(&self) -> u64 {
        self.periods_read.load(Ordering::Acquire)
    }

    /// Everything written to playback so far, interleaved.
    pub fn recorded(&self) -> Vec<f32> {
        self.output.lock().expect("memory device output").clone()
    }
}

/// Unpaced in-memory device for offline rendering and end-to-end tests.
///
/// Input is interleaved; when it runs out the device either loops it or
/// keeps delivering silence. Playback is recorded interleaved. Locking
/// happens only on the recording path, which is fine for a test device.
pub struct MemoryDevice {
    config: NegotiatedConfig,
    input: VecDeque<f32>,
    source: Vec<f32>,
    loop_input: bool,
    started: bool,
    control: MemoryDeviceControl,
}

impl MemoryDevice {
    /// `input` is interleaved with `channels` channels.
    pub fn new(
        sample_rate: u32,
        period_frames: usize,
        channels: usize,
        input: Vec<f32>,
        loop_input: bool,
    ) -> (Self, MemoryDeviceControl) {
        let control = MemoryDeviceControl {
            inject_capture_xrun: Arc::new(AtomicBool::new(false)),
            recovered: Arc::new(AtomicU64::new(0)),
            periods_read: Arc::new(AtomicU64::new(0)),
            output: Arc::new(Mutex::new(Vec::new())),
        };
        let device = Self {
            config: NegotiatedConfig {
                device_name: "memory".into(),
                format: SampleFormat::preferred_order()[0],
                sample_rate,
                period_frames,
                period_count: 2,
                capture_channels: channels,
                playback_channels: channels,
            },
            input: input.iter().copied().collect(),
            source: input,
            loop_input,
            started: false,
            control: control.clone(),
        };
        (device, control)
    }

    fn next_sample(&mut self) -> f32 {
        match self.input.pop_front() {
            Some(sample) => sample,
            None => {
                if self.loop_input && !self.source.is_empty() {
                    self.input.extend(self.source.iter().copied());
                    self.input.pop_front().unwrap_or(0.0)
                } else {
                    0.0
                }
            }
        }
    }
}

impl PcmDevice for MemoryDevice {
    fn config(&self) -> &NegotiatedConfig {
        &self.config
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn read_period(&mut self, raw: &mut [u8]) -> std::result::Result<(), PcmError> {
        if !self.started {
            return Err(PcmError::Fatal("memory device not started"));
        }
        if self
            .control
            .inject_capture_xrun
            .swap(false, Ordering::AcqRel)
        {
            return Err(PcmError::Xrun);
        }
        let samples = self.config.period_frames * self.config.capture_channels;
        for i in 0..samples {
            let sample = self.next_sample();
            raw[i * 4..i * 4 + 4].copy_from_slice(&encode_native_f32(sample));
        }
        self.control.periods_read.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn write_period(&mut self, raw: &[u8]) -> std::result::Result<(), PcmError> {
        let samples = self.config.period_frames * self.config.playback_channels;
        let mut output = self
            .control
            .output
            .lock()
            .map_err(|_| PcmError::Fatal("memory device output poisoned"))?;
        for i in 0..samples {
            let bytes = [raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]];
            output.push(decode_native_f32(bytes));
        }
        Ok(())
    }

    fn recover_capture(&mut self) -> std::result::Result<(), PcmError> {
        self.control.recovered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn recover_playback(&mut self) -> std::result::Result<(), PcmError> {
        Ok(())
    }
}

#[cfg(target_endian = "little")]
fn encode_native_f32(v: f32) -> [u8; 4] {
    v.to_le_bytes()
}

#[cfg(target_endian = "big")]
fn encode_native_f32(v: f32) -> [u8; 4] {
    v.to_be_bytes()
}

#[cfg(target_endian = "little")]
fn decode_native_f32(b: [u8; 4]) -> f32 {
    f32::from_le_bytes(b)
}

#[cfg(target_endian = "big")]
fn decode_native_f32(b: [u8; 4]) -> f32 {
    f32::from_be_bytes(b)
}
