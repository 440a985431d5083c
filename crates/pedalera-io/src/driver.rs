//! The realtime audio driver.
//!
//! [`AudioDriver::start`] takes a negotiated [`PcmDevice`], a channel map,
//! and the session's raw MIDI sources, and spawns the one realtime thread.
//! Each iteration: poll MIDI, read one capture period (recovering from
//! overruns), decode to planar floats, hand the block to the
//! [`AudioDriverHost`], encode with clamping, write one playback period
//! (recovering from underruns).
//!
//! The audio thread only ever blocks in the device's period wait. It does
//! not allocate, lock, open files, or log; realtime conditions surface
//! through the host callbacks. If the device fails fatally the thread keeps
//! pumping silent blocks into the host at period cadence until it is told
//! to terminate, so the control plane stays serviced while the session
//! fails over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use pedalera_midi::{MidiDecoder, MidiEvent, MidiEventBuffer};

use crate::device::{NegotiatedConfig, PcmDevice, PcmError};
use crate::midi_input::RawMidiInput;
use crate::{IoError, Result};

/// Most device channels the driver maps into a chain.
const MAX_MAPPED_CHANNELS: usize = 8;

/// Events one block can carry before drops.
const MAX_EVENTS_PER_BLOCK: usize = 4096;

/// Scratch for one raw MIDI poll.
const MIDI_READ_BYTES: usize = 1024;

/// Per-block callbacks the driver makes into the engine.
pub trait AudioDriverHost: Send + 'static {
    /// One audio block: planar inputs and outputs of `frames` samples, plus
    /// the block's MIDI events in arrival order.
    fn on_process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    );

    /// An xrun was detected (capture or playback side).
    fn on_underrun(&mut self);

    /// The driver loop exited; silent pumping may follow.
    fn on_audio_stopped(&mut self);

    /// Polled each block; true asks the driver to exit.
    fn should_terminate(&self) -> bool;
}

/// Which device channels feed the chain and receive its output, in order.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl ChannelMap {
    /// Identity mapping over the first `inputs`/`outputs` channels.
    pub fn identity(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs: (0..inputs).collect(),
            outputs: (0..outputs).collect(),
        }
    }

    fn validate(&self, config: &NegotiatedConfig) -> Result<()> {
        for &channel in &self.inputs {
            if channel >= config.capture_channels {
                return Err(IoError::InvalidChannel {
                    device: config.device_name.clone(),
                    channel,
                });
            }
        }
        for (i, &channel) in self.outputs.iter().enumerate() {
            if channel >= config.playback_channels
                || self.outputs[..i].contains(&channel)
            {
                return Err(IoError::InvalidChannel {
                    device: config.device_name.clone(),
                    channel,
                });
            }
        }
        if self.inputs.len() > MAX_MAPPED_CHANNELS || self.outputs.len() > MAX_MAPPED_CHANNELS {
            return Err(IoError::InvalidChannel {
                device: config.device_name.clone(),
                channel: MAX_MAPPED_CHANNELS,
            });
        }
        Ok(())
    }
}

/// Handle to the running audio thread.
pub struct AudioDriver {
    config: NegotiatedConfig,
    terminate: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioDriver {
    /// Spawn the realtime thread over an already-negotiated device.
    pub fn start(
        device: Box<dyn PcmDevice>,
        channel_map: ChannelMap,
        midi_inputs: Vec<Box<dyn RawMidiInput>>,
        host: impl AudioDriverHost,
    ) -> Result<Self> {
        let config = device.config().clone();
        channel_map.validate(&config)?;
        tracing::info!(config = %config.description(), "starting audio driver");

        let terminate = Arc::new(AtomicBool::new(false));
        let thread_terminate = Arc::clone(&terminate);
        let thread = thread::Builder::new()
            .name("pedalera-audio".into())
            .spawn(move || run_loop(device, channel_map, midi_inputs, host, thread_terminate))
            .map_err(|e| IoError::Thread(e.to_string()))?;

        Ok(Self {
            config,
            terminate,
            thread: Some(thread),
        })
    }

    pub fn config(&self) -> &NegotiatedConfig {
        &self.config
    }

    /// Ask the thread to exit and join it, bounded by `timeout`.
    ///
    /// Returns false when the thread did not exit in time; it is then left
    /// detached (force-close semantics).
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.terminate.store(true, Ordering::Release);
        let Some(handle) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::error!("audio thread did not stop in time; detaching");
                drop(handle);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = handle.join();
        tracing::debug!("audio thread joined");
        true
    }
}

impl Drop for AudioDriver {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

struct MidiPort {
    input: Box<dyn RawMidiInput>,
    decoder: MidiDecoder,
    failed: bool,
}

fn poll_midi(ports: &mut [MidiPort], scratch: &mut [u8], time: u32, events: &mut MidiEventBuffer) {
    for port in ports.iter_mut() {
        if port.failed {
            continue;
        }
        loop {
            match port.input.read(scratch) {
                Ok(0) => break,
                Ok(n) => port.decoder.feed(&scratch[..n], time, events),
                Err(_) => {
                    // Terminal for this source; the session notices the
                    // silence and reopens it non-RT.
                    port.failed = true;
                    break;
                }
            }
        }
    }
}

/// Select `map`ped planar channels as mutable slices.
///
/// Map indices are validated unique at start, so the borrows are disjoint.
fn mapped_outputs<'a>(
    planar: &'a mut [Box<[f32]>],
    map: &[usize],
    frames: usize,
) -> SmallVec<[&'a mut [f32]; MAX_MAPPED_CHANNELS]> {
    let base = planar.as_mut_ptr();
    map.iter()
        .map(|&c| unsafe { &mut (&mut *base.add(c))[..frames] })
        .collect()
}

fn run_loop(
    mut device: Box<dyn PcmDevice>,
    map: ChannelMap,
    midi_inputs: Vec<Box<dyn RawMidiInput>>,
    mut host: impl AudioDriverHost,
    terminate: Arc<AtomicBool>,
) {
    let config = device.config().clone();
    let frames = config.period_frames;
    set_realtime_priority();

    let mut raw_capture = vec![0u8; config.capture_period_bytes()];
    let mut raw_playback = vec![0u8; config.playback_period_bytes()];
    let mut capture_planar: Vec<Box<[f32]>> = (0..config.capture_channels)
        .map(|_| vec![0.0; frames].into_boxed_slice())
        .collect();
    let mut playback_planar: Vec<Box<[f32]>> = (0..config.playback_channels)
        .map(|_| vec![0.0; frames].into_boxed_slice())
        .collect();
    let mut ports: Vec<MidiPort> = midi_inputs
        .into_iter()
        .map(|input| MidiPort {
            input,
            decoder: MidiDecoder::new(),
            failed: false,
        })
        .collect();
    let mut events = MidiEventBuffer::new(MAX_EVENTS_PER_BLOCK);
    let mut midi_scratch = [0u8; MIDI_READ_BYTES];

    let mut fatal = false;
    if let Err(error) = device.start() {
        tracing::error!(%error, "audio device failed to start");
        fatal = true;
    }

    while !fatal {
        if terminate.load(Ordering::Acquire) || host.should_terminate() {
            break;
        }

        events.clear();
        poll_midi(&mut ports, &mut midi_scratch, 0, &mut events);

        match device.read_period(&mut raw_capture) {
            Ok(()) => {}
            Err(PcmError::Xrun) => {
                host.on_underrun();
                if device.recover_capture().is_err() {
                    fatal = true;
                }
                continue;
            }
            Err(_) => {
                fatal = true;
                continue;
            }
        }

        config
            .format
            .decode_block(&raw_capture, &mut capture_planar, config.capture_channels, frames);

        {
            let inputs: SmallVec<[&[f32]; MAX_MAPPED_CHANNELS]> = map
                .inputs
                .iter()
                .map(|&c| &capture_planar[c][..frames])
                .collect();
            let mut outputs = mapped_outputs(&mut playback_planar, &map.outputs, frames);
            host.on_process(&inputs, &mut outputs, frames, events.events());
        }

        config.format.encode_block(
            &playback_planar,
            &mut raw_playback,
            config.playback_channels,
            frames,
        );

        match device.write_period(&raw_playback) {
            Ok(()) => {}
            Err(PcmError::Xrun) => {
                host.on_underrun();
                if device.recover_playback().is_err() {
                    fatal = true;
                }
            }
            Err(_) => fatal = true,
        }
    }

    host.on_audio_stopped();

    if fatal {
        // The device is gone but the control plane still needs servicing:
        // pump silent blocks at period cadence until told to stop.
        let period = Duration::from_secs_f64(frames as f64 / config.sample_rate as f64);
        for channel in capture_planar.iter_mut() {
            channel.fill(0.0);
        }
        while !(terminate.load(Ordering::Acquire) || host.should_terminate()) {
            thread::sleep(period);
            events.clear();
            let inputs: SmallVec<[&[f32]; MAX_MAPPED_CHANNELS]> = map
                .inputs
                .iter()
                .map(|&c| &capture_planar[c][..frames])
                .collect();
            let mut outputs = mapped_outputs(&mut playback_planar, &map.outputs, frames);
            host.on_process(&inputs, &mut outputs, frames, events.events());
        }
    }
}

#[cfg(target_os = "linux")]
fn set_realtime_priority() {
    // Best-effort SCHED_RR elevation; without CAP_SYS_NICE this fails and
    // the engine runs at normal priority.
    let param = libc::sched_param { sched_priority: 80 };
    let result = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if result == 0 {
        tracing::debug!("audio thread elevated to SCHED_RR");
    } else {
        tracing::warn!("could not elevate audio thread to SCHED_RR; continuing unelevated");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority() {}
