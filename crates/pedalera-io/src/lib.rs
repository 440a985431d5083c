//! Pedalera IO - soundcard abstraction and the realtime audio driver.
//!
//! This crate provides:
//! - [`SampleFormat`] - the negotiable PCM formats with their interleaved
//!   byte ↔ planar float converters
//! - [`PcmDevice`] / [`PcmDriver`] - the period-synchronous device seam the
//!   engine drives (plus [`DummyDevice`] and [`MemoryDevice`] implementations)
//! - [`RawMidiInput`] - non-blocking raw MIDI byte sources polled on the
//!   audio thread
//! - [`AudioDriver`] - owns the realtime thread: read a period, decode,
//!   hand the block to the [`AudioDriverHost`], encode, write a period,
//!   recovering from xruns along the way

pub mod device;
pub mod driver;
pub mod format;
pub mod midi_input;

pub use device::{
    DummyDevice, DummyDriver, MemoryDevice, MemoryDeviceControl, NegotiatedConfig, PcmDevice,
    PcmDriver, PcmError, PcmRequest,
};
pub use driver::{AudioDriver, AudioDriverHost, ChannelMap};
pub use format::{negotiate, SampleFormat};
pub use midi_input::{MemoryMidiInput, MemoryMidiSender, RawMidiInput};

/// Classified audio I/O failures. Raw device error codes never escape this
/// crate; every variant carries a human-readable message.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("device '{0}' is busy; stop the application using it and retry")]
    DeviceBusy(String),

    #[error("permission denied opening device '{0}'")]
    Permission(String),

    #[error("no such device: '{0}'")]
    NoSuchDevice(String),

    #[error("no supported sample format on device '{0}'")]
    UnsupportedFormat(String),

    #[error("sample rate {rate} not supported on device '{device}'")]
    UnsupportedRate { device: String, rate: u32 },

    #[error("channel {channel} out of range on device '{device}'")]
    InvalidChannel { device: String, channel: usize },

    #[error("audio device failed: {0}")]
    Fatal(String),

    #[error("audio thread failed to start: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, IoError>;
