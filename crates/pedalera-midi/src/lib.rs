//! MIDI support for the pedalera engine.
//!
//! This crate provides:
//! - [`MidiEvent`] and [`MidiEventBuffer`] - timestamped events with a fixed
//!   inline payload, suitable for the audio thread
//! - [`MidiDecoder`] - a stateful raw-byte decoder (one per input device)
//!   that handles running status, system common messages, and SysEx split
//!   across reads
//! - [`MidiBinding`] / [`SystemBinding`] - declarative bindings from MIDI
//!   controls to effect parameters, bypass switches, and system actions
//!
//! Decoding happens on the audio thread; everything here is allocation-free
//! once constructed.

mod binding;
mod decoder;
mod event;

pub use binding::{BindingMode, BindingTarget, MidiBinding, MidiSource, SystemAction, SystemBinding};
pub use decoder::MidiDecoder;
pub use event::{MidiEvent, MidiEventBuffer, MAX_EVENT_BYTES};
