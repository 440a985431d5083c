//! Declarative MIDI bindings.
//!
//! A [`MidiBinding`] maps one MIDI control source (a CC number or a note) to
//! a target on a pedalboard item - a named control port or the item's bypass
//! switch - with a mapping mode that decides how raw 7-bit values become
//! target values. A [`SystemBinding`] maps a source to an engine-level action
//! (shutdown, snapshot select, program stepping).
//!
//! Bindings are plain data: they live in the editable pedalboard, serialize
//! into presets, and are resolved to effect/port indices when a realtime
//! pedalboard is built. The stateful part of mapping (last value for
//! latched/circular modes) lives with the realtime pedalboard.

use serde::{Deserialize, Serialize};

use crate::event::MidiEvent;

/// The MIDI control a binding listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiSource {
    /// A continuous controller number (0-127).
    ControlChange { cc: u8 },
    /// A note number (0-127); note-on velocity is the raw value.
    Note { note: u8 },
}

/// How raw 7-bit values map onto the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// Scale 0..=127 linearly onto [min, max].
    Linear,
    /// Like `Linear`, but wraps past either end (endless encoders).
    Circular,
    /// Active while the control is held (value ≥ 64 / note held).
    Momentary,
    /// Toggles on each press.
    Latched,
}

/// What the binding drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingTarget {
    /// A control port on the bound item, addressed by symbol.
    Control { symbol: String },
    /// The bound item's bypass switch.
    Bypass,
}

/// A binding from a MIDI source to an effect control or bypass switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiBinding {
    /// Restrict to one MIDI channel (0-15), or listen omni.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    pub source: MidiSource,
    pub mode: BindingMode,
    pub target: BindingTarget,
    /// Target value at raw 0.
    #[serde(default)]
    pub min: f32,
    /// Target value at raw 127.
    #[serde(default = "default_max")]
    pub max: f32,
}

fn default_max() -> f32 {
    1.0
}

impl MidiBinding {
    /// Raw 7-bit value if `event` triggers this binding, else `None`.
    ///
    /// For note sources a note-off reports raw value 0, so momentary
    /// bindings release.
    pub fn raw_value(&self, event: &MidiEvent) -> Option<u8> {
        if !event.is_channel_voice() {
            return None;
        }
        if let Some(channel) = self.channel {
            if event.channel() != channel {
                return None;
            }
        }
        match self.source {
            MidiSource::ControlChange { cc } => {
                if event.is_control_change() && event.data[1] == cc {
                    Some(event.data[2])
                } else {
                    None
                }
            }
            MidiSource::Note { note } => {
                if event.data[1] != note {
                    None
                } else if event.is_note_on() {
                    Some(event.data[2])
                } else if event.is_note_off() {
                    Some(0)
                } else {
                    None
                }
            }
        }
    }

    /// Scale a raw value onto [min, max].
    #[inline]
    pub fn scale(&self, raw: u8) -> f32 {
        self.min + (raw.min(127) as f32 / 127.0) * (self.max - self.min)
    }
}

/// Engine-level actions a [`SystemBinding`] can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    Shutdown,
    Reboot,
    ToggleHotspot,
    NextProgram,
    PreviousProgram,
    /// Select the snapshot with this index.
    Snapshot(u8),
}

/// A binding from a MIDI source to a system action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    pub source: MidiSource,
    pub action: SystemAction,
}

impl SystemBinding {
    /// True when `event` is a press that triggers this binding.
    ///
    /// System actions are edge-triggered: a CC fires when its value crosses
    /// into the upper half, a note fires on note-on.
    pub fn triggered_by(&self, event: &MidiEvent) -> bool {
        if !event.is_channel_voice() {
            return false;
        }
        if let Some(channel) = self.channel {
            if event.channel() != channel {
                return false;
            }
        }
        match self.source {
            MidiSource::ControlChange { cc } => {
                event.is_control_change() && event.data[1] == cc && event.data[2] >= 64
            }
            MidiSource::Note { note } => event.is_note_on() && event.data[1] == note,
        }
    }
}
