//! Typed message envelopes carried over the RT boundary rings.
//!
//! Every message is hand-encoded with a fixed little-endian layout behind a
//! 32-bit tag (see [`crate::ring`] for the framing). Two producer wrappers
//! hide the encoding: [`CommandWriter`] on the host side of `to_rt`,
//! [`NotificationWriter`] on the audio-thread side of `from_rt`. The decode
//! enums [`ToRt`] and [`FromRt`] borrow their payloads straight out of the
//! ring, so draining allocates nothing.
//!
//! # Pointer handover
//!
//! Large objects never travel by value. A `set_pedalboard` (or subscription
//! list) message carries a raw pointer produced by `Box::into_raw`; the
//! audio thread takes ownership and, when it stops using the object, sends
//! the pointer back in a `release` notification for the host to reclaim
//! with `Box::from_raw`. The RT side never frees. Patch-set payloads above
//! [`ATOM_INLINE_BYTES`] ride the same way as [`AtomBlob`] pointers.

use pedalera_core::Urid;
use pedalera_midi::{MidiEvent, SystemBinding};

use crate::pedalboard::RtPedalboard;
use crate::ring::{RingFull, RingReader, RingWriter};
use crate::vu::{MonitorSubscriptionList, VuSubscriptionList, VuUpdate};

/// Patch payloads at or below this size are copied into the message.
pub const ATOM_INLINE_BYTES: usize = 256;

/// Longest symbol accepted in control messages.
pub const MAX_SYMBOL_BYTES: usize = 256;

/// System MIDI bindings travel as one swapped list, like subscriptions.
pub type SystemBindingList = Vec<SystemBinding>;

/// Heap-owned patch payload handed over by pointer.
#[derive(Debug)]
pub struct AtomBlob {
    pub bytes: Vec<u8>,
}

/// Transport-like events driven by system MIDI bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMidiEvent {
    Shutdown,
    Reboot,
    ToggleHotspot,
}

impl SystemMidiEvent {
    fn to_wire(self) -> u8 {
        match self {
            SystemMidiEvent::Shutdown => 0,
            SystemMidiEvent::Reboot => 1,
            SystemMidiEvent::ToggleHotspot => 2,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(SystemMidiEvent::Shutdown),
            1 => Some(SystemMidiEvent::Reboot),
            2 => Some(SystemMidiEvent::ToggleHotspot),
            _ => None,
        }
    }
}

pub mod tags {
    pub const SET_CONTROL: u32 = 1;
    pub const SET_BYPASS: u32 = 2;
    pub const SET_INPUT_VOLUME: u32 = 3;
    pub const SET_OUTPUT_VOLUME: u32 = 4;
    pub const LOAD_PRESET: u32 = 5;
    pub const SET_PEDALBOARD: u32 = 6;
    pub const SET_VU_SUBSCRIPTIONS: u32 = 7;
    pub const SET_MONITOR_SUBSCRIPTIONS: u32 = 8;
    pub const SET_SYSTEM_BINDINGS: u32 = 9;
    pub const PATCH_SET_INLINE: u32 = 10;
    pub const PATCH_SET_HEAP: u32 = 11;
    pub const PATCH_GET: u32 = 12;
    pub const ACK_MIDI_PROGRAM: u32 = 13;
    pub const ACK_SNAPSHOT: u32 = 14;
    pub const SET_MIDI_LISTEN: u32 = 15;
    pub const SET_ATOM_LISTEN: u32 = 16;
    pub const SHUTDOWN: u32 = 17;

    pub const RELEASE_PEDALBOARD: u32 = 101;
    pub const RELEASE_VU_SUBSCRIPTIONS: u32 = 102;
    pub const RELEASE_MONITOR_SUBSCRIPTIONS: u32 = 103;
    pub const RELEASE_SYSTEM_BINDINGS: u32 = 104;
    pub const RELEASE_ATOM: u32 = 105;
    pub const VU_BATCH: u32 = 106;
    pub const MONITOR_UPDATE: u32 = 107;
    pub const ATOM_OUTPUT: u32 = 108;
    pub const PATCH_REPLY: u32 = 109;
    pub const PATCH_TIMEOUT: u32 = 110;
    pub const CONTROL_CHANGED: u32 = 111;
    pub const ITEM_ENABLED_CHANGED: u32 = 112;
    pub const STATE_MAYBE_CHANGED: u32 = 113;
    pub const REALTIME_ERROR: u32 = 114;
    pub const MIDI_PROGRAM_CHANGE: u32 = 115;
    pub const NEXT_MIDI_PROGRAM: u32 = 116;
    pub const SNAPSHOT_REQUEST: u32 = 117;
    pub const MIDI_SYSTEM_EVENT: u32 = 118;
    pub const MIDI_MESSAGE: u32 = 119;
    pub const UNDERRUN: u32 = 120;
    pub const NOTIFICATIONS_DROPPED: u32 = 121;
    pub const AUDIO_STOPPED: u32 = 122;
}

// --- little-endian cursor ---

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < len {
            return None;
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn i8(&mut self) -> Option<i8> {
        Some(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn f32(&mut self) -> Option<f32> {
        Some(f32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn str16(&mut self) -> Option<&'a str> {
        let len = self.u16()? as usize;
        std::str::from_utf8(self.take(len)?).ok()
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_str16(buf: &mut Vec<u8>, s: &str) {
    push_u16(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

// --- decoded views ---

/// Patch payload, inline or heap-owned.
pub enum PatchPayload<'a> {
    Inline(&'a [u8]),
    /// Owned by the issuer; the receiver must send it back via
    /// `release_atom` when done.
    Heap(*mut AtomBlob),
}

/// Lazy iterator over `load_preset` control entries.
#[derive(Clone, Copy)]
pub struct PresetControls<'a> {
    bytes: &'a [u8],
    remaining: u16,
}

impl<'a> Iterator for PresetControls<'a> {
    type Item = (&'a str, f32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let mut reader = Reader::new(self.bytes);
        let symbol = reader.str16()?;
        let value = reader.f32()?;
        self.bytes = reader.bytes;
        self.remaining -= 1;
        Some((symbol, value))
    }
}

/// Decoded host → RT message.
pub enum ToRt<'a> {
    SetControl {
        instance_id: i64,
        symbol: &'a str,
        value: f32,
    },
    SetBypass {
        instance_id: i64,
        bypass: bool,
    },
    SetInputVolume {
        db: f32,
    },
    SetOutputVolume {
        db: f32,
    },
    LoadPreset {
        instance_id: i64,
        controls: PresetControls<'a>,
    },
    SetPedalboard {
        board: *mut RtPedalboard,
    },
    SetVuSubscriptions {
        list: *mut VuSubscriptionList,
    },
    SetMonitorSubscriptions {
        list: *mut MonitorSubscriptionList,
    },
    SetSystemBindings {
        list: *mut SystemBindingList,
    },
    PatchSet {
        instance_id: i64,
        property: Urid,
        payload: PatchPayload<'a>,
    },
    PatchGet {
        instance_id: i64,
        property: Urid,
        request_id: u64,
        deadline_frames: u64,
    },
    AckMidiProgram {
        request_id: u64,
    },
    AckSnapshot {
        request_id: u64,
    },
    SetMidiListen {
        enabled: bool,
    },
    SetAtomListen {
        enabled: bool,
    },
    Shutdown,
}

impl<'a> ToRt<'a> {
    /// Decode one framed message. `None` means a malformed frame, which the
    /// drain loop drops.
    pub fn decode(tag: u32, payload: &'a [u8]) -> Option<Self> {
        let mut r = Reader::new(payload);
        let message = match tag {
            tags::SET_CONTROL => {
                let instance_id = r.i64()?;
                let value = r.f32()?;
                let symbol = r.str16()?;
                ToRt::SetControl {
                    instance_id,
                    symbol,
                    value,
                }
            }
            tags::SET_BYPASS => ToRt::SetBypass {
                instance_id: r.i64()?,
                bypass: r.u8()? != 0,
            },
            tags::SET_INPUT_VOLUME => ToRt::SetInputVolume { db: r.f32()? },
            tags::SET_OUTPUT_VOLUME => ToRt::SetOutputVolume { db: r.f32()? },
            tags::LOAD_PRESET => {
                let instance_id = r.i64()?;
                let remaining = r.u16()?;
                ToRt::LoadPreset {
                    instance_id,
                    controls: PresetControls {
                        bytes: r.bytes,
                        remaining,
                    },
                }
            }
            tags::SET_PEDALBOARD => ToRt::SetPedalboard {
                board: r.u64()? as usize as *mut RtPedalboard,
            },
            tags::SET_VU_SUBSCRIPTIONS => ToRt::SetVuSubscriptions {
                list: r.u64()? as usize as *mut VuSubscriptionList,
            },
            tags::SET_MONITOR_SUBSCRIPTIONS => ToRt::SetMonitorSubscriptions {
                list: r.u64()? as usize as *mut MonitorSubscriptionList,
            },
            tags::SET_SYSTEM_BINDINGS => ToRt::SetSystemBindings {
                list: r.u64()? as usize as *mut SystemBindingList,
            },
            tags::PATCH_SET_INLINE => {
                let instance_id = r.i64()?;
                let property = r.u32()?;
                let len = r.u32()? as usize;
                ToRt::PatchSet {
                    instance_id,
                    property,
                    payload: PatchPayload::Inline(r.take(len)?),
                }
            }
            tags::PATCH_SET_HEAP => ToRt::PatchSet {
                instance_id: r.i64()?,
                property: r.u32()?,
                payload: PatchPayload::Heap(r.u64()? as usize as *mut AtomBlob),
            },
            tags::PATCH_GET => ToRt::PatchGet {
                instance_id: r.i64()?,
                property: r.u32()?,
                request_id: r.u64()?,
                deadline_frames: r.u64()?,
            },
            tags::ACK_MIDI_PROGRAM => ToRt::AckMidiProgram {
                request_id: r.u64()?,
            },
            tags::ACK_SNAPSHOT => ToRt::AckSnapshot {
                request_id: r.u64()?,
            },
            tags::SET_MIDI_LISTEN => ToRt::SetMidiListen {
                enabled: r.u8()? != 0,
            },
            tags::SET_ATOM_LISTEN => ToRt::SetAtomListen {
                enabled: r.u8()? != 0,
            },
            tags::SHUTDOWN => ToRt::Shutdown,
            _ => return None,
        };
        Some(message)
    }
}

/// Decoded RT → host notification.
pub enum FromRt<'a> {
    ReleasePedalboard { board: *mut RtPedalboard },
    ReleaseVuSubscriptions { list: *mut VuSubscriptionList },
    ReleaseMonitorSubscriptions { list: *mut MonitorSubscriptionList },
    ReleaseSystemBindings { list: *mut SystemBindingList },
    ReleaseAtom { atom: *mut AtomBlob },
    VuBatch(VuBatch<'a>),
    MonitorUpdate { subscription_id: u64, value: f32 },
    AtomOutput { instance_id: i64, property: Urid, payload: &'a [u8] },
    PatchReply { request_id: u64, instance_id: i64, property: Urid, payload: &'a [u8] },
    PatchTimeout { request_id: u64 },
    ControlChanged { instance_id: i64, control_index: u32, value: f32 },
    ItemEnabledChanged { instance_id: i64, enabled: bool },
    StateMaybeChanged { instance_id: i64 },
    RealtimeError { instance_id: i64, message: &'a str },
    MidiProgramChange { request_id: u64, channel: u8, program: u8 },
    NextMidiProgram { request_id: u64, direction: i8 },
    SnapshotRequest { request_id: u64, snapshot_index: u8 },
    MidiSystemEvent { event: SystemMidiEvent },
    MidiMessage { event: MidiEvent },
    Underrun { count: u64 },
    NotificationsDropped { count: u64 },
    AudioStopped,
}

/// Lazy iterator over a VU batch.
#[derive(Clone, Copy)]
pub struct VuBatch<'a> {
    bytes: &'a [u8],
    remaining: u16,
}

impl Iterator for VuBatch<'_> {
    type Item = VuUpdate;

    fn next(&mut self) -> Option<VuUpdate> {
        if self.remaining == 0 {
            return None;
        }
        let mut r = Reader::new(self.bytes);
        let update = VuUpdate {
            instance_id: r.i64()?,
            peak_left: r.f32()?,
            peak_right: r.f32()?,
            rms_left: r.f32()?,
            rms_right: r.f32()?,
        };
        self.bytes = r.bytes;
        self.remaining -= 1;
        Some(update)
    }
}

impl<'a> FromRt<'a> {
    pub fn decode(tag: u32, payload: &'a [u8]) -> Option<Self> {
        let mut r = Reader::new(payload);
        let message = match tag {
            tags::RELEASE_PEDALBOARD => FromRt::ReleasePedalboard {
                board: r.u64()? as usize as *mut RtPedalboard,
            },
            tags::RELEASE_VU_SUBSCRIPTIONS => FromRt::ReleaseVuSubscriptions {
                list: r.u64()? as usize as *mut VuSubscriptionList,
            },
            tags::RELEASE_MONITOR_SUBSCRIPTIONS => FromRt::ReleaseMonitorSubscriptions {
                list: r.u64()? as usize as *mut MonitorSubscriptionList,
            },
            tags::RELEASE_SYSTEM_BINDINGS => FromRt::ReleaseSystemBindings {
                list: r.u64()? as usize as *mut SystemBindingList,
            },
            tags::RELEASE_ATOM => FromRt::ReleaseAtom {
                atom: r.u64()? as usize as *mut AtomBlob,
            },
            tags::VU_BATCH => {
                let remaining = r.u16()?;
                FromRt::VuBatch(VuBatch {
                    bytes: r.bytes,
                    remaining,
                })
            }
            tags::MONITOR_UPDATE => FromRt::MonitorUpdate {
                subscription_id: r.u64()?,
                value: r.f32()?,
            },
            tags::ATOM_OUTPUT => {
                let instance_id = r.i64()?;
                let property = r.u32()?;
                let len = r.u32()? as usize;
                FromRt::AtomOutput {
                    instance_id,
                    property,
                    payload: r.take(len)?,
                }
            }
            tags::PATCH_REPLY => {
                let request_id = r.u64()?;
                let instance_id = r.i64()?;
                let property = r.u32()?;
                let len = r.u32()? as usize;
                FromRt::PatchReply {
                    request_id,
                    instance_id,
                    property,
                    payload: r.take(len)?,
                }
            }
            tags::PATCH_TIMEOUT => FromRt::PatchTimeout {
                request_id: r.u64()?,
            },
            tags::CONTROL_CHANGED => FromRt::ControlChanged {
                instance_id: r.i64()?,
                control_index: r.u32()?,
                value: r.f32()?,
            },
            tags::ITEM_ENABLED_CHANGED => FromRt::ItemEnabledChanged {
                instance_id: r.i64()?,
                enabled: r.u8()? != 0,
            },
            tags::STATE_MAYBE_CHANGED => FromRt::StateMaybeChanged {
                instance_id: r.i64()?,
            },
            tags::REALTIME_ERROR => {
                let instance_id = r.i64()?;
                let message = r.str16()?;
                FromRt::RealtimeError {
                    instance_id,
                    message,
                }
            }
            tags::MIDI_PROGRAM_CHANGE => FromRt::MidiProgramChange {
                request_id: r.u64()?,
                channel: r.u8()?,
                program: r.u8()?,
            },
            tags::NEXT_MIDI_PROGRAM => FromRt::NextMidiProgram {
                request_id: r.u64()?,
                direction: r.i8()?,
            },
            tags::SNAPSHOT_REQUEST => FromRt::SnapshotRequest {
                request_id: r.u64()?,
                snapshot_index: r.u8()?,
            },
            tags::MIDI_SYSTEM_EVENT => FromRt::MidiSystemEvent {
                event: SystemMidiEvent::from_wire(r.u8()?)?,
            },
            tags::MIDI_MESSAGE => {
                let time = r.u32()?;
                let size = r.u8()?;
                let bytes = r.take(4)?;
                let mut data = [0u8; 4];
                data.copy_from_slice(bytes);
                FromRt::MidiMessage {
                    event: MidiEvent {
                        time,
                        size: size.min(4),
                        data,
                    },
                }
            }
            tags::UNDERRUN => FromRt::Underrun { count: r.u64()? },
            tags::NOTIFICATIONS_DROPPED => FromRt::NotificationsDropped { count: r.u64()? },
            tags::AUDIO_STOPPED => FromRt::AudioStopped,
            _ => return None,
        };
        Some(message)
    }
}

// --- producers ---

/// Host-side producer for the `to_rt` ring.
pub struct CommandWriter {
    ring: RingWriter,
    scratch: Vec<u8>,
}

impl CommandWriter {
    pub fn new(ring: RingWriter) -> Self {
        Self {
            ring,
            scratch: Vec::with_capacity(4096),
        }
    }

    fn send(&mut self, tag: u32) -> Result<(), RingFull> {
        self.ring.write(tag, &self.scratch)
    }

    pub fn set_control(
        &mut self,
        instance_id: i64,
        symbol: &str,
        value: f32,
    ) -> Result<(), RingFull> {
        debug_assert!(symbol.len() <= MAX_SYMBOL_BYTES);
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        push_f32(&mut self.scratch, value);
        push_str16(&mut self.scratch, symbol);
        self.send(tags::SET_CONTROL)
    }

    pub fn set_bypass(&mut self, instance_id: i64, bypass: bool) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        self.scratch.push(bypass as u8);
        self.send(tags::SET_BYPASS)
    }

    pub fn set_input_volume(&mut self, db: f32) -> Result<(), RingFull> {
        self.scratch.clear();
        push_f32(&mut self.scratch, db);
        self.send(tags::SET_INPUT_VOLUME)
    }

    pub fn set_output_volume(&mut self, db: f32) -> Result<(), RingFull> {
        self.scratch.clear();
        push_f32(&mut self.scratch, db);
        self.send(tags::SET_OUTPUT_VOLUME)
    }

    pub fn load_preset<'c>(
        &mut self,
        instance_id: i64,
        controls: impl ExactSizeIterator<Item = (&'c str, f32)>,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        push_u16(&mut self.scratch, controls.len() as u16);
        for (symbol, value) in controls {
            push_str16(&mut self.scratch, symbol);
            push_f32(&mut self.scratch, value);
        }
        self.send(tags::LOAD_PRESET)
    }

    /// Hand a freshly built pedalboard to the audio thread.
    ///
    /// On a full ring the board is handed back instead of leaked.
    pub fn set_pedalboard(&mut self, board: Box<RtPedalboard>) -> Result<(), Box<RtPedalboard>> {
        let ptr = Box::into_raw(board);
        self.scratch.clear();
        push_u64(&mut self.scratch, ptr as usize as u64);
        match self.send(tags::SET_PEDALBOARD) {
            Ok(()) => Ok(()),
            // Not yet shared: reclaiming the pointer we just made is sound.
            Err(RingFull) => Err(unsafe { Box::from_raw(ptr) }),
        }
    }

    pub fn set_vu_subscriptions(
        &mut self,
        list: Option<Box<VuSubscriptionList>>,
    ) -> Result<(), Option<Box<VuSubscriptionList>>> {
        let ptr = list.map_or(std::ptr::null_mut(), Box::into_raw);
        self.scratch.clear();
        push_u64(&mut self.scratch, ptr as usize as u64);
        match self.send(tags::SET_VU_SUBSCRIPTIONS) {
            Ok(()) => Ok(()),
            Err(RingFull) => Err(if ptr.is_null() {
                None
            } else {
                Some(unsafe { Box::from_raw(ptr) })
            }),
        }
    }

    pub fn set_monitor_subscriptions(
        &mut self,
        list: Option<Box<MonitorSubscriptionList>>,
    ) -> Result<(), Option<Box<MonitorSubscriptionList>>> {
        let ptr = list.map_or(std::ptr::null_mut(), Box::into_raw);
        self.scratch.clear();
        push_u64(&mut self.scratch, ptr as usize as u64);
        match self.send(tags::SET_MONITOR_SUBSCRIPTIONS) {
            Ok(()) => Ok(()),
            Err(RingFull) => Err(if ptr.is_null() {
                None
            } else {
                Some(unsafe { Box::from_raw(ptr) })
            }),
        }
    }

    pub fn set_system_bindings(
        &mut self,
        list: Option<Box<SystemBindingList>>,
    ) -> Result<(), Option<Box<SystemBindingList>>> {
        let ptr = list.map_or(std::ptr::null_mut(), Box::into_raw);
        self.scratch.clear();
        push_u64(&mut self.scratch, ptr as usize as u64);
        match self.send(tags::SET_SYSTEM_BINDINGS) {
            Ok(()) => Ok(()),
            Err(RingFull) => Err(if ptr.is_null() {
                None
            } else {
                Some(unsafe { Box::from_raw(ptr) })
            }),
        }
    }

    /// Send a patch-set; payloads above [`ATOM_INLINE_BYTES`] move to the
    /// heap and travel by pointer.
    pub fn patch_set(
        &mut self,
        instance_id: i64,
        property: Urid,
        payload: &[u8],
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        if payload.len() <= ATOM_INLINE_BYTES {
            push_i64(&mut self.scratch, instance_id);
            push_u32(&mut self.scratch, property);
            push_u32(&mut self.scratch, payload.len() as u32);
            self.scratch.extend_from_slice(payload);
            self.send(tags::PATCH_SET_INLINE)
        } else {
            let blob = Box::into_raw(Box::new(AtomBlob {
                bytes: payload.to_vec(),
            }));
            push_i64(&mut self.scratch, instance_id);
            push_u32(&mut self.scratch, property);
            push_u64(&mut self.scratch, blob as usize as u64);
            match self.send(tags::PATCH_SET_HEAP) {
                Ok(()) => Ok(()),
                Err(RingFull) => {
                    drop(unsafe { Box::from_raw(blob) });
                    Err(RingFull)
                }
            }
        }
    }

    pub fn patch_get(
        &mut self,
        instance_id: i64,
        property: Urid,
        request_id: u64,
        deadline_frames: u64,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        push_u32(&mut self.scratch, property);
        push_u64(&mut self.scratch, request_id);
        push_u64(&mut self.scratch, deadline_frames);
        self.send(tags::PATCH_GET)
    }

    pub fn ack_midi_program(&mut self, request_id: u64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        self.send(tags::ACK_MIDI_PROGRAM)
    }

    pub fn ack_snapshot(&mut self, request_id: u64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        self.send(tags::ACK_SNAPSHOT)
    }

    pub fn set_midi_listen(&mut self, enabled: bool) -> Result<(), RingFull> {
        self.scratch.clear();
        self.scratch.push(enabled as u8);
        self.send(tags::SET_MIDI_LISTEN)
    }

    pub fn set_atom_listen(&mut self, enabled: bool) -> Result<(), RingFull> {
        self.scratch.clear();
        self.scratch.push(enabled as u8);
        self.send(tags::SET_ATOM_LISTEN)
    }

    pub fn shutdown(&mut self) -> Result<(), RingFull> {
        self.scratch.clear();
        self.send(tags::SHUTDOWN)
    }
}

/// Audio-thread producer for the `from_rt` ring.
///
/// All methods are allocation-free once the scratch reaches its high-water
/// mark (it is pre-reserved for the largest message).
pub struct NotificationWriter {
    ring: RingWriter,
    scratch: Vec<u8>,
}

impl NotificationWriter {
    pub fn new(ring: RingWriter) -> Self {
        Self {
            ring,
            scratch: Vec::with_capacity(8192),
        }
    }

    /// Whether a frame of `payload_len` would fit right now.
    pub fn fits(&self, payload_len: usize) -> bool {
        self.ring.fits(payload_len)
    }

    fn send(&mut self, tag: u32) -> Result<(), RingFull> {
        self.ring.write(tag, &self.scratch)
    }

    fn send_ptr(&mut self, tag: u32, ptr: u64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, ptr);
        self.send(tag)
    }

    pub fn release_pedalboard(&mut self, board: *mut RtPedalboard) -> Result<(), RingFull> {
        self.send_ptr(tags::RELEASE_PEDALBOARD, board as usize as u64)
    }

    pub fn release_vu_subscriptions(
        &mut self,
        list: *mut VuSubscriptionList,
    ) -> Result<(), RingFull> {
        self.send_ptr(tags::RELEASE_VU_SUBSCRIPTIONS, list as usize as u64)
    }

    pub fn release_monitor_subscriptions(
        &mut self,
        list: *mut MonitorSubscriptionList,
    ) -> Result<(), RingFull> {
        self.send_ptr(tags::RELEASE_MONITOR_SUBSCRIPTIONS, list as usize as u64)
    }

    pub fn release_system_bindings(&mut self, list: *mut SystemBindingList) -> Result<(), RingFull> {
        self.send_ptr(tags::RELEASE_SYSTEM_BINDINGS, list as usize as u64)
    }

    pub fn release_atom(&mut self, atom: *mut AtomBlob) -> Result<(), RingFull> {
        self.send_ptr(tags::RELEASE_ATOM, atom as usize as u64)
    }

    /// Bytes a VU batch of `count` entries occupies on the wire.
    pub fn vu_batch_bytes(count: usize) -> usize {
        2 + count * 24
    }

    pub fn vu_batch(&mut self, updates: &[VuUpdate]) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u16(&mut self.scratch, updates.len() as u16);
        for update in updates {
            push_i64(&mut self.scratch, update.instance_id);
            push_f32(&mut self.scratch, update.peak_left);
            push_f32(&mut self.scratch, update.peak_right);
            push_f32(&mut self.scratch, update.rms_left);
            push_f32(&mut self.scratch, update.rms_right);
        }
        self.send(tags::VU_BATCH)
    }

    pub fn monitor_update(&mut self, subscription_id: u64, value: f32) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, subscription_id);
        push_f32(&mut self.scratch, value);
        self.send(tags::MONITOR_UPDATE)
    }

    pub fn atom_output(
        &mut self,
        instance_id: i64,
        property: Urid,
        payload: &[u8],
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        push_u32(&mut self.scratch, property);
        push_u32(&mut self.scratch, payload.len() as u32);
        self.scratch.extend_from_slice(payload);
        self.send(tags::ATOM_OUTPUT)
    }

    pub fn patch_reply(
        &mut self,
        request_id: u64,
        instance_id: i64,
        property: Urid,
        payload: &[u8],
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        push_i64(&mut self.scratch, instance_id);
        push_u32(&mut self.scratch, property);
        push_u32(&mut self.scratch, payload.len() as u32);
        self.scratch.extend_from_slice(payload);
        self.send(tags::PATCH_REPLY)
    }

    pub fn patch_timeout(&mut self, request_id: u64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        self.send(tags::PATCH_TIMEOUT)
    }

    pub fn control_changed(
        &mut self,
        instance_id: i64,
        control_index: u32,
        value: f32,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        push_u32(&mut self.scratch, control_index);
        push_f32(&mut self.scratch, value);
        self.send(tags::CONTROL_CHANGED)
    }

    pub fn item_enabled_changed(
        &mut self,
        instance_id: i64,
        enabled: bool,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        self.scratch.push(enabled as u8);
        self.send(tags::ITEM_ENABLED_CHANGED)
    }

    pub fn state_maybe_changed(&mut self, instance_id: i64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        self.send(tags::STATE_MAYBE_CHANGED)
    }

    pub fn realtime_error(
        &mut self,
        instance_id: i64,
        message: &'static str,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_i64(&mut self.scratch, instance_id);
        push_str16(&mut self.scratch, message);
        self.send(tags::REALTIME_ERROR)
    }

    pub fn midi_program_change(
        &mut self,
        request_id: u64,
        channel: u8,
        program: u8,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        self.scratch.push(channel);
        self.scratch.push(program);
        self.send(tags::MIDI_PROGRAM_CHANGE)
    }

    pub fn next_midi_program(&mut self, request_id: u64, direction: i8) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        self.scratch.push(direction as u8);
        self.send(tags::NEXT_MIDI_PROGRAM)
    }

    pub fn snapshot_request(
        &mut self,
        request_id: u64,
        snapshot_index: u8,
    ) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, request_id);
        self.scratch.push(snapshot_index);
        self.send(tags::SNAPSHOT_REQUEST)
    }

    pub fn midi_system_event(&mut self, event: SystemMidiEvent) -> Result<(), RingFull> {
        self.scratch.clear();
        self.scratch.push(event.to_wire());
        self.send(tags::MIDI_SYSTEM_EVENT)
    }

    pub fn midi_message(&mut self, event: &MidiEvent) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u32(&mut self.scratch, event.time);
        self.scratch.push(event.size);
        self.scratch.extend_from_slice(&event.data);
        self.send(tags::MIDI_MESSAGE)
    }

    pub fn underrun(&mut self, count: u64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, count);
        self.send(tags::UNDERRUN)
    }

    pub fn notifications_dropped(&mut self, count: u64) -> Result<(), RingFull> {
        self.scratch.clear();
        push_u64(&mut self.scratch, count);
        self.send(tags::NOTIFICATIONS_DROPPED)
    }

    pub fn audio_stopped(&mut self) -> Result<(), RingFull> {
        self.scratch.clear();
        self.send(tags::AUDIO_STOPPED)
    }
}

/// Drain `reader`, decoding host → RT messages.
pub fn drain_to_rt(reader: &mut RingReader, mut f: impl FnMut(ToRt<'_>)) -> usize {
    let mut count = 0;
    while reader
        .read(|tag, payload| {
            if let Some(message) = ToRt::decode(tag, payload) {
                f(message);
            }
        })
        .is_some()
    {
        count += 1;
    }
    count
}

/// Drain `reader`, decoding RT → host notifications.
pub fn drain_from_rt(reader: &mut RingReader, mut f: impl FnMut(FromRt<'_>)) -> usize {
    let mut count = 0;
    while reader
        .read(|tag, payload| {
            if let Some(message) = FromRt::decode(tag, payload) {
                f(message);
            }
        })
        .is_some()
    {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring;

    #[test]
    fn control_messages_round_trip() {
        let (writer, mut reader) = ring(4096);
        let mut commands = CommandWriter::new(writer);
        commands.set_control(42, "gain", 0.5).unwrap();
        commands.set_bypass(42, true).unwrap();
        commands.set_input_volume(-6.0).unwrap();
        commands.shutdown().unwrap();

        let mut seen = Vec::new();
        drain_to_rt(&mut reader, |message| match message {
            ToRt::SetControl {
                instance_id,
                symbol,
                value,
            } => seen.push(format!("control {instance_id} {symbol} {value}")),
            ToRt::SetBypass {
                instance_id,
                bypass,
            } => seen.push(format!("bypass {instance_id} {bypass}")),
            ToRt::SetInputVolume { db } => seen.push(format!("involume {db}")),
            ToRt::Shutdown => seen.push("shutdown".into()),
            _ => seen.push("unexpected".into()),
        });
        assert_eq!(
            seen,
            vec![
                "control 42 gain 0.5",
                "bypass 42 true",
                "involume -6",
                "shutdown"
            ]
        );
    }

    #[test]
    fn load_preset_controls_iterate() {
        let (writer, mut reader) = ring(4096);
        let mut commands = CommandWriter::new(writer);
        let entries = [("gain", 0.25f32), ("cutoff", 1234.0)];
        commands
            .load_preset(7, entries.iter().map(|(s, v)| (*s, *v)))
            .unwrap();

        drain_to_rt(&mut reader, |message| {
            let ToRt::LoadPreset {
                instance_id,
                controls,
            } = message
            else {
                panic!("expected LoadPreset");
            };
            assert_eq!(instance_id, 7);
            let got: Vec<(String, f32)> =
                controls.map(|(s, v)| (s.to_owned(), v)).collect();
            assert_eq!(got, vec![("gain".into(), 0.25), ("cutoff".into(), 1234.0)]);
        });
    }

    #[test]
    fn inline_and_heap_patch_payloads() {
        let (writer, mut reader) = ring(8192);
        let mut commands = CommandWriter::new(writer);
        commands.patch_set(1, 9, b"small").unwrap();
        let big = vec![7u8; ATOM_INLINE_BYTES + 1];
        commands.patch_set(1, 9, &big).unwrap();

        let mut blobs = Vec::new();
        drain_to_rt(&mut reader, |message| {
            let ToRt::PatchSet { payload, .. } = message else {
                panic!("expected PatchSet");
            };
            match payload {
                PatchPayload::Inline(bytes) => assert_eq!(bytes, b"small"),
                PatchPayload::Heap(ptr) => blobs.push(ptr),
            }
        });
        assert_eq!(blobs.len(), 1);
        let blob = unsafe { Box::from_raw(blobs[0]) };
        assert_eq!(blob.bytes, big);
    }

    #[test]
    fn vu_batch_round_trips() {
        let (writer, mut reader) = ring(4096);
        let mut notifications = NotificationWriter::new(writer);
        let updates = [
            VuUpdate {
                instance_id: -2,
                peak_left: 0.5,
                peak_right: 0.25,
                rms_left: 0.1,
                rms_right: 0.05,
            },
            VuUpdate {
                instance_id: 3,
                peak_left: 1.0,
                peak_right: 1.0,
                rms_left: 0.7,
                rms_right: 0.7,
            },
        ];
        notifications.vu_batch(&updates).unwrap();

        drain_from_rt(&mut reader, |message| {
            let FromRt::VuBatch(batch) = message else {
                panic!("expected VuBatch");
            };
            let got: Vec<VuUpdate> = batch.collect();
            assert_eq!(got, updates);
        });
    }

    #[test]
    fn patch_reply_and_timeout_round_trip() {
        let (writer, mut reader) = ring(4096);
        let mut notifications = NotificationWriter::new(writer);
        notifications.patch_reply(11, 2, 9, b"\"value\"").unwrap();
        notifications.patch_timeout(12).unwrap();

        let mut seen = Vec::new();
        drain_from_rt(&mut reader, |message| match message {
            FromRt::PatchReply {
                request_id,
                payload,
                ..
            } => seen.push((request_id, payload.to_vec())),
            FromRt::PatchTimeout { request_id } => seen.push((request_id, Vec::new())),
            _ => panic!("unexpected message"),
        });
        assert_eq!(
            seen,
            vec![(11, b"\"value\"".to_vec()), (12, Vec::new())]
        );
    }

    #[test]
    fn pedalboard_handover_returns_box_when_full() {
        // A ring too small for the message hands the board back.
        let (writer, _reader) = ring(128);
        let mut commands = CommandWriter::new(writer);
        // Fill the ring: two 62-byte frames leave 4 free bytes of 128.
        let symbol = "a".repeat(40);
        commands.set_control(1, &symbol, 1.0).unwrap();
        commands.set_control(2, &symbol, 1.0).unwrap();
        let board = crate::pedalboard::RtPedalboard::empty(48000.0, 64, 2, 2);
        assert!(commands.set_pedalboard(Box::new(board)).is_err());
    }
}
