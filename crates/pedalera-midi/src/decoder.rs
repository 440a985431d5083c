//! Raw MIDI byte-stream decoding.
//!
//! Raw MIDI devices deliver an unframed byte stream: status bytes may be
//! omitted under running status, SysEx messages may span reads, and realtime
//! bytes may be interleaved anywhere. [`MidiDecoder`] turns that stream into
//! [`MidiEvent`]s, one decoder instance per input device, with state that
//! persists across reads.
//!
//! ## Decoding rules
//!
//! - Bytes `< 0x80` are data: they fill the pending message or, inside a
//!   SysEx, accumulate in the SysEx scratch. A completed message is emitted
//!   and running status is preserved.
//! - `0x80..=0xEF` starts a channel-voice message: any in-progress SysEx is
//!   discarded, running status and the expected data length are set from the
//!   high nibble (two data bytes, except one for program change and channel
//!   pressure).
//! - `0xF0` starts SysEx and clears running status.
//! - `0xF1..=0xF7` are system common: SysEx is flushed; `0xF7` terminates a
//!   SysEx, surfacing only its `F0` + manufacturer-id header. Undefined
//!   status bytes (`0xF4`, `0xF5`) are dropped.
//! - `0xF8..=0xFF` are realtime messages: they do not disturb running status
//!   or any in-progress message, and are discarded.
//!
//! Data bytes that arrive before any status byte are dropped without
//! emitting. Overlong SysEx payloads are truncated at the scratch capacity.

use crate::event::{MidiEvent, MidiEventBuffer};

const SYSEX_CAPACITY: usize = 1024;

/// Expected data-byte count for a channel-voice status, from the high nibble.
#[inline]
fn voice_data_len(status: u8) -> i8 {
    match status >> 4 {
        0xC | 0xD => 1, // program change, channel pressure
        _ => 2,
    }
}

/// Expected data-byte count for a system-common status, or -1 for undefined.
#[inline]
fn system_common_len(status: u8) -> i8 {
    // F0 and F7 are handled before this table is consulted.
    const LENGTHS: [i8; 8] = [-1, 1, 2, 1, -1, -1, 0, 0];
    LENGTHS[(status & 0x07) as usize]
}

/// Stateful byte-stream decoder for one raw MIDI input device.
#[derive(Debug)]
pub struct MidiDecoder {
    running_status: u8,
    /// Expected data bytes for the current message; -1 while discarding.
    data_len: i8,
    /// Data bytes received so far; -1 while discarding.
    data_index: i8,
    data: [u8; 2],
    in_sysex: bool,
    sysex: Box<[u8; SYSEX_CAPACITY]>,
    sysex_len: usize,
}

impl MidiDecoder {
    pub fn new() -> Self {
        Self {
            running_status: 0,
            data_len: -1,
            data_index: -1,
            data: [0; 2],
            in_sysex: false,
            sysex: Box::new([0; SYSEX_CAPACITY]),
            sysex_len: 0,
        }
    }

    /// Reset all decoder state, as when a device is (re)opened.
    pub fn reset(&mut self) {
        self.running_status = 0;
        self.data_len = -1;
        self.data_index = -1;
        self.in_sysex = false;
        self.sysex_len = 0;
    }

    /// Decode a chunk of raw bytes, emitting events tagged with `time`.
    ///
    /// State persists between calls, so messages split across reads (running
    /// status runs, partial SysEx) decode correctly.
    pub fn feed(&mut self, bytes: &[u8], time: u32, out: &mut MidiEventBuffer) {
        for &byte in bytes {
            if byte >= 0xF8 {
                // Realtime: never disturbs running status or an in-progress
                // message. Discarded, matching the host's event policy.
                continue;
            }
            if byte >= 0x80 {
                self.on_status(byte, time, out);
            } else {
                self.on_data(byte);
            }
            if self.data_index == self.data_len && self.data_len >= 0 && self.running_status != 0 {
                let size = (self.data_len + 1) as usize;
                out.push(MidiEvent::new(
                    time,
                    &[self.running_status, self.data[0], self.data[1]][..size],
                ));
                self.data_index = 0;
            }
        }
    }

    fn on_status(&mut self, byte: u8, time: u32, out: &mut MidiEventBuffer) {
        if byte < 0xF0 {
            self.discard_sysex();
            self.running_status = byte;
            self.data_len = voice_data_len(byte);
            self.data_index = 0;
            return;
        }
        match byte {
            0xF0 => {
                self.discard_sysex();
                self.in_sysex = true;
                self.sysex_len = 0;
                self.sysex[self.sysex_len] = 0xF0;
                self.sysex_len = 1;
                self.running_status = 0;
                self.data_len = -1;
                self.data_index = -1;
            }
            0xF7 => {
                if self.in_sysex {
                    // The payload itself is discarded; surface only the
                    // F0 + manufacturer-id header.
                    let header = self.sysex_len.min(crate::event::MAX_EVENT_BYTES);
                    out.push(MidiEvent::new(time, &self.sysex[..header]));
                }
                self.in_sysex = false;
                self.running_status = 0;
                self.data_len = -1;
                self.data_index = -1;
            }
            _ => {
                self.discard_sysex();
                let len = system_common_len(byte);
                if len < 0 {
                    // Undefined system common; drop and stop trusting the
                    // previous running status.
                    self.running_status = 0;
                    self.data_len = -1;
                    self.data_index = -1;
                    return;
                }
                self.running_status = byte;
                self.data_len = len;
                self.data_index = 0;
            }
        }
    }

    fn on_data(&mut self, byte: u8) {
        if self.in_sysex {
            if self.sysex_len < SYSEX_CAPACITY {
                self.sysex[self.sysex_len] = byte;
                self.sysex_len += 1;
            }
            return;
        }
        match self.data_index {
            0 => {
                self.data[0] = byte;
                self.data_index = 1;
            }
            1 => {
                self.data[1] = byte;
                self.data_index = 2;
            }
            // No status yet, or message already complete and malformed:
            // drop the byte.
            _ => {}
        }
    }

    fn discard_sysex(&mut self) {
        self.in_sysex = false;
        self.sysex_len = 0;
    }
}

impl Default for MidiDecoder {
    fn default() -> Self {
        Self::new()
    }
}
