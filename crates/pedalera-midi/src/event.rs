//! Timestamped MIDI events with fixed inline storage.
//!
//! Events are tagged with a sample offset relative to the start of the audio
//! block in which they were read. Payloads are stored inline so events can be
//! produced and consumed on the audio thread without allocation. Channel and
//! system-common messages need at most three bytes; terminated SysEx surfaces
//! only its `F0` + manufacturer-id header, which needs at most four.

/// Maximum inline payload of a [`MidiEvent`].
///
/// Three bytes cover every channel-voice and system-common message; the
/// fourth byte allows a SysEx header (`F0` plus a 1–3 byte manufacturer id)
/// to be surfaced when a SysEx message terminates.
pub const MAX_EVENT_BYTES: usize = 4;

/// A decoded MIDI event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Sample offset relative to the start of the current audio block.
    ///
    /// Best-effort: events read before the first capture read are tagged `0`;
    /// events read between sub-reads carry the number of frames read so far.
    pub time: u32,
    /// Number of valid bytes in `data` (1..=4).
    pub size: u8,
    /// Message bytes, status first.
    pub data: [u8; MAX_EVENT_BYTES],
}

impl MidiEvent {
    /// Build an event from a byte slice (at most [`MAX_EVENT_BYTES`] used).
    pub fn new(time: u32, bytes: &[u8]) -> Self {
        let size = bytes.len().min(MAX_EVENT_BYTES);
        let mut data = [0u8; MAX_EVENT_BYTES];
        data[..size].copy_from_slice(&bytes[..size]);
        Self {
            time,
            size: size as u8,
            data,
        }
    }

    /// The message bytes that are actually valid.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// The status byte.
    #[inline]
    pub fn status(&self) -> u8 {
        self.data[0]
    }

    /// The channel (0-15) for channel-voice messages.
    #[inline]
    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0F
    }

    /// True for channel-voice messages (status `0x80..=0xEF`).
    #[inline]
    pub fn is_channel_voice(&self) -> bool {
        (0x80..0xF0).contains(&self.data[0])
    }

    /// True for a control-change message.
    #[inline]
    pub fn is_control_change(&self) -> bool {
        self.data[0] & 0xF0 == 0xB0
    }

    /// True for a note-on with non-zero velocity.
    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.data[0] & 0xF0 == 0x90 && self.size >= 3 && self.data[2] != 0
    }

    /// True for a note-off (including note-on with velocity zero).
    #[inline]
    pub fn is_note_off(&self) -> bool {
        let status = self.data[0] & 0xF0;
        status == 0x80 || (status == 0x90 && self.size >= 3 && self.data[2] == 0)
    }

    /// True for a program-change message.
    #[inline]
    pub fn is_program_change(&self) -> bool {
        self.data[0] & 0xF0 == 0xC0
    }
}

/// Fixed-capacity event buffer, filled by decoders on the audio thread.
///
/// Capacity is allocated up front; pushes beyond capacity are dropped,
/// mirroring the overrun policy of the raw device readers.
#[derive(Debug)]
pub struct MidiEventBuffer {
    events: Vec<MidiEvent>,
    dropped: u64,
}

impl MidiEventBuffer {
    /// Allocate a buffer holding up to `capacity` events per block.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Discard all events. Called at the start of each block.
    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Append an event; drops (and counts) when full.
    #[inline]
    pub fn push(&mut self, event: MidiEvent) {
        if self.events.len() < self.events.capacity() {
            self.events.push(event);
        } else {
            self.dropped += 1;
        }
    }

    /// Events pushed this block, in arrival order.
    #[inline]
    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total events dropped because the buffer was full.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
