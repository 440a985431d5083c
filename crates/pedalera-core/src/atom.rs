//! Patch-property plumbing: atoms, atom queues, and URID interning.
//!
//! An *atom* is an opaque typed value exchanged with a plugin - here, the
//! payload of a `patch get`/`patch set` property access. On the host side
//! atoms are JSON values; on the wire and inside the engine they are plain
//! byte payloads tagged with an interned property id ([`Urid`]).
//!
//! [`AtomQueue`] is the fixed-capacity event lane between the command
//! processor and a plugin: patch requests flow in through the plugin's input
//! queue before `process()`, replies and spontaneous property notifications
//! flow out through its output queue. Both queues are sized at construction
//! and never allocate afterwards, so they are safe to touch from the audio
//! thread.

use std::collections::HashMap;
use std::sync::Mutex;

/// Interned id for a property URI. Never zero.
pub type Urid = u32;

/// Largest payload a single atom event may carry.
///
/// Anything bigger is refused at the session boundary; plugin replies that
/// would exceed it are dropped and reported as errors.
pub const ATOM_PAYLOAD_CAPACITY: usize = 2048;

/// What an atom event asks of (or reports from) a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    /// Request the current value of `property`; the plugin answers with a
    /// `PatchSet` on its output queue.
    PatchGet,
    /// Carry a new value for `property`.
    PatchSet,
}

/// One queued atom event.
#[derive(Debug, Clone, Copy)]
pub struct AtomEntry {
    /// Sample offset within the block.
    pub frame: u32,
    pub kind: AtomKind,
    pub property: Urid,
    start: u32,
    len: u32,
}

/// Fixed-capacity atom event queue with an inline byte arena.
#[derive(Debug)]
pub struct AtomQueue {
    entries: Vec<AtomEntry>,
    bytes: Vec<u8>,
    dropped: u64,
}

impl AtomQueue {
    /// Allocate a queue for up to `max_events` events and `byte_capacity`
    /// total payload bytes per block.
    pub fn new(max_events: usize, byte_capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_events),
            bytes: Vec::with_capacity(byte_capacity),
            dropped: 0,
        }
    }

    /// A queue sized for typical patch traffic.
    pub fn with_default_capacity() -> Self {
        Self::new(16, ATOM_PAYLOAD_CAPACITY * 2)
    }

    /// Drop all queued events. Called at block boundaries.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes.clear();
    }

    /// Queue a `PatchGet` for `property`. Returns false (and counts) if full.
    pub fn push_get(&mut self, frame: u32, property: Urid) -> bool {
        if self.entries.len() == self.entries.capacity() {
            self.dropped += 1;
            return false;
        }
        self.entries.push(AtomEntry {
            frame,
            kind: AtomKind::PatchGet,
            property,
            start: self.bytes.len() as u32,
            len: 0,
        });
        true
    }

    /// Queue a `PatchSet` carrying `payload`. Returns false (and counts) if
    /// the event table or byte arena is full, or the payload is overlong.
    pub fn push_set(&mut self, frame: u32, property: Urid, payload: &[u8]) -> bool {
        if self.entries.len() == self.entries.capacity()
            || payload.len() > ATOM_PAYLOAD_CAPACITY
            || self.bytes.len() + payload.len() > self.bytes.capacity()
        {
            self.dropped += 1;
            return false;
        }
        let start = self.bytes.len() as u32;
        self.bytes.extend_from_slice(payload);
        self.entries.push(AtomEntry {
            frame,
            kind: AtomKind::PatchSet,
            property,
            start,
            len: payload.len() as u32,
        });
        true
    }

    /// Queued events in arrival order.
    #[inline]
    pub fn entries(&self) -> &[AtomEntry] {
        &self.entries
    }

    /// Payload bytes of `entry` (empty for `PatchGet`).
    #[inline]
    pub fn payload(&self, entry: &AtomEntry) -> &[u8] {
        let start = entry.start as usize;
        &self.bytes[start..start + entry.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events refused because a capacity was exhausted.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Host-side interning table mapping property URIs to dense [`Urid`]s.
///
/// Interning happens on the non-realtime side; the audio thread only ever
/// compares the resulting integers. Ids are stable for the life of the map
/// and start at 1 so that 0 can mean "no property".
#[derive(Debug, Default)]
pub struct UridMap {
    inner: Mutex<UridMapInner>,
}

#[derive(Debug, Default)]
struct UridMapInner {
    by_uri: HashMap<String, Urid>,
    by_id: Vec<String>,
}

impl UridMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `uri`, returning its id (allocating one on first sight).
    pub fn map(&self, uri: &str) -> Urid {
        let mut inner = self.inner.lock().expect("urid map poisoned");
        if let Some(&id) = inner.by_uri.get(uri) {
            return id;
        }
        inner.by_id.push(uri.to_owned());
        let id = inner.by_id.len() as Urid;
        inner.by_uri.insert(uri.to_owned(), id);
        id
    }

    /// The URI previously interned as `urid`, if any.
    pub fn unmap(&self, urid: Urid) -> Option<String> {
        let inner = self.inner.lock().expect("urid map poisoned");
        inner.by_id.get(urid.checked_sub(1)? as usize).cloned()
    }
}

/// Serialize a host-side JSON atom value into a wire payload.
pub fn json_to_payload(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("JSON value serialization cannot fail")
}

/// Parse a wire payload back into a JSON atom value.
pub fn payload_to_json(payload: &[u8]) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_slice(payload)
}
