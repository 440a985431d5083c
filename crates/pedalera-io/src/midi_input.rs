//! Raw MIDI input sources.
//!
//! Each source is opened non-blocking on the non-realtime side and polled
//! by the audio thread once per block (the per-device decoder state lives
//! with the driver). Closing happens on the non-realtime side; a source
//! that errors is disabled for the rest of the session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A non-blocking raw MIDI byte source.
pub trait RawMidiInput: Send {
    fn name(&self) -> &str;

    /// Read whatever bytes are pending, up to `buf.len()`.
    ///
    /// Returns `Ok(0)` when nothing is pending. An `Err` is terminal: the
    /// driver stops polling the source.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// An in-memory MIDI source fed from another thread; for tests and
/// loopback-style wiring.
pub struct MemoryMidiInput {
    name: String,
    queue: Arc<Mutex<VecDeque<u8>>>,
}

/// Feeding end of a [`MemoryMidiInput`].
#[derive(Clone)]
pub struct MemoryMidiSender {
    queue: Arc<Mutex<VecDeque<u8>>>,
}

impl MemoryMidiInput {
    pub fn new(name: impl Into<String>) -> (Self, MemoryMidiSender) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                name: name.into(),
                queue: Arc::clone(&queue),
            },
            MemoryMidiSender { queue },
        )
    }
}

impl MemoryMidiSender {
    /// Queue raw bytes for the next poll.
    pub fn send(&self, bytes: &[u8]) {
        let mut queue = self.queue.lock().expect("midi queue poisoned");
        queue.extend(bytes.iter().copied());
    }
}

impl RawMidiInput for MemoryMidiInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| std::io::Error::other("midi queue poisoned"))?;
        let count = buf.len().min(queue.len());
        for slot in buf.iter_mut().take(count) {
            *slot = queue.pop_front().expect("count bounded by queue length");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_input_delivers_in_order() {
        let (mut input, sender) = MemoryMidiInput::new("test");
        sender.send(&[0x90, 60, 100]);
        sender.send(&[0x80, 60, 0]);

        let mut buf = [0u8; 16];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x90, 60, 100, 0x80, 60, 0]);
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn short_reads_resume() {
        let (mut input, sender) = MemoryMidiInput::new("test");
        sender.send(&[1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(input.read(&mut buf).unwrap(), 1);
    }
}
