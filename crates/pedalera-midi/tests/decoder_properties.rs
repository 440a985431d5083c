//! Property-based tests for the raw MIDI decoder.
//!
//! Uses proptest to verify the wire round-trip: any sequence of well-formed
//! channel messages, encoded with or without running-status compression and
//! split at arbitrary read boundaries, decodes back to the same sequence.

use proptest::prelude::*;

use pedalera_midi::{MidiDecoder, MidiEventBuffer};

/// A well-formed channel-voice message for the generator.
#[derive(Debug, Clone)]
struct Message {
    status: u8,
    data: Vec<u8>,
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (0x8u8..=0xEu8, 0u8..16, 0u8..128, 0u8..128).prop_map(|(kind, channel, d0, d1)| {
        let status = (kind << 4) | channel;
        let data = match kind {
            0xC | 0xD => vec![d0],
            _ => vec![d0, d1],
        };
        Message { status, data }
    })
}

/// Encode messages, compressing runs of identical status bytes.
fn encode(messages: &[Message], running_status: bool) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut last_status = 0u8;
    for message in messages {
        if !running_status || message.status != last_status {
            bytes.push(message.status);
            last_status = message.status;
        }
        bytes.extend_from_slice(&message.data);
    }
    bytes
}

fn decode_all(chunks: impl Iterator<Item = Vec<u8>>) -> Vec<(u8, Vec<u8>)> {
    let mut decoder = MidiDecoder::new();
    let mut buf = MidiEventBuffer::new(4096);
    for chunk in chunks {
        decoder.feed(&chunk, 0, &mut buf);
    }
    buf.events()
        .iter()
        .map(|e| (e.status(), e.bytes()[1..].to_vec()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// encode → decode is the identity on well-formed message sequences.
    #[test]
    fn round_trip_verbose(messages in prop::collection::vec(message_strategy(), 0..64)) {
        let bytes = encode(&messages, false);
        let decoded = decode_all(std::iter::once(bytes));
        let expected: Vec<_> = messages.iter().map(|m| (m.status, m.data.clone())).collect();
        prop_assert_eq!(decoded, expected);
    }

    /// Running-status compression decodes to the same sequence.
    #[test]
    fn round_trip_running_status(messages in prop::collection::vec(message_strategy(), 0..64)) {
        let bytes = encode(&messages, true);
        let decoded = decode_all(std::iter::once(bytes));
        let expected: Vec<_> = messages.iter().map(|m| (m.status, m.data.clone())).collect();
        prop_assert_eq!(decoded, expected);
    }

    /// Splitting the stream at an arbitrary boundary never changes the result.
    #[test]
    fn round_trip_split_reads(
        messages in prop::collection::vec(message_strategy(), 1..64),
        split in 0usize..256,
    ) {
        let bytes = encode(&messages, true);
        let split = split % (bytes.len() + 1);
        let (head, tail) = bytes.split_at(split);
        let decoded = decode_all([head.to_vec(), tail.to_vec()].into_iter());
        let expected: Vec<_> = messages.iter().map(|m| (m.status, m.data.clone())).collect();
        prop_assert_eq!(decoded, expected);
    }

    /// Realtime bytes sprinkled anywhere into the stream are transparent.
    #[test]
    fn realtime_bytes_are_transparent(
        messages in prop::collection::vec(message_strategy(), 1..32),
        positions in prop::collection::vec(0usize..128, 0..16),
    ) {
        let mut bytes = encode(&messages, true);
        for &p in &positions {
            let at = p % (bytes.len() + 1);
            bytes.insert(at, 0xF8);
        }
        let decoded = decode_all(std::iter::once(bytes));
        let expected: Vec<_> = messages.iter().map(|m| (m.status, m.data.clone())).collect();
        prop_assert_eq!(decoded, expected);
    }
}
