//! Property-based tests for the PCM format converters.

use proptest::prelude::*;

use pedalera_io::SampleFormat;

fn round_trip(format: SampleFormat, samples: &[f32]) -> Vec<f32> {
    let frames = samples.len();
    let input = vec![samples.to_vec().into_boxed_slice()];
    let mut raw = vec![0u8; frames * format.bytes_per_sample()];
    format.encode_block(&input, &mut raw, 1, frames);

    let mut output = vec![vec![0.0f32; frames].into_boxed_slice()];
    format.decode_block(&raw, &mut output, 1, frames);
    output[0].to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// decode(encode(x)) stays within the format's round-trip tolerance for
    /// any x in [-1, 1].
    #[test]
    fn all_formats_round_trip_in_range(
        samples in prop::collection::vec(-1.0f32..=1.0f32, 1..64),
        format_index in 0usize..10,
    ) {
        let format = SampleFormat::preferred_order()[format_index];
        let tolerance = if format.is_16_bit() { 1e-4 } else { 4e-5 };
        let output = round_trip(format, &samples);
        for (i, (&a, &b)) in samples.iter().zip(output.iter()).enumerate() {
            prop_assert!(
                (a - b).abs() < tolerance,
                "{}: sample {i} {a} -> {b}",
                format.description()
            );
        }
    }

    /// Out-of-range input never produces output beyond ±1 (plus epsilon)
    /// for integer formats.
    #[test]
    fn integer_formats_clamp(
        samples in prop::collection::vec(-8.0f32..=8.0f32, 1..64),
        format_index in 0usize..10,
    ) {
        let format = SampleFormat::preferred_order()[format_index];
        if matches!(format, SampleFormat::F32Le | SampleFormat::F32Be) {
            return Ok(());
        }
        let output = round_trip(format, &samples);
        for &sample in &output {
            prop_assert!(sample.abs() <= 1.0 + 1e-6, "escaped clamp: {sample}");
        }
    }
}
