//! End-to-end check of the `render` command through the compiled binary.

use std::process::Command;

fn write_test_wav(path: &std::path::Path, samples: &[f32]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 48000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}

fn read_wav(path: &std::path::Path) -> Vec<f32> {
    let mut reader = hound::WavReader::open(path).unwrap();
    reader.samples::<f32>().collect::<Result<_, _>>().unwrap()
}

#[test]
fn render_passthrough_preserves_audio() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.wav");
    let output_path = dir.path().join("out.wav");

    let input: Vec<f32> = (0..1000).map(|i| ((i % 128) as f32 - 64.0) / 64.0).collect();
    write_test_wav(&input_path, &input);

    let status = Command::new(env!("CARGO_BIN_EXE_pedalera"))
        .args([
            "render",
            "--input",
            input_path.to_str().unwrap(),
            "--output",
            output_path.to_str().unwrap(),
        ])
        .status()
        .unwrap();
    assert!(status.success());

    let output = read_wav(&output_path);
    assert_eq!(output.len(), input.len());
    for (i, (&a, &b)) in input.iter().zip(output.iter()).enumerate() {
        assert!((a - b).abs() < 1e-6, "sample {i}: {a} vs {b}");
    }
}

#[test]
fn render_applies_a_preset() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.wav");
    let output_path = dir.path().join("out.wav");
    let preset_path = dir.path().join("half.toml");

    write_test_wav(&input_path, &[0.5f32; 512]);
    std::fs::write(
        &preset_path,
        r#"
name = "half gain"

[[items]]
instance_id = 1

[items.kind.plugin]
uri = "urn:pedalera:gain"

[[items.kind.plugin.controls]]
symbol = "gain"
value = 0.5
"#,
    )
    .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_pedalera"))
        .args([
            "render",
            "--input",
            input_path.to_str().unwrap(),
            "--output",
            output_path.to_str().unwrap(),
            "--preset",
            preset_path.to_str().unwrap(),
        ])
        .status()
        .unwrap();
    assert!(status.success());

    let output = read_wav(&output_path);
    assert_eq!(output.len(), 512);
    assert!(output.iter().all(|&s| (s - 0.25).abs() < 1e-6));
}
