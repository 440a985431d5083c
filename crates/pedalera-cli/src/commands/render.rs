//! Offline rendering: process a WAV file through a pedalboard preset.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use pedalera_core::{Pedalboard, PluginRegistry, UridMap};
use pedalera_rt::RtPedalboardBuilder;
use pedalera_session::load_preset;

#[derive(Args)]
pub struct RenderArgs {
    /// Input WAV file
    #[arg(short, long)]
    input: PathBuf,

    /// Output WAV file
    #[arg(short, long)]
    output: PathBuf,

    /// Pedalboard preset (TOML); a passthrough board when omitted
    #[arg(short, long)]
    preset: Option<PathBuf>,

    /// Processing block size in frames
    #[arg(long, default_value = "256")]
    block_size: usize,
}

pub fn run(args: RenderArgs) -> anyhow::Result<()> {
    let mut reader = hound::WavReader::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    anyhow::ensure!(
        (1..=2).contains(&channels),
        "only mono and stereo input is supported (got {channels} channels)"
    );

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };
    let frames = samples.len() / channels;

    let board = match &args.preset {
        Some(path) => {
            load_preset(path).with_context(|| format!("loading preset {}", path.display()))?
        }
        None => Pedalboard::new("passthrough"),
    };

    let registry = PluginRegistry::with_builtins();
    let urids = UridMap::new();
    let builder = RtPedalboardBuilder {
        registry: &registry,
        urids: &urids,
        sample_rate: spec.sample_rate as f64,
        max_frames: args.block_size,
        input_channels: channels,
    };
    let (mut rt_board, warnings) = builder.build(&board)?;
    for warning in &warnings {
        tracing::warn!(
            instance_id = warning.instance_id,
            message = %warning.message,
            "pedalboard item degraded"
        );
    }
    rt_board.activate(&mut |instance_id, message| {
        tracing::warn!(instance_id, error = message, "effect failed to activate");
    });

    // Deinterleave, process block by block, reinterleave.
    let mut planar: Vec<Vec<f32>> = (0..channels)
        .map(|c| samples.iter().skip(c).step_by(channels).copied().collect())
        .collect();
    for channel in &mut planar {
        channel.resize(frames.div_ceil(args.block_size) * args.block_size, 0.0);
    }
    let mut rendered: Vec<Vec<f32>> = vec![vec![0.0; planar[0].len()]; channels];

    let mut offset = 0;
    while offset < planar[0].len() {
        let end = offset + args.block_size;
        let inputs: Vec<&[f32]> = planar.iter().map(|c| &c[offset..end]).collect();
        let mut outputs: Vec<&mut [f32]> = rendered
            .iter_mut()
            .map(|c| &mut c[offset..end])
            .collect();
        rt_board.run(&inputs, &mut outputs, args.block_size, &[]);
        offset = end;
    }
    rt_board.deactivate();

    let out_spec = hound::WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&args.output, out_spec)
        .with_context(|| format!("creating {}", args.output.display()))?;
    for frame in 0..frames {
        for channel in rendered.iter().take(channels) {
            writer.write_sample(channel[frame])?;
        }
    }
    writer.finalize()?;

    println!(
        "rendered {} frames through '{}' -> {}",
        frames,
        board.name,
        args.output.display()
    );
    Ok(())
}
