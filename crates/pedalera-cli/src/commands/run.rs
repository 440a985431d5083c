//! Live engine runner.
//!
//! Opens an audio session over the dummy device (a real soundcard backend
//! plugs in behind the same `PcmDriver` seam on the appliance), loads a
//! preset, and prints VU levels until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use pedalera_core::{Pedalboard, PluginRegistry, OUTPUT_BUS_INSTANCE_ID};
use pedalera_io::DummyDriver;
use pedalera_session::{load_preset, AudioSession, ChannelSelection, EngineEvent, ServerSettings};

#[derive(Args)]
pub struct RunArgs {
    /// Pedalboard preset (TOML); a passthrough board when omitted
    #[arg(short, long)]
    preset: Option<PathBuf>,

    /// Sample rate
    #[arg(long, default_value = "48000")]
    sample_rate: u32,

    /// Period size in frames
    #[arg(long, default_value = "64")]
    period_frames: usize,

    /// Periods in the device buffer
    #[arg(long, default_value = "3")]
    period_count: usize,

    /// How long to run, in seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "0")]
    seconds: u64,
}

pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let board = match &args.preset {
        Some(path) => {
            load_preset(path).with_context(|| format!("loading preset {}", path.display()))?
        }
        None => Pedalboard::new("passthrough"),
    };

    let settings = ServerSettings {
        device_name: "dummy".into(),
        sample_rate: args.sample_rate,
        period_frames: args.period_frames,
        period_count: args.period_count,
        fallback_to_dummy: true,
    };
    let driver = DummyDriver { channels: 2 };
    let mut session = AudioSession::open(
        &settings,
        &ChannelSelection::default(),
        Arc::new(PluginRegistry::with_builtins()),
        &driver,
        Vec::new(),
    )?;
    println!("engine: {}", session.server_configuration().description);

    let warnings = session
        .set_pedalboard(&board)
        .context("loading pedalboard")?;
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    println!("pedalboard: {}", board.name);

    session.set_event_listener(Some(Arc::new(|event| match event {
        EngineEvent::Underrun { count } => eprintln!("xrun (total {count})"),
        EngineEvent::RealtimeError {
            instance_id,
            message,
        } => eprintln!("effect {instance_id}: {message}"),
        EngineEvent::AudioStopped => eprintln!("audio stopped"),
        _ => {}
    })))?;

    session.subscribe_vu(
        OUTPUT_BUS_INSTANCE_ID,
        Arc::new(|update| {
            print!(
                "\rout peak {:>6.3} rms {:>6.3}   ",
                update.peak_left, update.rms_left
            );
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }),
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;

    let deadline = (args.seconds > 0).then(|| std::time::Instant::now() + Duration::from_secs(args.seconds));
    while !stop.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    println!("\nclosing");
    session.close();
    Ok(())
}
