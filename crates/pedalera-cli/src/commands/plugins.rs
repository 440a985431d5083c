//! List the hostable plugins and their control ports.

use clap::Args;
use pedalera_core::{PluginRegistry, PortDirection};

#[derive(Args)]
pub struct PluginsArgs {
    /// Show control ports for each plugin
    #[arg(short, long)]
    verbose: bool,
}

pub fn run(args: PluginsArgs) -> anyhow::Result<()> {
    let registry = PluginRegistry::with_builtins();
    let mut descriptors: Vec<_> = registry.descriptors().collect();
    descriptors.sort_by_key(|d| d.uri);

    for descriptor in descriptors {
        println!(
            "{:<24} {}  ({} in / {} out)",
            descriptor.name, descriptor.uri, descriptor.audio_inputs, descriptor.audio_outputs
        );
        if args.verbose {
            for port in descriptor.controls {
                let direction = match port.direction {
                    PortDirection::Input => "in ",
                    PortDirection::Output => "out",
                };
                println!(
                    "    {direction} {:<12} {:<16} [{}, {}] default {}",
                    port.symbol, port.name, port.min, port.max, port.default
                );
            }
        }
    }
    Ok(())
}
