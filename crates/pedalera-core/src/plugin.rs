//! The plugin hosting surface.
//!
//! The engine treats plugins as an external collaborator reached through two
//! types: [`PluginRegistry`] resolves a plugin URI to a factory, and
//! [`PluginInstance`] is the per-instance contract the realtime pedalboard
//! drives. Metadata scanning of on-disk bundles belongs to the plugin
//! provider; the registry here is the seam it plugs into, pre-populated with
//! the built-in utility plugins from [`crate::builtin`].
//!
//! # Realtime contract
//!
//! `process()` runs on the audio thread: it must not allocate, lock, or
//! block. `activate()` may allocate (it runs at handover, before the first
//! `process`), but may not suspend. `save_state`/`restore_state` are
//! non-realtime only; state reaches a live instance exclusively through a
//! pedalboard rebuild.

use std::collections::HashMap;

use thiserror::Error;

use pedalera_midi::MidiEvent;

use crate::atom::AtomQueue;

/// Errors from plugin resolution, activation, and state handling.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin uri: {0}")]
    UnknownPlugin(String),

    #[error("unknown control symbol '{symbol}' on {uri}")]
    UnknownControl { uri: String, symbol: String },

    #[error("plugin activation failed: {0}")]
    ActivationFailed(String),

    #[error("state restore failed: {0}")]
    StateRestoreFailed(String),
}

/// Direction of a control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    /// Written by the host, read by the plugin.
    Input,
    /// Written by the plugin, read by the host (monitor ports).
    Output,
}

/// Static description of one control port.
#[derive(Debug, Clone)]
pub struct ControlPortInfo {
    /// Stable symbol the control plane addresses the port by.
    pub symbol: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    pub direction: PortDirection,
    pub default: f32,
    pub min: f32,
    pub max: f32,
}

impl ControlPortInfo {
    pub const fn input(
        symbol: &'static str,
        name: &'static str,
        min: f32,
        max: f32,
        default: f32,
    ) -> Self {
        Self {
            symbol,
            name,
            direction: PortDirection::Input,
            default,
            min,
            max,
        }
    }

    pub const fn output(symbol: &'static str, name: &'static str, min: f32, max: f32) -> Self {
        Self {
            symbol,
            name,
            direction: PortDirection::Output,
            default: min,
            min,
            max,
        }
    }

    /// Clamp `value` into the port's declared range.
    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// Static description of a plugin.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Stable identity, e.g. `urn:pedalera:gain`.
    pub uri: &'static str,
    pub name: &'static str,
    /// Audio channels the plugin can consume / produce. Instances accept any
    /// channel count up to these during `process`.
    pub audio_inputs: usize,
    pub audio_outputs: usize,
    /// True when the plugin consumes MIDI events.
    pub wants_midi: bool,
    pub controls: &'static [ControlPortInfo],
}

impl PluginDescriptor {
    /// Index of the control port with `symbol`.
    pub fn control_index(&self, symbol: &str) -> Option<usize> {
        self.controls.iter().position(|c| c.symbol == symbol)
    }
}

/// Per-block context handed to [`PluginInstance::process`].
pub struct PluginContext<'a> {
    /// MIDI events for this block (empty unless the plugin wants MIDI).
    pub midi: &'a [MidiEvent],
    /// Patch requests queued for the plugin this block.
    pub atom_in: &'a AtomQueue,
    /// Replies and spontaneous property notifications go here.
    pub atom_out: &'a mut AtomQueue,
}

impl std::fmt::Debug for dyn PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("descriptor", self.descriptor())
            .finish_non_exhaustive()
    }
}

/// One live plugin instance, driven by the realtime pedalboard.
pub trait PluginInstance: Send {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Prepare for processing at `sample_rate` with blocks of at most
    /// `max_frames`. Runs non-suspending at pedalboard handover.
    fn activate(&mut self, sample_rate: f64, max_frames: usize) -> Result<(), PluginError>;

    fn deactivate(&mut self);

    /// Process one block. `inputs`/`outputs` are planar channel slices of
    /// equal length; the instance must write every output sample.
    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        ctx: &mut PluginContext<'_>,
    );

    /// Write a control input port. `value` is already clamped to the port
    /// range by the caller.
    fn set_control(&mut self, index: usize, value: f32);

    /// Read a control port's current value (inputs echo the last write,
    /// outputs report what the plugin computed last block).
    fn control(&self, index: usize) -> f32;

    /// Snapshot opaque state. Non-realtime.
    fn save_state(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restore opaque state. Non-realtime; called before activation.
    fn restore_state(&mut self, _bytes: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Factory signature stored in the registry.
///
/// Factories receive the host's URID map so instances can intern the
/// property URIs they answer patch requests for.
pub type PluginFactory = Box<dyn Fn(&crate::atom::UridMap) -> Box<dyn PluginInstance> + Send + Sync>;

/// Registry of instantiable plugins, keyed by URI.
pub struct PluginRegistry {
    entries: HashMap<&'static str, RegistryEntry>,
}

struct RegistryEntry {
    descriptor: PluginDescriptor,
    factory: PluginFactory,
}

impl PluginRegistry {
    /// An empty registry. Providers register their plugins into it.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in utility plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register(&mut registry);
        registry
    }

    /// Register a plugin. Replaces any previous entry for the same URI.
    pub fn register(
        &mut self,
        descriptor: PluginDescriptor,
        factory: impl Fn(&crate::atom::UridMap) -> Box<dyn PluginInstance> + Send + Sync + 'static,
    ) {
        self.entries.insert(
            descriptor.uri,
            RegistryEntry {
                descriptor,
                factory: Box::new(factory),
            },
        );
    }

    /// Look up a plugin's descriptor.
    pub fn descriptor(&self, uri: &str) -> Option<&PluginDescriptor> {
        self.entries.get(uri).map(|e| &e.descriptor)
    }

    /// True when `uri` can be instantiated.
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Instantiate a plugin by URI.
    pub fn create(
        &self,
        uri: &str,
        urids: &crate::atom::UridMap,
    ) -> Result<Box<dyn PluginInstance>, PluginError> {
        let entry = self
            .entries
            .get(uri)
            .ok_or_else(|| PluginError::UnknownPlugin(uri.to_owned()))?;
        Ok((entry.factory)(urids))
    }

    /// All registered descriptors, in no particular order.
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
