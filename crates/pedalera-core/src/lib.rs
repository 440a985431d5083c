//! Pedalera Core - effect abstraction and pedalboard model.
//!
//! This crate provides the building blocks shared by the realtime engine and
//! the host-side control plane:
//!
//! - [`PluginInstance`] trait and [`PluginRegistry`] - the hosting surface a
//!   plugin provider implements (a small set of built-in plugins ships here)
//! - [`EffectNode`] - the polymorphic pedalboard node: a hosted plugin or a
//!   split with two sub-chains
//! - [`DbDezipper`] - dB-targeted one-pole gain smoothing for click-free
//!   volume changes
//! - [`AtomQueue`] and [`UridMap`] - patch-property plumbing (opaque typed
//!   values exchanged with plugins)
//! - [`Pedalboard`] - the editable, serializable pedalboard model
//!
//! Everything reachable from an audio-thread `process()` call is
//! allocation-free once constructed; construction and state handling happen
//! on the non-realtime side.

pub mod atom;
pub mod builtin;
pub mod dezipper;
pub mod effect;
pub mod math;
pub mod pedalboard;
pub mod plugin;
pub mod split;

pub use atom::{AtomEntry, AtomKind, AtomQueue, Urid, UridMap, ATOM_PAYLOAD_CAPACITY};
pub use dezipper::DbDezipper;
pub use effect::{EffectNode, InputRefs, OutputRefs, PluginEffect, MAX_CHANNELS};
pub use math::{db_to_linear, linear_to_db};
pub use pedalboard::{
    ControlValue, ItemKind, Pedalboard, PedalboardItem, PluginConfig, SplitConfig,
};
pub use plugin::{
    ControlPortInfo, PluginContext, PluginDescriptor, PluginError, PluginInstance, PluginRegistry,
    PortDirection,
};
pub use split::{SplitEffect, SplitType};

/// Pseudo instance id of the input bus, used by VU subscriptions.
pub const INPUT_BUS_INSTANCE_ID: i64 = -2;
/// Pseudo instance id of the output bus, used by VU subscriptions.
pub const OUTPUT_BUS_INSTANCE_ID: i64 = -3;
