//! The polymorphic pedalboard node.
//!
//! [`EffectNode`] is a closed sum over the two node kinds a pedalboard can
//! contain: a hosted plugin ([`PluginEffect`]) and a split with two
//! sub-chains ([`SplitEffect`](crate::split::SplitEffect)). New node kinds
//! are additions to the sum type, not a virtual hierarchy.
//!
//! Every method reachable from `process()` is allocation-free; channel
//! reference arrays are built on the stack with inline small-vectors.

use smallvec::SmallVec;

use pedalera_midi::MidiEvent;

use crate::atom::{AtomQueue, Urid};
use crate::plugin::{PluginContext, PluginDescriptor, PluginError, PluginInstance, PortDirection};
use crate::split::SplitEffect;

/// Most channels any node or scratch chain carries.
pub const MAX_CHANNELS: usize = 8;

/// Inline channel-reference vectors used on the audio thread.
pub type InputRefs<'a> = SmallVec<[&'a [f32]; MAX_CHANNELS]>;
pub type OutputRefs<'a> = SmallVec<[&'a mut [f32]; MAX_CHANNELS]>;

/// A hosted plugin instance plus its host-side bookkeeping.
pub struct PluginEffect {
    instance_id: i64,
    instance: Box<dyn PluginInstance>,
    bypass: bool,
    /// Activation failed; outputs are zeroed until the next rebuild.
    failed: bool,
    /// A host-initiated patch-set landed since the last notification.
    state_dirty: bool,
    atom_in: AtomQueue,
    atom_out: AtomQueue,
}

impl PluginEffect {
    pub fn new(instance_id: i64, instance: Box<dyn PluginInstance>) -> Self {
        Self {
            instance_id,
            instance,
            bypass: false,
            failed: false,
            state_dirty: false,
            atom_in: AtomQueue::with_default_capacity(),
            atom_out: AtomQueue::with_default_capacity(),
        }
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        self.instance.descriptor()
    }

    pub fn control_index(&self, symbol: &str) -> Option<usize> {
        self.instance.descriptor().control_index(symbol)
    }

    /// Write a control input, clamped to the port's declared range.
    ///
    /// Writes to output ports are ignored.
    pub fn set_control(&mut self, index: usize, value: f32) {
        let Some(port) = self.instance.descriptor().controls.get(index) else {
            return;
        };
        if port.direction != PortDirection::Input {
            return;
        }
        let clamped = port.clamp(value);
        self.instance.set_control(index, clamped);
    }

    pub fn control(&self, index: usize) -> f32 {
        self.instance.control(index)
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn bypassed(&self) -> bool {
        self.bypass
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Queue a patch-get for the next `process`.
    pub fn push_patch_get(&mut self, property: Urid) -> bool {
        self.atom_in.push_get(0, property)
    }

    /// Queue a patch-set for the next `process` and mark state dirty.
    pub fn push_patch_set(&mut self, property: Urid, payload: &[u8]) -> bool {
        let queued = self.atom_in.push_set(0, property, payload);
        if queued {
            self.state_dirty = true;
        }
        queued
    }

    /// Patch replies and notifications produced by the last `process`.
    pub fn atom_out(&self) -> &AtomQueue {
        &self.atom_out
    }

    /// Clear per-block atom traffic after the processor consumed it.
    pub fn clear_atom_queues(&mut self) {
        self.atom_in.clear();
        self.atom_out.clear();
    }

    /// True once if state may have changed since the last call.
    pub fn take_state_dirty(&mut self) -> bool {
        std::mem::take(&mut self.state_dirty)
    }

    pub fn save_state(&self) -> Option<Vec<u8>> {
        self.instance.save_state()
    }

    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<(), PluginError> {
        self.instance.restore_state(bytes)
    }

    fn activate(&mut self, sample_rate: f64, max_frames: usize) -> Result<(), ()> {
        match self.instance.activate(sample_rate, max_frames) {
            Ok(()) => {
                self.failed = false;
                Ok(())
            }
            Err(_) => {
                self.failed = true;
                Err(())
            }
        }
    }

    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    ) {
        if self.failed {
            for output in outputs.iter_mut() {
                output[..frames].fill(0.0);
            }
            return;
        }
        if self.bypass {
            copy_through(inputs, outputs, frames);
            return;
        }
        let midi = if self.instance.descriptor().wants_midi {
            midi
        } else {
            &[]
        };
        let mut ctx = PluginContext {
            midi,
            atom_in: &self.atom_in,
            atom_out: &mut self.atom_out,
        };
        self.instance.process(inputs, outputs, frames, &mut ctx);
    }

    /// Channels this node produces when fed `input_channels`.
    pub fn output_channels(&self, input_channels: usize) -> usize {
        let descriptor = self.instance.descriptor();
        if descriptor.audio_inputs == 0 {
            descriptor.audio_outputs
        } else {
            descriptor.audio_outputs.min(input_channels.max(1))
        }
    }
}

/// Channel-wise passthrough: copy inputs, zero outputs with no source.
pub(crate) fn copy_through(inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
    for (channel, output) in outputs.iter_mut().enumerate() {
        match inputs.get(channel) {
            Some(input) => output[..frames].copy_from_slice(&input[..frames]),
            None => output[..frames].fill(0.0),
        }
    }
}

/// One node of a realtime pedalboard.
pub enum EffectNode {
    Plugin(PluginEffect),
    Split(SplitEffect),
}

impl EffectNode {
    pub fn instance_id(&self) -> i64 {
        match self {
            EffectNode::Plugin(p) => p.instance_id(),
            EffectNode::Split(s) => s.instance_id(),
        }
    }

    /// Activate for processing; failures are reported through `on_error`
    /// with the failing node's instance id, and the node runs bypassed
    /// (zeroed) until the next rebuild.
    pub fn activate(
        &mut self,
        sample_rate: f64,
        max_frames: usize,
        on_error: &mut dyn FnMut(i64, &'static str),
    ) {
        match self {
            EffectNode::Plugin(p) => {
                let id = p.instance_id();
                if p.activate(sample_rate, max_frames).is_err() {
                    on_error(id, "plugin activation failed");
                }
            }
            EffectNode::Split(s) => s.activate(sample_rate, max_frames, on_error),
        }
    }

    pub fn deactivate(&mut self) {
        match self {
            EffectNode::Plugin(p) => p.instance.deactivate(),
            EffectNode::Split(s) => s.deactivate(),
        }
    }

    pub fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    ) {
        match self {
            EffectNode::Plugin(p) => p.process(inputs, outputs, frames, midi),
            EffectNode::Split(s) => s.process(inputs, outputs, frames, midi),
        }
    }

    pub fn control_index(&self, symbol: &str) -> Option<usize> {
        match self {
            EffectNode::Plugin(p) => p.control_index(symbol),
            EffectNode::Split(s) => s.control_index(symbol),
        }
    }

    pub fn set_control(&mut self, index: usize, value: f32) {
        match self {
            EffectNode::Plugin(p) => p.set_control(index, value),
            EffectNode::Split(s) => s.set_control(index, value),
        }
    }

    pub fn control(&self, index: usize) -> f32 {
        match self {
            EffectNode::Plugin(p) => p.control(index),
            EffectNode::Split(s) => s.control(index),
        }
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        match self {
            EffectNode::Plugin(p) => p.set_bypass(bypass),
            EffectNode::Split(s) => s.set_bypass(bypass),
        }
    }

    pub fn bypassed(&self) -> bool {
        match self {
            EffectNode::Plugin(p) => p.bypassed(),
            EffectNode::Split(s) => s.bypassed(),
        }
    }

    pub fn output_channels(&self, input_channels: usize) -> usize {
        match self {
            EffectNode::Plugin(p) => p.output_channels(input_channels),
            EffectNode::Split(s) => s.output_channels(input_channels),
        }
    }

    /// The plugin payload, when this node hosts one.
    pub fn as_plugin(&self) -> Option<&PluginEffect> {
        match self {
            EffectNode::Plugin(p) => Some(p),
            EffectNode::Split(_) => None,
        }
    }

    pub fn as_plugin_mut(&mut self) -> Option<&mut PluginEffect> {
        match self {
            EffectNode::Plugin(p) => Some(p),
            EffectNode::Split(_) => None,
        }
    }

    /// Visit this node and, for splits, every nested node.
    pub fn for_each_plugin_mut(&mut self, f: &mut dyn FnMut(&mut PluginEffect)) {
        match self {
            EffectNode::Plugin(p) => f(p),
            EffectNode::Split(s) => s.for_each_plugin_mut(f),
        }
    }

    /// Shared-reference visitor over nested plugins.
    pub fn for_each_plugin(&self, f: &mut dyn FnMut(&PluginEffect)) {
        match self {
            EffectNode::Plugin(p) => f(p),
            EffectNode::Split(s) => s.for_each_plugin(f),
        }
    }

    /// Recursive lookup by instance id, descending into splits.
    pub fn find_mut(&mut self, instance_id: i64) -> Option<&mut EffectNode> {
        if self.instance_id() == instance_id {
            return Some(self);
        }
        match self {
            EffectNode::Plugin(_) => None,
            EffectNode::Split(s) => {
                let (top, bottom) = s.chains_mut();
                top.iter_mut()
                    .chain(bottom.iter_mut())
                    .find_map(|node| node.find_mut(instance_id))
            }
        }
    }

    /// Recursive shared lookup by instance id.
    pub fn find(&self, instance_id: i64) -> Option<&EffectNode> {
        if self.instance_id() == instance_id {
            return Some(self);
        }
        match self {
            EffectNode::Plugin(_) => None,
            EffectNode::Split(s) => {
                let (top, bottom) = s.chains();
                top.iter()
                    .chain(bottom.iter())
                    .find_map(|node| node.find(instance_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::UridMap;
    use crate::builtin::GainPlugin;

    fn gain_node(instance_id: i64) -> EffectNode {
        let urids = UridMap::new();
        EffectNode::Plugin(PluginEffect::new(
            instance_id,
            Box::new(GainPlugin::new(&urids)),
        ))
    }

    fn run(node: &mut EffectNode, input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; input.len()];
        let inputs = [input];
        let mut outputs = [out.as_mut_slice()];
        node.process(&inputs, &mut outputs, input.len(), &[]);
        out
    }

    #[test]
    fn set_control_clamps_to_range() {
        let mut node = gain_node(1);
        let index = node.control_index("gain").unwrap();
        node.set_control(index, 99.0);
        assert_eq!(node.control(index), 2.0);
        node.set_control(index, -5.0);
        assert_eq!(node.control(index), 0.0);
    }

    #[test]
    fn writes_to_output_ports_are_ignored() {
        let mut node = gain_node(1);
        let index = node.control_index("out_level").unwrap();
        node.set_control(index, 1.5);
        assert_eq!(node.control(index), 0.0);
    }

    #[test]
    fn bypass_is_passthrough() {
        let mut node = gain_node(1);
        let mut errors = Vec::new();
        node.activate(48000.0, 8, &mut |id, msg| errors.push((id, msg)));
        assert!(errors.is_empty());

        let index = node.control_index("gain").unwrap();
        node.set_control(index, 0.0);
        node.set_bypass(true);
        let out = run(&mut node, &[0.5, -0.5, 1.0]);
        assert_eq!(out, vec![0.5, -0.5, 1.0]);
    }

    #[test]
    fn failed_activation_zeroes_output() {
        struct FailingPlugin;
        static FAILING_DESCRIPTOR: crate::plugin::PluginDescriptor =
            crate::plugin::PluginDescriptor {
                uri: "urn:test:failing",
                name: "Failing",
                audio_inputs: 2,
                audio_outputs: 2,
                wants_midi: false,
                controls: &[],
            };
        impl PluginInstance for FailingPlugin {
            fn descriptor(&self) -> &PluginDescriptor {
                &FAILING_DESCRIPTOR
            }
            fn activate(&mut self, _: f64, _: usize) -> Result<(), PluginError> {
                Err(PluginError::ActivationFailed("nope".into()))
            }
            fn deactivate(&mut self) {}
            fn process(
                &mut self,
                _: &[&[f32]],
                outputs: &mut [&mut [f32]],
                frames: usize,
                _: &mut PluginContext<'_>,
            ) {
                for o in outputs.iter_mut() {
                    o[..frames].fill(1.0);
                }
            }
            fn set_control(&mut self, _: usize, _: f32) {}
            fn control(&self, _: usize) -> f32 {
                0.0
            }
        }

        let mut node = EffectNode::Plugin(PluginEffect::new(7, Box::new(FailingPlugin)));
        let mut errors = Vec::new();
        node.activate(48000.0, 4, &mut |id, msg| errors.push((id, msg)));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 7);

        let out = run(&mut node, &[0.5, 0.5]);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn patch_set_marks_state_dirty_once() {
        let mut node = gain_node(1);
        let plugin = node.as_plugin_mut().unwrap();
        assert!(!plugin.take_state_dirty());
        plugin.push_patch_set(1, b"\"x\"");
        assert!(plugin.take_state_dirty());
        assert!(!plugin.take_state_dirty());
    }
}
