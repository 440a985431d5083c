//! The split node: two parallel sub-chains with a merge stage.
//!
//! A split takes the chain's signal, feeds it to a *top* and a *bottom*
//! sub-chain (each an independent effect list with its own scratch buffers),
//! and combines their outputs according to the split type. Because changing
//! the split type can change the node's output channel count, type changes
//! rebuild the whole pedalboard on the host side; at runtime only the mix
//! ratio is a control.

use serde::{Deserialize, Serialize};

use pedalera_midi::MidiEvent;

use crate::effect::{copy_through, EffectNode, InputRefs, OutputRefs, MAX_CHANNELS};

/// How a split combines its sub-chain outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitType {
    /// Top chain only.
    A,
    /// Bottom chain only.
    B,
    /// Blend of both, governed by the `mix` control.
    Mix,
    /// Top chain to the left output, bottom chain to the right.
    LeftRight,
}

/// Per-stage planar scratch for one sub-chain.
///
/// `stages[i]` holds the output channels of sub-chain effect `i`; buffers
/// are allocated once during prepare and never resized on the audio thread.
#[derive(Default)]
struct ChainScratch {
    stages: Vec<Vec<Box<[f32]>>>,
}

impl ChainScratch {
    fn prepare(effects: &[EffectNode], input_channels: usize, max_frames: usize) -> Self {
        let mut stages = Vec::with_capacity(effects.len());
        let mut channels = input_channels;
        for effect in effects {
            channels = effect.output_channels(channels);
            let stage = (0..channels)
                .map(|_| vec![0.0f32; max_frames].into_boxed_slice())
                .collect();
            stages.push(stage);
        }
        Self { stages }
    }
}

/// A split node: `{A, B, Mix, LeftRight}` over two owned sub-chains.
pub struct SplitEffect {
    instance_id: i64,
    split_type: SplitType,
    /// Blend position for [`SplitType::Mix`], -1 (all top) to +1 (all bottom).
    mix: f32,
    bypass: bool,
    top: Vec<EffectNode>,
    bottom: Vec<EffectNode>,
    top_scratch: ChainScratch,
    bottom_scratch: ChainScratch,
    input_channels: usize,
}

impl SplitEffect {
    /// Build a split over two sub-chains. `input_channels` is the channel
    /// count this node is fed; scratch is sized for `max_frames` blocks.
    pub fn new(
        instance_id: i64,
        split_type: SplitType,
        mix: f32,
        top: Vec<EffectNode>,
        bottom: Vec<EffectNode>,
        input_channels: usize,
        max_frames: usize,
    ) -> Self {
        let top_scratch = ChainScratch::prepare(&top, input_channels, max_frames);
        let bottom_scratch = ChainScratch::prepare(&bottom, input_channels, max_frames);
        Self {
            instance_id,
            split_type,
            mix: mix.clamp(-1.0, 1.0),
            bypass: false,
            top,
            bottom,
            top_scratch,
            bottom_scratch,
            input_channels,
        }
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn split_type(&self) -> SplitType {
        self.split_type
    }

    pub fn control_index(&self, symbol: &str) -> Option<usize> {
        (symbol == "mix").then_some(0)
    }

    pub fn set_control(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.mix = value.clamp(-1.0, 1.0);
        }
    }

    pub fn control(&self, index: usize) -> f32 {
        if index == 0 {
            self.mix
        } else {
            0.0
        }
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn bypassed(&self) -> bool {
        self.bypass
    }

    pub fn activate(
        &mut self,
        sample_rate: f64,
        max_frames: usize,
        on_error: &mut dyn FnMut(i64, &'static str),
    ) {
        for effect in self.top.iter_mut().chain(self.bottom.iter_mut()) {
            effect.activate(sample_rate, max_frames, on_error);
        }
    }

    pub fn deactivate(&mut self) {
        for effect in self.top.iter_mut().chain(self.bottom.iter_mut()) {
            effect.deactivate();
        }
    }

    pub fn for_each_plugin_mut(&mut self, f: &mut dyn FnMut(&mut crate::effect::PluginEffect)) {
        for effect in self.top.iter_mut().chain(self.bottom.iter_mut()) {
            effect.for_each_plugin_mut(f);
        }
    }

    pub fn for_each_plugin(&self, f: &mut dyn FnMut(&crate::effect::PluginEffect)) {
        for effect in self.top.iter().chain(self.bottom.iter()) {
            effect.for_each_plugin(f);
        }
    }

    fn chain_output_channels(chain: &[EffectNode], input_channels: usize) -> usize {
        chain
            .iter()
            .fold(input_channels, |channels, e| e.output_channels(channels))
    }

    pub fn output_channels(&self, input_channels: usize) -> usize {
        match self.split_type {
            SplitType::A => Self::chain_output_channels(&self.top, input_channels),
            SplitType::B => Self::chain_output_channels(&self.bottom, input_channels),
            SplitType::Mix => Self::chain_output_channels(&self.top, input_channels)
                .max(Self::chain_output_channels(&self.bottom, input_channels)),
            SplitType::LeftRight => 2,
        }
    }

    pub fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    ) {
        if self.bypass {
            copy_through(inputs, outputs, frames);
            return;
        }

        run_chain(&mut self.top, &mut self.top_scratch, inputs, frames, midi);
        run_chain(
            &mut self.bottom,
            &mut self.bottom_scratch,
            inputs,
            frames,
            midi,
        );

        let top: InputRefs<'_> = chain_output(&self.top_scratch, inputs, frames);
        let bottom: InputRefs<'_> = chain_output(&self.bottom_scratch, inputs, frames);

        match self.split_type {
            SplitType::A => copy_through(&top, outputs, frames),
            SplitType::B => copy_through(&bottom, outputs, frames),
            SplitType::Mix => {
                // mix = -1 is all top, +1 all bottom, 0 an equal sum.
                let blend = (self.mix + 1.0) * 0.5;
                let top_gain = 1.0 - blend;
                let bottom_gain = blend;
                for (channel, output) in outputs.iter_mut().enumerate() {
                    let t = top.get(channel).copied();
                    let b = bottom.get(channel).copied();
                    for i in 0..frames {
                        let ts = t.map_or(0.0, |s| s[i]);
                        let bs = b.map_or(0.0, |s| s[i]);
                        output[i] = ts * top_gain + bs * bottom_gain;
                    }
                }
            }
            SplitType::LeftRight => {
                if let Some(left) = outputs.get_mut(0) {
                    match top.first() {
                        Some(source) => left[..frames].copy_from_slice(&source[..frames]),
                        None => left[..frames].fill(0.0),
                    }
                }
                if let Some(right) = outputs.get_mut(1) {
                    match bottom.first() {
                        Some(source) => right[..frames].copy_from_slice(&source[..frames]),
                        None => right[..frames].fill(0.0),
                    }
                }
                for output in outputs.iter_mut().skip(2) {
                    output[..frames].fill(0.0);
                }
            }
        }
    }

    /// Channels this split was prepared for.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// The sub-chains, for host-side inspection.
    pub fn chains(&self) -> (&[EffectNode], &[EffectNode]) {
        (&self.top, &self.bottom)
    }

    pub fn chains_mut(&mut self) -> (&mut [EffectNode], &mut [EffectNode]) {
        (&mut self.top, &mut self.bottom)
    }
}

/// Run `effects` over `scratch`, feeding stage `i` from stage `i-1`.
fn run_chain(
    effects: &mut [EffectNode],
    scratch: &mut ChainScratch,
    inputs: &[&[f32]],
    frames: usize,
    midi: &[MidiEvent],
) {
    for i in 0..effects.len() {
        let (before, rest) = scratch.stages.split_at_mut(i);
        let stage = &mut rest[0];
        let mut out_refs: OutputRefs<'_> = stage.iter_mut().map(|b| &mut b[..frames]).collect();
        if i == 0 {
            effects[i].process(inputs, &mut out_refs, frames, midi);
        } else {
            let prev = &before[i - 1];
            let in_refs: InputRefs<'_> = prev.iter().map(|b| &b[..frames]).collect();
            effects[i].process(&in_refs, &mut out_refs, frames, midi);
        }
    }
}

/// The chain's final output channels: the last scratch stage, or the split's
/// own inputs when the chain is empty.
fn chain_output<'a>(
    scratch: &'a ChainScratch,
    inputs: &[&'a [f32]],
    frames: usize,
) -> InputRefs<'a> {
    match scratch.stages.last() {
        Some(stage) => stage.iter().map(|b| &b[..frames]).collect(),
        None => inputs.iter().copied().take(MAX_CHANNELS).collect(),
    }
}
