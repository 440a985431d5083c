//! The realtime pedalboard: an immutable-from-RT effect graph plus the
//! pre-built plumbing needed to run it allocation-free.
//!
//! Construction happens on the non-realtime side ([`RtPedalboardBuilder`]):
//! every scratch buffer is allocated, every effect instantiated, controls
//! applied, state restored, and MIDI bindings resolved to effect/port
//! indices. The finished board is handed to the audio thread by pointer and
//! comes back through a `release` notification; the audio thread only ever
//! calls [`RtPedalboard::activate`], [`run`](RtPedalboard::run), the control
//! mutators, and [`deactivate`](RtPedalboard::deactivate).

use smallvec::SmallVec;

use pedalera_core::{
    DbDezipper, EffectNode, InputRefs, ItemKind, OutputRefs, Pedalboard, PedalboardItem,
    PluginEffect, PluginError, PluginRegistry, SplitEffect, UridMap, INPUT_BUS_INSTANCE_ID,
    MAX_CHANNELS, OUTPUT_BUS_INSTANCE_ID,
};
use pedalera_midi::{BindingMode, BindingTarget, MidiBinding, MidiEvent};

use crate::vu::VuSubscriptionList;

type BufferIds = SmallVec<[usize; MAX_CHANNELS]>;

/// Planar float scratch buffers owned by one pedalboard.
///
/// Builder invariant: a process action's output buffers never alias its
/// input buffers, so handing out shared input slices next to exclusive
/// output slices is sound.
struct BufferPool {
    buffers: Vec<Box<[f32]>>,
    frames: usize,
}

impl BufferPool {
    fn new(max_frames: usize) -> Self {
        Self {
            buffers: Vec::new(),
            frames: max_frames,
        }
    }

    fn allocate(&mut self) -> usize {
        self.buffers.push(vec![0.0; self.frames].into_boxed_slice());
        self.buffers.len() - 1
    }

    fn buffer(&self, id: usize) -> &[f32] {
        &self.buffers[id]
    }

    fn buffer_mut(&mut self, id: usize) -> &mut [f32] {
        &mut self.buffers[id]
    }

    fn io(
        &mut self,
        inputs: &[usize],
        outputs: &[usize],
        frames: usize,
    ) -> (InputRefs<'_>, OutputRefs<'_>) {
        debug_assert!(
            outputs.iter().all(|o| !inputs.contains(o)),
            "effect outputs must not alias inputs"
        );
        let base = self.buffers.as_mut_ptr();
        let ins: InputRefs<'_> = inputs
            .iter()
            .map(|&i| unsafe { &(&*base.add(i))[..frames] })
            .collect();
        let outs: OutputRefs<'_> = outputs
            .iter()
            .map(|&o| unsafe { &mut (&mut *base.add(o))[..frames] })
            .collect();
        (ins, outs)
    }
}

/// Buffer wiring for one top-level process action.
struct EffectWiring {
    inputs: BufferIds,
    outputs: BufferIds,
}

/// One pre-computed per-block action.
enum ProcessAction {
    /// Run the top-level effect at this index over its wired buffers.
    Process { effect_index: usize },
}

/// A resolved MIDI binding, ready to fire on the audio thread.
pub struct RtMidiMapping {
    binding: MidiBinding,
    instance_id: i64,
    /// `None` targets the item's bypass switch.
    control_index: Option<u32>,
    last_raw: u8,
    has_last: bool,
}

/// What a fired mapping changed, for host notification.
pub enum MappingFire {
    Control {
        instance_id: i64,
        control_index: u32,
        value: f32,
    },
    Enabled {
        instance_id: i64,
        enabled: bool,
    },
}

/// A build-time problem with one item; the board still runs.
#[derive(Debug)]
pub struct BuildError {
    pub instance_id: i64,
    pub message: String,
}

pub struct RtPedalboard {
    sample_rate: f64,
    max_frames: usize,
    effects: Vec<EffectNode>,
    wiring: Vec<EffectWiring>,
    process_actions: Vec<ProcessAction>,
    pool: BufferPool,
    input_ids: BufferIds,
    output_ids: BufferIds,
    input_volume: DbDezipper,
    output_volume: DbDezipper,
    gain_ramp: Box<[f32]>,
    midi_mappings: Vec<RtMidiMapping>,
    activated: bool,
}

impl std::fmt::Debug for RtPedalboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtPedalboard").finish_non_exhaustive()
    }
}

impl RtPedalboard {
    /// A passthrough board with no effects; useful before any pedalboard
    /// has been handed over and in tests.
    pub fn empty(
        sample_rate: f64,
        max_frames: usize,
        input_channels: usize,
        output_channels: usize,
    ) -> Self {
        let _ = output_channels;
        let registry = PluginRegistry::new();
        let urids = UridMap::new();
        let builder = RtPedalboardBuilder {
            registry: &registry,
            urids: &urids,
            sample_rate,
            max_frames,
            input_channels,
        };
        let (board, errors) = builder
            .build(&Pedalboard::new("empty"))
            .expect("empty pedalboard cannot fail");
        debug_assert!(errors.is_empty());
        *board
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Activate every effect. Failures are reported through `on_error` and
    /// leave the failing node silent; the board still runs.
    pub fn activate(&mut self, on_error: &mut dyn FnMut(i64, &'static str)) {
        if self.activated {
            return;
        }
        for effect in &mut self.effects {
            effect.activate(self.sample_rate, self.max_frames, on_error);
        }
        self.activated = true;
    }

    pub fn deactivate(&mut self) {
        if !self.activated {
            return;
        }
        for effect in &mut self.effects {
            effect.deactivate();
        }
        self.activated = false;
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Process one block: copy in, dezipper, run the action list, dezipper,
    /// copy out. Writes every output sample.
    pub fn run(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    ) {
        debug_assert!(frames <= self.max_frames);

        for (channel, &id) in self.input_ids.iter().enumerate() {
            let buffer = self.pool.buffer_mut(id);
            match inputs.get(channel) {
                Some(input) => buffer[..frames].copy_from_slice(&input[..frames]),
                None => buffer[..frames].fill(0.0),
            }
        }

        self.input_volume.fill_ramp(&mut self.gain_ramp[..frames]);
        for &id in &self.input_ids {
            let buffer = self.pool.buffer_mut(id);
            for i in 0..frames {
                buffer[i] *= self.gain_ramp[i];
            }
        }

        for action in &self.process_actions {
            let ProcessAction::Process { effect_index } = *action;
            let wiring = &self.wiring[effect_index];
            let (ins, mut outs) = self.pool.io(&wiring.inputs, &wiring.outputs, frames);
            self.effects[effect_index].process(&ins, &mut outs, frames, midi);
        }

        self.output_volume.fill_ramp(&mut self.gain_ramp[..frames]);
        for &id in &self.output_ids {
            let buffer = self.pool.buffer_mut(id);
            for i in 0..frames {
                buffer[i] *= self.gain_ramp[i];
            }
        }

        for (channel, output) in outputs.iter_mut().enumerate() {
            match self.output_ids.get(channel) {
                Some(&id) => output[..frames].copy_from_slice(&self.pool.buffer(id)[..frames]),
                None => output[..frames].fill(0.0),
            }
        }
    }

    pub fn set_input_volume_db(&mut self, db: f32) {
        self.input_volume.set_db(db);
    }

    pub fn set_output_volume_db(&mut self, db: f32) {
        self.output_volume.set_db(db);
    }

    /// Input gain currently applied (for tests and status).
    pub fn input_gain(&self) -> f32 {
        self.input_volume.gain()
    }

    pub fn output_gain(&self) -> f32 {
        self.output_volume.gain()
    }

    /// Find an effect anywhere in the board (splits included).
    pub fn find_effect_mut(&mut self, instance_id: i64) -> Option<&mut EffectNode> {
        self.effects
            .iter_mut()
            .find_map(|node| node.find_mut(instance_id))
    }

    pub fn find_effect(&self, instance_id: i64) -> Option<&EffectNode> {
        self.effects.iter().find_map(|node| node.find(instance_id))
    }

    /// Read a control port value for monitor subscriptions.
    pub fn control_value(&self, instance_id: i64, control_index: u32) -> Option<f32> {
        Some(
            self.find_effect(instance_id)?
                .control(control_index as usize),
        )
    }

    /// Visit every hosted plugin, splits included.
    pub fn for_each_plugin_mut(&mut self, f: &mut dyn FnMut(&mut PluginEffect)) {
        for effect in &mut self.effects {
            effect.for_each_plugin_mut(f);
        }
    }

    pub fn for_each_plugin(&self, f: &mut dyn FnMut(&PluginEffect)) {
        for effect in &self.effects {
            effect.for_each_plugin(f);
        }
    }

    /// Apply a block's MIDI events to the board's resolved bindings.
    ///
    /// Control and bypass changes are applied directly; each change is also
    /// reported through `emit` so the host can mirror it.
    pub fn apply_midi(&mut self, events: &[MidiEvent], emit: &mut dyn FnMut(MappingFire)) {
        for event in events {
            for mapping_index in 0..self.midi_mappings.len() {
                let Some(raw) = self.midi_mappings[mapping_index].binding.raw_value(event) else {
                    continue;
                };
                self.fire_mapping(mapping_index, raw, emit);
            }
        }
    }

    fn fire_mapping(&mut self, mapping_index: usize, raw: u8, emit: &mut dyn FnMut(MappingFire)) {
        let mapping = &mut self.midi_mappings[mapping_index];
        let instance_id = mapping.instance_id;
        let control_index = mapping.control_index;
        let mode = mapping.binding.mode;
        let pressed = raw >= 64;
        let rising = pressed && (!mapping.has_last || mapping.last_raw < 64);
        mapping.last_raw = raw;
        mapping.has_last = true;

        let scaled = mapping.binding.scale(raw);
        let (min, max) = (mapping.binding.min, mapping.binding.max);

        let Some(effect) = self
            .effects
            .iter_mut()
            .find_map(|node| node.find_mut(instance_id))
        else {
            return;
        };

        match control_index {
            Some(index) => {
                let value = match mode {
                    BindingMode::Linear | BindingMode::Circular => scaled,
                    BindingMode::Momentary => {
                        if pressed {
                            max
                        } else {
                            min
                        }
                    }
                    BindingMode::Latched => {
                        if !rising {
                            return;
                        }
                        let current = effect.control(index as usize);
                        if (current - max).abs() < (current - min).abs() {
                            min
                        } else {
                            max
                        }
                    }
                };
                effect.set_control(index as usize, value);
                let applied = effect.control(index as usize);
                emit(MappingFire::Control {
                    instance_id,
                    control_index: index,
                    value: applied,
                });
            }
            None => {
                let enabled = match mode {
                    BindingMode::Momentary => pressed,
                    BindingMode::Latched => {
                        if !rising {
                            return;
                        }
                        effect.bypassed()
                    }
                    BindingMode::Linear | BindingMode::Circular => pressed,
                };
                if effect.bypassed() == !enabled {
                    return;
                }
                effect.set_bypass(!enabled);
                emit(MappingFire::Enabled {
                    instance_id,
                    enabled,
                });
            }
        }
    }

    /// Accumulate VU for every subscribed target over this block.
    ///
    /// Bus pseudo-ids meter the board's own input/output buffers; effect
    /// ids meter that top-level effect's output buffers.
    pub fn accumulate_vu(&mut self, list: &mut VuSubscriptionList, frames: usize) {
        for entry in &mut list.entries {
            let ids: &BufferIds = if entry.instance_id == INPUT_BUS_INSTANCE_ID {
                &self.input_ids
            } else if entry.instance_id == OUTPUT_BUS_INSTANCE_ID {
                &self.output_ids
            } else {
                let Some(index) = self
                    .effects
                    .iter()
                    .position(|e| e.instance_id() == entry.instance_id)
                else {
                    continue;
                };
                &self.wiring[index].outputs
            };
            let channels: InputRefs<'_> = ids
                .iter()
                .map(|&id| &self.pool.buffer(id)[..frames])
                .collect();
            entry.accumulate(&channels, frames);
        }
        list.frames_since_send += frames as u32;
    }
}

/// Non-RT factory for [`RtPedalboard`].
pub struct RtPedalboardBuilder<'a> {
    pub registry: &'a PluginRegistry,
    pub urids: &'a UridMap,
    pub sample_rate: f64,
    pub max_frames: usize,
    pub input_channels: usize,
}

impl RtPedalboardBuilder<'_> {
    /// Build a realtime pedalboard from the editable model.
    ///
    /// An unknown plugin URI refuses the whole build (configuration error);
    /// per-item problems (bad state, unknown control or binding symbol) are
    /// collected and the item runs bypassed or without the binding.
    pub fn build(
        &self,
        model: &Pedalboard,
    ) -> Result<(Box<RtPedalboard>, Vec<BuildError>), PluginError> {
        let mut errors = Vec::new();
        let mut mappings = Vec::new();
        let effects = self.build_items(&model.items, self.input_channels, &mut errors)?;

        // Resolve MIDI bindings now that every node exists.
        collect_bindings(&model.items, &effects, &mut mappings, &mut errors);

        let mut pool = BufferPool::new(self.max_frames);
        let input_ids: BufferIds = (0..self.input_channels.max(1))
            .map(|_| pool.allocate())
            .collect();

        let mut wiring = Vec::with_capacity(effects.len());
        let mut process_actions = Vec::with_capacity(effects.len());
        let mut current = input_ids.clone();
        let mut channels = self.input_channels.max(1);
        for (effect_index, effect) in effects.iter().enumerate() {
            channels = effect.output_channels(channels);
            let outputs: BufferIds = (0..channels.max(1)).map(|_| pool.allocate()).collect();
            wiring.push(EffectWiring {
                inputs: current.clone(),
                outputs: outputs.clone(),
            });
            process_actions.push(ProcessAction::Process { effect_index });
            current = outputs;
        }

        let board = RtPedalboard {
            sample_rate: self.sample_rate,
            max_frames: self.max_frames,
            effects,
            wiring,
            process_actions,
            pool,
            input_ids,
            output_ids: current,
            input_volume: DbDezipper::new(self.sample_rate, model.input_volume_db),
            output_volume: DbDezipper::new(self.sample_rate, model.output_volume_db),
            gain_ramp: vec![0.0; self.max_frames].into_boxed_slice(),
            midi_mappings: mappings,
            activated: false,
        };
        Ok((Box::new(board), errors))
    }

    fn build_items(
        &self,
        items: &[PedalboardItem],
        mut channels: usize,
        errors: &mut Vec<BuildError>,
    ) -> Result<Vec<EffectNode>, PluginError> {
        let mut effects = Vec::with_capacity(items.len());
        for item in items {
            let node = match &item.kind {
                ItemKind::Plugin(config) => {
                    let instance = self.registry.create(&config.uri, self.urids)?;
                    let mut effect = PluginEffect::new(item.instance_id, instance);
                    if let Some(state) = &config.state {
                        if let Err(err) = effect.restore_state(state) {
                            errors.push(BuildError {
                                instance_id: item.instance_id,
                                message: err.to_string(),
                            });
                            effect.set_bypass(true);
                        }
                    }
                    for control in &config.controls {
                        match effect.control_index(&control.symbol) {
                            Some(index) => effect.set_control(index, control.value),
                            None => errors.push(BuildError {
                                instance_id: item.instance_id,
                                message: format!("unknown control symbol '{}'", control.symbol),
                            }),
                        }
                    }
                    if config.bypass {
                        effect.set_bypass(true);
                    }
                    EffectNode::Plugin(effect)
                }
                ItemKind::Split(config) => {
                    let top = self.build_items(&config.top, channels, errors)?;
                    let bottom = self.build_items(&config.bottom, channels, errors)?;
                    let mut split = SplitEffect::new(
                        item.instance_id,
                        config.split_type,
                        config.mix,
                        top,
                        bottom,
                        channels.max(1),
                        self.max_frames,
                    );
                    split.set_bypass(config.bypass);
                    EffectNode::Split(split)
                }
            };
            channels = node.output_channels(channels);
            effects.push(node);
        }
        Ok(effects)
    }
}

/// Walk the model and resolve each item's bindings against the built nodes.
fn collect_bindings(
    items: &[PedalboardItem],
    effects: &[EffectNode],
    mappings: &mut Vec<RtMidiMapping>,
    errors: &mut Vec<BuildError>,
) {
    fn find_node(effects: &[EffectNode], instance_id: i64) -> Option<&EffectNode> {
        effects.iter().find_map(|node| node.find(instance_id))
    }

    fn walk(
        items: &[PedalboardItem],
        effects: &[EffectNode],
        mappings: &mut Vec<RtMidiMapping>,
        errors: &mut Vec<BuildError>,
    ) {
        for item in items {
            match &item.kind {
                ItemKind::Plugin(config) => {
                    for binding in &config.midi_bindings {
                        let control_index = match &binding.target {
                            BindingTarget::Bypass => None,
                            BindingTarget::Control { symbol } => {
                                match find_node(effects, item.instance_id)
                                    .and_then(|node| node.control_index(symbol))
                                {
                                    Some(index) => Some(index as u32),
                                    None => {
                                        errors.push(BuildError {
                                            instance_id: item.instance_id,
                                            message: format!(
                                                "midi binding targets unknown control '{symbol}'"
                                            ),
                                        });
                                        continue;
                                    }
                                }
                            }
                        };
                        mappings.push(RtMidiMapping {
                            binding: binding.clone(),
                            instance_id: item.instance_id,
                            control_index,
                            last_raw: 0,
                            has_last: false,
                        });
                    }
                }
                ItemKind::Split(split) => {
                    walk(&split.top, effects, mappings, errors);
                    walk(&split.bottom, effects, mappings, errors);
                }
            }
        }
    }

    walk(items, effects, mappings, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedalera_core::builtin::{GAIN_URI, TONE_URI};
    use pedalera_core::{ControlValue, PluginConfig, SplitConfig, SplitType};
    use pedalera_midi::MidiSource;

    fn builder<'a>(
        registry: &'a PluginRegistry,
        urids: &'a UridMap,
    ) -> RtPedalboardBuilder<'a> {
        RtPedalboardBuilder {
            registry,
            urids,
            sample_rate: 48000.0,
            max_frames: 64,
            input_channels: 2,
        }
    }

    fn gain_board(gain: f32) -> Pedalboard {
        let mut board = Pedalboard::new("g");
        let id = board.push_plugin(GAIN_URI);
        board.set_control(id, "gain", gain);
        board
    }

    fn run_block(board: &mut RtPedalboard, input: &[f32]) -> Vec<f32> {
        let mut left = vec![0.0f32; input.len()];
        let mut right = vec![0.0f32; input.len()];
        let inputs = [input, input];
        let mut outputs = [left.as_mut_slice(), right.as_mut_slice()];
        board.run(&inputs, &mut outputs, input.len(), &[]);
        left
    }

    #[test]
    fn build_and_run_single_gain() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let (mut board, errors) = builder(&registry, &urids).build(&gain_board(0.5)).unwrap();
        assert!(errors.is_empty());
        board.activate(&mut |_, _| panic!("no activation errors expected"));

        let out = run_block(&mut board, &[1.0, 0.5, -1.0, 0.0]);
        assert_eq!(out, vec![0.5, 0.25, -0.5, 0.0]);
    }

    #[test]
    fn unknown_uri_refuses_build() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let mut model = Pedalboard::new("bad");
        model.push_plugin("urn:no:such:plugin");
        let err = builder(&registry, &urids).build(&model).unwrap_err();
        assert!(matches!(err, PluginError::UnknownPlugin(_)));
    }

    #[test]
    fn unknown_control_symbol_is_soft_error() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let mut model = Pedalboard::new("odd");
        let id = model.push_plugin(GAIN_URI);
        model.set_control(id, "galaxy", 0.7);
        let (_, errors) = builder(&registry, &urids).build(&model).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("galaxy"));
    }

    #[test]
    fn empty_board_passes_audio_through() {
        let mut board = RtPedalboard::empty(48000.0, 64, 2, 2);
        board.activate(&mut |_, _| {});
        let out = run_block(&mut board, &[0.25, -0.75]);
        assert_eq!(out, vec![0.25, -0.75]);
    }

    #[test]
    fn chain_with_split_builds_and_runs() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let mut model = Pedalboard::new("split");
        model.push_plugin(GAIN_URI);
        model.push_split(SplitConfig {
            split_type: SplitType::Mix,
            mix: -1.0, // all top
            bypass: false,
            top: vec![PedalboardItem {
                instance_id: 50,
                kind: ItemKind::Plugin(PluginConfig {
                    uri: GAIN_URI.into(),
                    controls: vec![ControlValue::new("gain", 2.0)],
                    bypass: false,
                    state: None,
                    state_update_count: 0,
                    midi_bindings: Vec::new(),
                }),
            }],
            bottom: Vec::new(),
        });

        let (mut board, errors) = builder(&registry, &urids).build(&model).unwrap();
        assert!(errors.is_empty());
        board.activate(&mut |_, _| panic!("unexpected error"));

        let out = run_block(&mut board, &[0.25]);
        assert_eq!(out, vec![0.5]);

        // Nested effects are addressable by instance id.
        assert!(board.find_effect(50).is_some());
        assert!(board.control_value(50, 0).is_some());
    }

    #[test]
    fn dezipper_ramps_input_volume() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let (mut board, _) = builder(&registry, &urids).build(&gain_board(1.0)).unwrap();
        board.activate(&mut |_, _| {});

        board.set_input_volume_db(-120.0);
        // After enough blocks the gain settles near zero, monotonically.
        let mut last = f32::MAX;
        for _ in 0..20 {
            run_block(&mut board, &[1.0f32; 64]);
            let gain = board.input_gain();
            assert!(gain <= last + 1e-6);
            last = gain;
        }
        assert!(board.input_gain() < 1e-3);
    }

    #[test]
    fn midi_binding_drives_control_and_reports() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let mut model = Pedalboard::new("midi");
        let id = model.push_plugin(GAIN_URI);
        if let ItemKind::Plugin(config) = &mut model.find_item_mut(id).unwrap().kind {
            config.midi_bindings.push(MidiBinding {
                channel: None,
                source: MidiSource::ControlChange { cc: 7 },
                mode: BindingMode::Linear,
                target: BindingTarget::Control {
                    symbol: "gain".into(),
                },
                min: 0.0,
                max: 2.0,
            });
        }

        let (mut board, errors) = builder(&registry, &urids).build(&model).unwrap();
        assert!(errors.is_empty());
        board.activate(&mut |_, _| {});

        let mut fires = Vec::new();
        board.apply_midi(&[MidiEvent::new(0, &[0xB0, 7, 127])], &mut |fire| {
            fires.push(fire)
        });
        assert_eq!(fires.len(), 1);
        let MappingFire::Control { value, .. } = &fires[0] else {
            panic!("expected control fire");
        };
        assert!((value - 2.0).abs() < 1e-6);
        assert_eq!(board.control_value(id, 0), Some(2.0));
    }

    #[test]
    fn latched_bypass_binding_toggles() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let mut model = Pedalboard::new("latch");
        let id = model.push_plugin(TONE_URI);
        if let ItemKind::Plugin(config) = &mut model.find_item_mut(id).unwrap().kind {
            config.midi_bindings.push(MidiBinding {
                channel: None,
                source: MidiSource::Note { note: 60 },
                mode: BindingMode::Latched,
                target: BindingTarget::Bypass,
                min: 0.0,
                max: 1.0,
            });
        }

        let (mut board, _) = builder(&registry, &urids).build(&model).unwrap();
        board.activate(&mut |_, _| {});

        let press = [MidiEvent::new(0, &[0x90, 60, 100])];
        let release = [MidiEvent::new(0, &[0x80, 60, 0])];

        let mut fires = 0;
        board.apply_midi(&press, &mut |_| fires += 1);
        assert!(board.find_effect(id).unwrap().bypassed());
        board.apply_midi(&release, &mut |_| fires += 1);
        board.apply_midi(&press, &mut |_| fires += 1);
        assert!(!board.find_effect(id).unwrap().bypassed());
        assert_eq!(fires, 2);
    }

    #[test]
    fn vu_accumulates_for_buses_and_effects() {
        let registry = PluginRegistry::with_builtins();
        let urids = UridMap::new();
        let model = gain_board(0.5);
        let effect_id = model.items[0].instance_id;
        let (mut board, _) = builder(&registry, &urids).build(&model).unwrap();
        board.activate(&mut |_, _| {});

        let mut list = VuSubscriptionList::new(
            [INPUT_BUS_INSTANCE_ID, OUTPUT_BUS_INSTANCE_ID, effect_id],
            1024,
        );
        run_block(&mut board, &[1.0f32; 64]);
        board.accumulate_vu(&mut list, 64);

        let input_vu = list.entries[0].take_update();
        let output_vu = list.entries[1].take_update();
        let effect_vu = list.entries[2].take_update();
        assert!((input_vu.peak_left - 1.0).abs() < 1e-6);
        assert!((output_vu.peak_left - 0.5).abs() < 1e-6);
        assert!((effect_vu.peak_left - 0.5).abs() < 1e-6);
        assert_eq!(list.frames_since_send, 64);
    }
}
