//! Built-in utility plugins.
//!
//! Two small plugins ship with the engine so a pedalboard works out of the
//! box and the whole hosting surface (controls, monitor outputs, patch
//! properties, state) is exercised without an external plugin provider:
//!
//! - [`GainPlugin`] (`urn:pedalera:gain`) - linear gain with an `out_level`
//!   monitor output and a `label` patch property
//! - [`TonePlugin`] (`urn:pedalera:tone`) - one-pole lowpass tone control

use libm::expf;

use crate::atom::{AtomKind, AtomQueue, Urid, UridMap, ATOM_PAYLOAD_CAPACITY};
use crate::plugin::{
    ControlPortInfo, PluginContext, PluginDescriptor, PluginError, PluginInstance, PluginRegistry,
};

/// URI of the built-in gain plugin.
pub const GAIN_URI: &str = "urn:pedalera:gain";
/// URI of the gain plugin's `label` patch property.
pub const GAIN_LABEL_PROPERTY: &str = "urn:pedalera:gain#label";
/// URI of the built-in tone plugin.
pub const TONE_URI: &str = "urn:pedalera:tone";

/// Register the built-in plugins into `registry`.
pub fn register(registry: &mut PluginRegistry) {
    registry.register(GAIN_DESCRIPTOR.clone(), |urids| {
        Box::new(GainPlugin::new(urids))
    });
    registry.register(TONE_DESCRIPTOR.clone(), |_| Box::new(TonePlugin::new()));
}

/// Release coefficient target: the level meter falls ~60 dB in 300 ms.
const LEVEL_RELEASE_SECONDS: f32 = 0.300 / 6.9;

static GAIN_CONTROLS: [ControlPortInfo; 2] = [
    ControlPortInfo::input("gain", "Gain", 0.0, 2.0, 1.0),
    ControlPortInfo::output("out_level", "Output Level", 0.0, 2.0),
];

/// Linear gain stage with an output level meter and a `label` property.
pub struct GainPlugin {
    gain: f32,
    level: f32,
    release: f32,
    label_urid: Urid,
    label: [u8; 64],
    label_len: usize,
}

static GAIN_DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    uri: GAIN_URI,
    name: "Gain",
    audio_inputs: 2,
    audio_outputs: 2,
    wants_midi: false,
    controls: &GAIN_CONTROLS,
};

impl GainPlugin {
    pub fn new(urids: &UridMap) -> Self {
        let mut plugin = Self {
            gain: 1.0,
            level: 0.0,
            release: 0.0,
            label_urid: urids.map(GAIN_LABEL_PROPERTY),
            label: [0; 64],
            label_len: 0,
        };
        plugin.set_label(b"\"\"");
        plugin
    }

    fn set_label(&mut self, payload: &[u8]) {
        let len = payload.len().min(self.label.len());
        self.label[..len].copy_from_slice(&payload[..len]);
        self.label_len = len;
    }

    fn label_payload(&self) -> &[u8] {
        &self.label[..self.label_len]
    }

    fn answer_patches(&mut self, atom_in: &AtomQueue, atom_out: &mut AtomQueue) {
        for i in 0..atom_in.len() {
            let entry = atom_in.entries()[i];
            if entry.property != self.label_urid {
                continue;
            }
            match entry.kind {
                AtomKind::PatchSet => {
                    let payload = atom_in.payload(&entry);
                    self.set_label(payload);
                    // Echo the accepted value so listeners converge.
                    atom_out.push_set(entry.frame, self.label_urid, self.label_payload());
                }
                AtomKind::PatchGet => {
                    atom_out.push_set(entry.frame, self.label_urid, self.label_payload());
                }
            }
        }
    }
}

impl PluginInstance for GainPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &GAIN_DESCRIPTOR
    }

    fn activate(&mut self, sample_rate: f64, _max_frames: usize) -> Result<(), PluginError> {
        self.release = expf(-1.0 / (LEVEL_RELEASE_SECONDS * sample_rate as f32));
        self.level = 0.0;
        Ok(())
    }

    fn deactivate(&mut self) {
        self.level = 0.0;
    }

    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        ctx: &mut PluginContext<'_>,
    ) {
        self.answer_patches(ctx.atom_in, ctx.atom_out);

        let mut level = self.level;
        let release = self.release;
        for (channel, output) in outputs.iter_mut().enumerate() {
            let Some(input) = inputs.get(channel) else {
                output[..frames].fill(0.0);
                continue;
            };
            for i in 0..frames {
                let sample = input[i] * self.gain;
                output[i] = sample;
                let magnitude = sample.abs();
                level = if magnitude > level {
                    magnitude
                } else {
                    level * release
                };
            }
        }
        self.level = level;
    }

    fn set_control(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.gain = value;
        }
    }

    fn control(&self, index: usize) -> f32 {
        match index {
            0 => self.gain,
            1 => self.level,
            _ => 0.0,
        }
    }

    fn save_state(&self) -> Option<Vec<u8>> {
        Some(self.label_payload().to_vec())
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), PluginError> {
        if bytes.len() > ATOM_PAYLOAD_CAPACITY {
            return Err(PluginError::StateRestoreFailed(
                "label state too large".into(),
            ));
        }
        self.set_label(bytes);
        Ok(())
    }
}

static TONE_CONTROLS: [ControlPortInfo; 1] =
    [ControlPortInfo::input("cutoff", "Cutoff", 100.0, 8000.0, 2000.0)];

/// One-pole lowpass tone control.
///
/// `y[n] = x[n] + coeff * (y[n-1] - x[n])` with
/// `coeff = exp(-2π * cutoff / sample_rate)` - 6 dB/octave, zero latency.
pub struct TonePlugin {
    cutoff: f32,
    coeff: f32,
    sample_rate: f32,
    state: [f32; 2],
}

static TONE_DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    uri: TONE_URI,
    name: "Tone",
    audio_inputs: 2,
    audio_outputs: 2,
    wants_midi: false,
    controls: &TONE_CONTROLS,
};

impl TonePlugin {
    pub fn new() -> Self {
        Self {
            cutoff: 2000.0,
            coeff: 0.0,
            sample_rate: 48000.0,
            state: [0.0; 2],
        }
    }

    fn recalculate_coeff(&mut self) {
        self.coeff = expf(-core::f32::consts::TAU * self.cutoff / self.sample_rate);
    }
}

impl Default for TonePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginInstance for TonePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &TONE_DESCRIPTOR
    }

    fn activate(&mut self, sample_rate: f64, _max_frames: usize) -> Result<(), PluginError> {
        self.sample_rate = sample_rate as f32;
        self.recalculate_coeff();
        self.state = [0.0; 2];
        Ok(())
    }

    fn deactivate(&mut self) {
        self.state = [0.0; 2];
    }

    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        _ctx: &mut PluginContext<'_>,
    ) {
        let coeff = self.coeff;
        for (channel, output) in outputs.iter_mut().enumerate() {
            let Some(input) = inputs.get(channel) else {
                output[..frames].fill(0.0);
                continue;
            };
            let mut state = self.state[channel.min(1)];
            for i in 0..frames {
                let x = input[i];
                state = x + coeff * (state - x);
                output[i] = state;
            }
            self.state[channel.min(1)] = state;
        }
    }

    fn set_control(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.cutoff = value;
            self.recalculate_coeff();
        }
    }

    fn control(&self, index: usize) -> f32 {
        if index == 0 {
            self.cutoff
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::json_to_payload;

    fn run_gain(gain: f32, input: &[f32]) -> Vec<f32> {
        let urids = UridMap::new();
        let mut plugin = GainPlugin::new(&urids);
        plugin.activate(48000.0, input.len()).unwrap();
        plugin.set_control(0, gain);

        let mut out = vec![0.0f32; input.len()];
        let atom_in = AtomQueue::with_default_capacity();
        let mut atom_out = AtomQueue::with_default_capacity();
        let mut ctx = PluginContext {
            midi: &[],
            atom_in: &atom_in,
            atom_out: &mut atom_out,
        };
        let inputs = [input];
        let mut outputs_storage = [out.as_mut_slice()];
        plugin.process(&inputs, &mut outputs_storage, input.len(), &mut ctx);
        out
    }

    #[test]
    fn gain_scales_input() {
        let out = run_gain(0.5, &[1.0, -1.0, 0.5, 0.0]);
        assert_eq!(out, vec![0.5, -0.5, 0.25, 0.0]);
    }

    #[test]
    fn gain_level_meter_follows_peak() {
        let urids = UridMap::new();
        let mut plugin = GainPlugin::new(&urids);
        plugin.activate(48000.0, 64).unwrap();

        let input = vec![0.8f32; 64];
        let mut out = vec![0.0f32; 64];
        let atom_in = AtomQueue::with_default_capacity();
        let mut atom_out = AtomQueue::with_default_capacity();
        let mut ctx = PluginContext {
            midi: &[],
            atom_in: &atom_in,
            atom_out: &mut atom_out,
        };
        let inputs = [input.as_slice()];
        let mut outputs = [out.as_mut_slice()];
        plugin.process(&inputs, &mut outputs, 64, &mut ctx);
        assert!((plugin.control(1) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn gain_answers_patch_get_with_label() {
        let urids = UridMap::new();
        let mut plugin = GainPlugin::new(&urids);
        plugin.activate(48000.0, 16).unwrap();
        let label_urid = urids.map(GAIN_LABEL_PROPERTY);

        let payload = json_to_payload(&serde_json::json!("crunch"));
        let mut atom_in = AtomQueue::with_default_capacity();
        atom_in.push_set(0, label_urid, &payload);
        atom_in.push_get(0, label_urid);

        let mut atom_out = AtomQueue::with_default_capacity();
        let input = [0.0f32; 16];
        let mut out = [0.0f32; 16];
        let mut ctx = PluginContext {
            midi: &[],
            atom_in: &atom_in,
            atom_out: &mut atom_out,
        };
        let inputs = [&input[..]];
        let mut outputs = [&mut out[..]];
        plugin.process(&inputs, &mut outputs, 16, &mut ctx);

        // One echo for the set, one reply for the get.
        assert_eq!(atom_out.len(), 2);
        let reply = atom_out.entries()[1];
        assert_eq!(reply.property, label_urid);
        assert_eq!(atom_out.payload(&reply), payload.as_slice());
    }

    #[test]
    fn gain_state_round_trip() {
        let urids = UridMap::new();
        let mut plugin = GainPlugin::new(&urids);
        plugin.restore_state(b"\"lead boost\"").unwrap();
        assert_eq!(plugin.save_state().unwrap(), b"\"lead boost\"".to_vec());
    }

    #[test]
    fn tone_attenuates_high_frequencies() {
        let mut plugin = TonePlugin::new();
        plugin.activate(48000.0, 256).unwrap();
        plugin.set_control(0, 500.0);

        // Alternating +1/-1 is the highest representable frequency.
        let input: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let mut out = vec![0.0f32; 256];
        let atom_in = AtomQueue::with_default_capacity();
        let mut atom_out = AtomQueue::with_default_capacity();
        let mut ctx = PluginContext {
            midi: &[],
            atom_in: &atom_in,
            atom_out: &mut atom_out,
        };
        let inputs = [input.as_slice()];
        let mut outputs = [out.as_mut_slice()];
        plugin.process(&inputs, &mut outputs, 256, &mut ctx);

        let peak = out[128..].iter().fold(0.0f32, |a, &s| a.max(s.abs()));
        assert!(peak < 0.1, "nyquist peak after lowpass: {peak}");
    }

    #[test]
    fn tone_passes_dc() {
        let mut plugin = TonePlugin::new();
        plugin.activate(48000.0, 1024).unwrap();
        plugin.set_control(0, 2000.0);

        let input = vec![0.5f32; 1024];
        let mut out = vec![0.0f32; 1024];
        let atom_in = AtomQueue::with_default_capacity();
        let mut atom_out = AtomQueue::with_default_capacity();
        let mut ctx = PluginContext {
            midi: &[],
            atom_in: &atom_in,
            atom_out: &mut atom_out,
        };
        let inputs = [input.as_slice()];
        let mut outputs = [out.as_mut_slice()];
        plugin.process(&inputs, &mut outputs, 1024, &mut ctx);
        assert!((out[1023] - 0.5).abs() < 1e-3);
    }
}
