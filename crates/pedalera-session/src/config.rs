//! Server settings and the negotiated configuration surface.

use serde::{Deserialize, Serialize};

/// What the operator asks the audio server to run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// PCM device name (driver-specific, e.g. `hw:0`).
    pub device_name: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Period size in frames.
    #[serde(default = "default_period_frames")]
    pub period_frames: usize,
    /// Periods in the device buffer.
    #[serde(default = "default_period_count")]
    pub period_count: usize,
    /// Fall back to the silent dummy device when the real one fails.
    #[serde(default = "default_true")]
    pub fallback_to_dummy: bool,
}

fn default_sample_rate() -> u32 {
    48000
}
fn default_period_frames() -> usize {
    64
}
fn default_period_count() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            device_name: "default".into(),
            sample_rate: default_sample_rate(),
            period_frames: default_period_frames(),
            period_count: default_period_count(),
            fallback_to_dummy: true,
        }
    }
}

impl ServerSettings {
    /// Reject obviously unusable settings before touching the device.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample rate must be positive".into());
        }
        if self.period_frames == 0 || self.period_frames > 8192 {
            return Err(format!(
                "period size {} out of range (1..=8192)",
                self.period_frames
            ));
        }
        if self.period_count < 2 {
            return Err("at least two periods are required".into());
        }
        Ok(())
    }
}

/// Which device channels and MIDI inputs the session uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSelection {
    /// Capture channels feeding the chain, in chain order.
    pub input_channels: Vec<usize>,
    /// Playback channels receiving the chain output, in chain order.
    pub output_channels: Vec<usize>,
    /// Raw MIDI input device names to open.
    #[serde(default)]
    pub midi_inputs: Vec<String>,
}

impl Default for ChannelSelection {
    fn default() -> Self {
        Self {
            input_channels: vec![0, 1],
            output_channels: vec![0, 1],
            midi_inputs: Vec::new(),
        }
    }
}

/// What the session actually runs with, surfaced to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfiguration {
    /// Human-readable device/format summary.
    pub description: String,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub period_count: usize,
    pub input_channels: Vec<usize>,
    pub output_channels: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_validation() {
        assert!(ServerSettings::default().validate().is_ok());

        let mut bad = ServerSettings::default();
        bad.sample_rate = 0;
        assert!(bad.validate().is_err());

        let mut bad = ServerSettings::default();
        bad.period_frames = 0;
        assert!(bad.validate().is_err());

        let mut bad = ServerSettings::default();
        bad.period_count = 1;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn settings_serde_defaults() {
        let settings: ServerSettings =
            toml::from_str("device_name = \"hw:1\"").unwrap();
        assert_eq!(settings.device_name, "hw:1");
        assert_eq!(settings.sample_rate, 48000);
        assert_eq!(settings.period_frames, 64);
        assert!(settings.fallback_to_dummy);
    }
}
