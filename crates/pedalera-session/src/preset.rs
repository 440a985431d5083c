//! Pedalboard preset files.
//!
//! Presets are TOML documents carrying the whole editable pedalboard:
//! items with control values, bypass flags, split sub-chains, MIDI bindings,
//! and base64 state blobs. A preset is just the serialized
//! [`Pedalboard`] model, so anything the engine can run round-trips.

use std::path::{Path, PathBuf};

use thiserror::Error;

use pedalera_core::Pedalboard;

/// Errors from preset file handling.
#[derive(Debug, Error)]
pub enum PresetError {
    #[error("failed to read preset '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write preset '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse preset: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize preset: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Load a pedalboard preset from a TOML file.
pub fn load_preset(path: impl AsRef<Path>) -> Result<Pedalboard, PresetError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| PresetError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// Save a pedalboard preset to a TOML file.
pub fn save_preset(path: impl AsRef<Path>, pedalboard: &Pedalboard) -> Result<(), PresetError> {
    let path = path.as_ref();
    let text = toml::to_string_pretty(pedalboard)?;
    std::fs::write(path, text).map_err(|source| PresetError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}
