//! The editable, serializable pedalboard model.
//!
//! This is the control plane's view of a pedalboard: an ordered list of
//! items (plugins and splits), control values, bypass flags, opaque state
//! blobs, MIDI bindings, and the input/output volume settings. It is plain
//! serde data - presets round-trip through TOML - and it is what the
//! realtime pedalboard is built from.
//!
//! Invariants the builder relies on:
//! - every `instance_id` in a pedalboard is unique (splits included)
//! - `state_update_count` only increases, tracking state captured from a
//!   running instance

use serde::{Deserialize, Serialize};

use pedalera_midi::MidiBinding;

use crate::split::SplitType;

/// A named, ordered pedalboard with gain stages at both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pedalboard {
    pub name: String,
    #[serde(default)]
    pub input_volume_db: f32,
    #[serde(default)]
    pub output_volume_db: f32,
    #[serde(default)]
    pub items: Vec<PedalboardItem>,
}

/// One slot in a pedalboard: a hosted plugin or a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedalboardItem {
    pub instance_id: i64,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Plugin(PluginConfig),
    Split(SplitConfig),
}

/// A plugin slot's persisted configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin identity; must be known to the registry at build time.
    pub uri: String,
    #[serde(default)]
    pub controls: Vec<ControlValue>,
    #[serde(default)]
    pub bypass: bool,
    /// Opaque plugin state captured from a running instance.
    #[serde(
        default,
        with = "state_blob",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<Vec<u8>>,
    /// Monotonic counter of state captures; never decreases.
    #[serde(default)]
    pub state_update_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub midi_bindings: Vec<MidiBinding>,
}

/// A split slot's persisted configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub split_type: SplitType,
    #[serde(default)]
    pub mix: f32,
    #[serde(default)]
    pub bypass: bool,
    #[serde(default)]
    pub top: Vec<PedalboardItem>,
    #[serde(default)]
    pub bottom: Vec<PedalboardItem>,
}

/// A symbol/value pair for one control port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlValue {
    pub symbol: String,
    pub value: f32,
}

impl ControlValue {
    pub fn new(symbol: impl Into<String>, value: f32) -> Self {
        Self {
            symbol: symbol.into(),
            value,
        }
    }
}

impl Pedalboard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_volume_db: 0.0,
            output_volume_db: 0.0,
            items: Vec::new(),
        }
    }

    /// Append a plugin item with default controls; returns its instance id.
    pub fn push_plugin(&mut self, uri: impl Into<String>) -> i64 {
        let instance_id = self.next_instance_id();
        self.items.push(PedalboardItem {
            instance_id,
            kind: ItemKind::Plugin(PluginConfig {
                uri: uri.into(),
                controls: Vec::new(),
                bypass: false,
                state: None,
                state_update_count: 0,
                midi_bindings: Vec::new(),
            }),
        });
        instance_id
    }

    /// Append a split item; returns its instance id.
    pub fn push_split(&mut self, config: SplitConfig) -> i64 {
        let instance_id = self.next_instance_id();
        self.items.push(PedalboardItem {
            instance_id,
            kind: ItemKind::Split(config),
        });
        instance_id
    }

    /// The smallest id strictly greater than every id in the board.
    pub fn next_instance_id(&self) -> i64 {
        let mut max = 0;
        self.for_each_item(&mut |item| max = max.max(item.instance_id));
        max + 1
    }

    /// Visit every item, including those nested inside splits.
    pub fn for_each_item(&self, f: &mut dyn FnMut(&PedalboardItem)) {
        fn walk(items: &[PedalboardItem], f: &mut dyn FnMut(&PedalboardItem)) {
            for item in items {
                f(item);
                if let ItemKind::Split(split) = &item.kind {
                    walk(&split.top, f);
                    walk(&split.bottom, f);
                }
            }
        }
        walk(&self.items, f)
    }

    /// Find an item anywhere in the board.
    pub fn find_item(&self, instance_id: i64) -> Option<&PedalboardItem> {
        fn walk(items: &[PedalboardItem], instance_id: i64) -> Option<&PedalboardItem> {
            for item in items {
                if item.instance_id == instance_id {
                    return Some(item);
                }
                if let ItemKind::Split(split) = &item.kind {
                    if let Some(found) =
                        walk(&split.top, instance_id).or_else(|| walk(&split.bottom, instance_id))
                    {
                        return Some(found);
                    }
                }
            }
            None
        }
        walk(&self.items, instance_id)
    }

    pub fn find_item_mut(&mut self, instance_id: i64) -> Option<&mut PedalboardItem> {
        fn walk(items: &mut [PedalboardItem], instance_id: i64) -> Option<&mut PedalboardItem> {
            for item in items {
                if item.instance_id == instance_id {
                    return Some(item);
                }
                if let ItemKind::Split(split) = &mut item.kind {
                    if let Some(found) = walk(&mut split.top, instance_id) {
                        return Some(found);
                    }
                    if let Some(found) = walk(&mut split.bottom, instance_id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        walk(&mut self.items, instance_id)
    }

    /// Record a control write in the model. Returns false for unknown items.
    pub fn set_control(&mut self, instance_id: i64, symbol: &str, value: f32) -> bool {
        let Some(item) = self.find_item_mut(instance_id) else {
            return false;
        };
        match &mut item.kind {
            ItemKind::Plugin(plugin) => {
                match plugin.controls.iter_mut().find(|c| c.symbol == symbol) {
                    Some(control) => control.value = value,
                    None => plugin.controls.push(ControlValue::new(symbol, value)),
                }
                true
            }
            ItemKind::Split(split) => {
                if symbol == "mix" {
                    split.mix = value;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a bypass change. Returns false for unknown items.
    pub fn set_bypass(&mut self, instance_id: i64, bypass: bool) -> bool {
        let Some(item) = self.find_item_mut(instance_id) else {
            return false;
        };
        match &mut item.kind {
            ItemKind::Plugin(plugin) => plugin.bypass = bypass,
            ItemKind::Split(split) => split.bypass = bypass,
        }
        true
    }

    /// Store state captured from a running instance.
    ///
    /// The update is ignored unless `state_update_count` advances, keeping
    /// the persisted counter monotonic.
    pub fn apply_captured_state(
        &mut self,
        instance_id: i64,
        state: Vec<u8>,
        state_update_count: u64,
    ) -> bool {
        let Some(item) = self.find_item_mut(instance_id) else {
            return false;
        };
        if let ItemKind::Plugin(plugin) = &mut item.kind {
            if state_update_count > plugin.state_update_count {
                plugin.state = Some(state);
                plugin.state_update_count = state_update_count;
                return true;
            }
        }
        false
    }
}

/// Base64 (de)serialization for optional state blobs, so binary state fits
/// in TOML presets.
mod state_blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{GAIN_URI, TONE_URI};

    fn board_with_split() -> Pedalboard {
        let mut board = Pedalboard::new("test");
        board.push_plugin(GAIN_URI);
        board.push_split(SplitConfig {
            split_type: SplitType::Mix,
            mix: 0.0,
            bypass: false,
            top: vec![PedalboardItem {
                instance_id: 100,
                kind: ItemKind::Plugin(PluginConfig {
                    uri: TONE_URI.into(),
                    controls: vec![ControlValue::new("cutoff", 1500.0)],
                    bypass: false,
                    state: None,
                    state_update_count: 0,
                    midi_bindings: Vec::new(),
                }),
            }],
            bottom: Vec::new(),
        });
        board
    }

    #[test]
    fn instance_ids_allocate_past_nested_items() {
        let board = board_with_split();
        assert_eq!(board.next_instance_id(), 101);
    }

    #[test]
    fn find_reaches_into_splits() {
        let board = board_with_split();
        assert!(board.find_item(100).is_some());
        assert!(board.find_item(999).is_none());
    }

    #[test]
    fn set_control_updates_or_inserts() {
        let mut board = board_with_split();
        assert!(board.set_control(1, "gain", 0.5));
        assert!(board.set_control(1, "gain", 0.75));
        let item = board.find_item(1).unwrap();
        let ItemKind::Plugin(plugin) = &item.kind else {
            panic!("expected plugin");
        };
        assert_eq!(plugin.controls.len(), 1);
        assert_eq!(plugin.controls[0].value, 0.75);

        // Split mix goes through the same surface.
        assert!(board.set_control(2, "mix", -0.5));
        assert!(!board.set_control(2, "gain", 1.0));
    }

    #[test]
    fn captured_state_is_monotonic() {
        let mut board = board_with_split();
        assert!(board.apply_captured_state(1, b"one".to_vec(), 3));
        assert!(!board.apply_captured_state(1, b"stale".to_vec(), 2));
        assert!(!board.apply_captured_state(1, b"same".to_vec(), 3));
        assert!(board.apply_captured_state(1, b"two".to_vec(), 4));

        let item = board.find_item(1).unwrap();
        let ItemKind::Plugin(plugin) = &item.kind else {
            panic!("expected plugin");
        };
        assert_eq!(plugin.state.as_deref(), Some(b"two".as_slice()));
        assert_eq!(plugin.state_update_count, 4);
    }

    #[test]
    fn serde_round_trip_with_state_blob() {
        let mut board = board_with_split();
        board.apply_captured_state(1, vec![0, 1, 2, 250, 255], 1);

        let json = serde_json::to_string(&board).unwrap();
        let back: Pedalboard = serde_json::from_str(&json).unwrap();
        assert_eq!(board, back);
        // The blob travels as base64 text, not a byte array.
        assert!(json.contains("AAEC+v8="));
    }
}
