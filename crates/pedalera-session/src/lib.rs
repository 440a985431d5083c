//! Pedalera Session - the host side of the engine.
//!
//! [`AudioSession`] owns everything north of the RT boundary: it opens the
//! device and starts the audio driver, swaps pedalboards atomically between
//! blocks, owns the non-RT ends of both ring buffers, tracks outstanding
//! patch requests, and fans realtime notifications out to subscribers on a
//! dedicated pump thread.
//!
//! Presets round-trip through TOML via [`preset`]; server configuration
//! types live in [`config`].

pub mod config;
pub mod preset;
mod requests;
mod session;
mod subscriptions;

pub use config::{ChannelSelection, ServerConfiguration, ServerSettings};
pub use preset::{load_preset, save_preset, PresetError};
pub use session::{
    AtomCallback, AudioSession, EngineEvent, EventCallback, MidiCallback, MonitorCallback,
    MonitorHandle, VuCallback, VuHandle,
};

use pedalera_core::PluginError;
use pedalera_io::IoError;

/// Classified session-level failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Bad settings or a pedalboard that cannot be built.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Device(#[from] IoError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// The control queue or request table is full; retry later.
    #[error("engine overloaded")]
    Overloaded,

    /// The request's deadline elapsed without a reply.
    #[error("request timed out")]
    Timeout,

    /// A newer pedalboard superseded the one this request targeted.
    #[error("request superseded by a pedalboard change")]
    Superseded,

    /// The issuing client disconnected.
    #[error("client disconnected")]
    ClientGone,

    /// The session is closing or closed.
    #[error("session closed")]
    Closed,

    #[error("unknown instance id {0}")]
    UnknownInstance(i64),

    #[error("unknown control '{symbol}' on instance {instance_id}")]
    UnknownControl { instance_id: i64, symbol: String },

    /// A patch value exceeded the transferable size.
    #[error("patch value too large")]
    ValueTooLarge,
}

pub type Result<T> = std::result::Result<T, SessionError>;
