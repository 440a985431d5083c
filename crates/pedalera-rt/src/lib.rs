//! Pedalera RT - the realtime side of the engine and its lock-free boundary.
//!
//! This crate provides:
//! - [`ring`] - the SPSC framed byte ring both boundary queues run on
//! - [`messages`] - typed envelopes: [`CommandWriter`] (host → RT),
//!   [`NotificationWriter`] (RT → host), and the borrow-decoding [`ToRt`] /
//!   [`FromRt`] enums
//! - [`RtPedalboard`] and its non-RT [`RtPedalboardBuilder`]
//! - [`RtProcessor`] - the per-block command processor the audio driver
//!   invokes
//!
//! The ownership rule throughout: anything the audio thread holds was built
//! and allocated on the non-realtime side, arrives by pointer handover, and
//! leaves through a typed `release` notification. The audio thread neither
//! allocates nor frees.

pub mod messages;
pub mod pedalboard;
pub mod processor;
pub mod ring;
pub mod vu;

pub use messages::{
    drain_from_rt, drain_to_rt, AtomBlob, CommandWriter, FromRt, NotificationWriter,
    PatchPayload, SystemBindingList, SystemMidiEvent, ToRt, ATOM_INLINE_BYTES,
};
pub use pedalboard::{BuildError, MappingFire, RtPedalboard, RtPedalboardBuilder};
pub use processor::{session_channels, RtProcessor, MAX_PENDING_PATCHES};
pub use ring::{ring, RingFull, RingReader, RingWriter};
pub use vu::{MonitorSubscription, MonitorSubscriptionList, VuSubscriptionList, VuUpdate};
