//! The per-block command processor running on the audio thread.
//!
//! Once per block the driver hands the processor the converted planar
//! buffers and the block's MIDI events. The processor then:
//!
//! 1. retries any pending `release` notifications,
//! 2. drains `to_rt` to empty and applies every message,
//! 3. applies MIDI (listeners, system bindings, program changes, the
//!    board's resolved control mappings),
//! 4. runs the current pedalboard,
//! 5. services patch traffic (replies, deadlines) and emits VU/monitor
//!    updates and state-change notifications.
//!
//! Nothing here allocates, locks, or blocks. When `from_rt` is full,
//! notifications are counted as dropped (VU batches instead stay pending
//! and are overwritten by fresher data); when an owned object cannot be
//! released it parks in a small retry list.

use smallvec::SmallVec;

use pedalera_core::Urid;
use pedalera_midi::{MidiEvent, SystemAction};

use crate::messages::{
    AtomBlob, CommandWriter, NotificationWriter, PatchPayload, SystemBindingList,
    SystemMidiEvent, ToRt,
};
use crate::pedalboard::{MappingFire, RtPedalboard};
use crate::ring::{ring, RingFull, RingReader, RingWriter};
use crate::vu::{MonitorSubscriptionList, VuSubscriptionList, VuUpdate};

/// Pending patch-get requests the RT side tracks at once.
pub const MAX_PENDING_PATCHES: usize = 16;

/// Most VU targets a single batch can carry.
const MAX_VU_TARGETS: usize = 64;

/// Default ring capacities for a session boundary.
pub const TO_RT_CAPACITY: usize = 64 * 1024;
pub const FROM_RT_CAPACITY: usize = 128 * 1024;

#[derive(Clone, Copy)]
struct PendingPatch {
    request_id: u64,
    instance_id: i64,
    property: Urid,
    /// Absolute sample time after which a timeout reply is due.
    deadline: u64,
}

/// An owned object whose `release` notification didn't fit; retried each
/// block. The RT side never frees these itself.
enum ReleaseSlot {
    Board(*mut RtPedalboard),
    Vu(*mut VuSubscriptionList),
    Monitor(*mut MonitorSubscriptionList),
    Bindings(*mut SystemBindingList),
    Atom(*mut AtomBlob),
}

// Raw pointers park here only between blocks on the one audio thread.
unsafe impl Send for ReleaseSlot {}

/// Both ends the audio thread owns, plus all RT-side state.
pub struct RtProcessor {
    to_rt: RingReader,
    state: ProcessorState,
}

struct ProcessorState {
    notify: NotificationWriter,
    pedalboard: Option<Box<RtPedalboard>>,
    vu_subs: Option<Box<VuSubscriptionList>>,
    monitor_subs: Option<Box<MonitorSubscriptionList>>,
    system_bindings: Option<Box<SystemBindingList>>,
    pending: [Option<PendingPatch>; MAX_PENDING_PATCHES],
    graveyard: SmallVec<[ReleaseSlot; 8]>,
    vu_scratch: Vec<VuUpdate>,
    sample_time: u64,
    underruns: u64,
    dropped: u64,
    dropped_reported: u64,
    midi_listen: bool,
    atom_listen: bool,
    /// Single-slot flow control for MIDI program changes.
    program_request: Option<u64>,
    snapshot_request: Option<u64>,
    next_request_id: u64,
    shutdown: bool,
}

/// Create the two session rings and the processor that owns their RT ends.
///
/// Returns `(processor, to_rt_writer, from_rt_reader)`; the writers/readers
/// go to the host side.
pub fn session_channels() -> (RtProcessor, CommandWriter, RingReader) {
    let (to_rt_writer, to_rt_reader) = ring(TO_RT_CAPACITY);
    let (from_rt_writer, from_rt_reader) = ring(FROM_RT_CAPACITY);
    (
        RtProcessor::new(to_rt_reader, from_rt_writer),
        CommandWriter::new(to_rt_writer),
        from_rt_reader,
    )
}

impl RtProcessor {
    pub fn new(to_rt: RingReader, from_rt: RingWriter) -> Self {
        Self {
            to_rt,
            state: ProcessorState {
                notify: NotificationWriter::new(from_rt),
                pedalboard: None,
                vu_subs: None,
                monitor_subs: None,
                system_bindings: None,
                pending: [None; MAX_PENDING_PATCHES],
                graveyard: SmallVec::new(),
                vu_scratch: Vec::with_capacity(MAX_VU_TARGETS),
                sample_time: 0,
                underruns: 0,
                dropped: 0,
                dropped_reported: 0,
                midi_listen: false,
                atom_listen: false,
                program_request: None,
                snapshot_request: None,
                next_request_id: 1,
                shutdown: false,
            },
        }
    }

    /// True once a shutdown command has been drained.
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown
    }

    /// Frames processed since the session opened.
    pub fn sample_time(&self) -> u64 {
        self.state.sample_time
    }

    /// Process one audio block. Called from the driver's realtime loop.
    pub fn on_process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    ) {
        let state = &mut self.state;
        state.flush_graveyard();
        while self
            .to_rt
            .read(|tag, payload| {
                if let Some(message) = ToRt::decode(tag, payload) {
                    state.handle(message);
                }
            })
            .is_some()
        {}

        state.apply_midi(midi);

        match &mut state.pedalboard {
            Some(board) => board.run(inputs, outputs, frames, midi),
            None => {
                for output in outputs.iter_mut() {
                    output[..frames].fill(0.0);
                }
            }
        }

        state.service_atoms();
        state.service_deadlines(frames as u64);
        state.service_vu(frames);
        state.service_monitors(frames);
        state.report_drops();
        state.sample_time += frames as u64;
    }

    /// Record an xrun and tell the host. Never fatal.
    pub fn on_underrun(&mut self) {
        self.state.underruns += 1;
        let count = self.state.underruns;
        let result = self.state.notify.underrun(count);
        self.state.note(result);
    }

    /// The driver loop exited (normally or fatally).
    ///
    /// The current pedalboard goes back to the host so its plugin state can
    /// be captured; any silent pumping that follows runs without a board.
    pub fn on_audio_stopped(&mut self) {
        let state = &mut self.state;
        if let Some(mut board) = state.pedalboard.take() {
            board.deactivate();
            state.park(ReleaseSlot::Board(Box::into_raw(board)));
        }
        state.flush_graveyard();
        let result = state.notify.audio_stopped();
        state.note(result);
    }
}

impl ProcessorState {
    fn note(&mut self, result: Result<(), RingFull>) {
        if result.is_err() {
            self.dropped += 1;
        }
    }

    fn park(&mut self, slot: ReleaseSlot) {
        let result = match &slot {
            ReleaseSlot::Board(ptr) => self.notify.release_pedalboard(*ptr),
            ReleaseSlot::Vu(ptr) => self.notify.release_vu_subscriptions(*ptr),
            ReleaseSlot::Monitor(ptr) => self.notify.release_monitor_subscriptions(*ptr),
            ReleaseSlot::Bindings(ptr) => self.notify.release_system_bindings(*ptr),
            ReleaseSlot::Atom(ptr) => self.notify.release_atom(*ptr),
        };
        if result.is_err() {
            self.graveyard.push(slot);
        }
    }

    fn flush_graveyard(&mut self) {
        let mut index = 0;
        while index < self.graveyard.len() {
            let result = match &self.graveyard[index] {
                ReleaseSlot::Board(ptr) => self.notify.release_pedalboard(*ptr),
                ReleaseSlot::Vu(ptr) => self.notify.release_vu_subscriptions(*ptr),
                ReleaseSlot::Monitor(ptr) => self.notify.release_monitor_subscriptions(*ptr),
                ReleaseSlot::Bindings(ptr) => self.notify.release_system_bindings(*ptr),
                ReleaseSlot::Atom(ptr) => self.notify.release_atom(*ptr),
            };
            if result.is_ok() {
                self.graveyard.swap_remove(index);
            } else {
                index += 1;
            }
        }
    }

    fn handle(&mut self, message: ToRt<'_>) {
        match message {
            ToRt::SetControl {
                instance_id,
                symbol,
                value,
            } => {
                if let Some(board) = self.pedalboard.as_mut() {
                    if let Some(effect) = board.find_effect_mut(instance_id) {
                        if let Some(index) = effect.control_index(symbol) {
                            effect.set_control(index, value);
                        }
                    }
                }
            }
            ToRt::SetBypass {
                instance_id,
                bypass,
            } => {
                if let Some(board) = self.pedalboard.as_mut() {
                    if let Some(effect) = board.find_effect_mut(instance_id) {
                        effect.set_bypass(bypass);
                    }
                }
            }
            ToRt::SetInputVolume { db } => {
                if let Some(board) = self.pedalboard.as_mut() {
                    board.set_input_volume_db(db);
                }
            }
            ToRt::SetOutputVolume { db } => {
                if let Some(board) = self.pedalboard.as_mut() {
                    board.set_output_volume_db(db);
                }
            }
            ToRt::LoadPreset {
                instance_id,
                controls,
            } => {
                if let Some(board) = self.pedalboard.as_mut() {
                    if let Some(effect) = board.find_effect_mut(instance_id) {
                        for (symbol, value) in controls {
                            if let Some(index) = effect.control_index(symbol) {
                                effect.set_control(index, value);
                            }
                        }
                    }
                }
            }
            ToRt::SetPedalboard { board } => {
                // Ownership transfers here; the previous board is released
                // back to the host once deactivated.
                let mut new_board = unsafe { Box::from_raw(board) };
                if let Some(mut old) = self.pedalboard.take() {
                    old.deactivate();
                    self.park(ReleaseSlot::Board(Box::into_raw(old)));
                }
                // Requests aimed at the old board are superseded; the host
                // classifies them, the RT side just forgets.
                self.pending = [None; MAX_PENDING_PATCHES];
                let notify = &mut self.notify;
                let mut dropped = 0u64;
                new_board.activate(&mut |instance_id, message| {
                    if notify.realtime_error(instance_id, message).is_err() {
                        dropped += 1;
                    }
                });
                self.dropped += dropped;
                self.pedalboard = Some(new_board);
            }
            ToRt::SetVuSubscriptions { list } => {
                if let Some(old) = self.vu_subs.take() {
                    self.park(ReleaseSlot::Vu(Box::into_raw(old)));
                }
                if !list.is_null() {
                    self.vu_subs = Some(unsafe { Box::from_raw(list) });
                }
            }
            ToRt::SetMonitorSubscriptions { list } => {
                if let Some(old) = self.monitor_subs.take() {
                    self.park(ReleaseSlot::Monitor(Box::into_raw(old)));
                }
                if !list.is_null() {
                    self.monitor_subs = Some(unsafe { Box::from_raw(list) });
                }
            }
            ToRt::SetSystemBindings { list } => {
                if let Some(old) = self.system_bindings.take() {
                    self.park(ReleaseSlot::Bindings(Box::into_raw(old)));
                }
                if !list.is_null() {
                    self.system_bindings = Some(unsafe { Box::from_raw(list) });
                }
            }
            ToRt::PatchSet {
                instance_id,
                property,
                payload,
            } => {
                let plugin = self
                    .pedalboard
                    .as_mut()
                    .and_then(|board| board.find_effect_mut(instance_id))
                    .and_then(|effect| effect.as_plugin_mut());
                match payload {
                    PatchPayload::Inline(bytes) => {
                        if let Some(plugin) = plugin {
                            plugin.push_patch_set(property, bytes);
                        }
                    }
                    PatchPayload::Heap(blob) => {
                        if let Some(plugin) = plugin {
                            let bytes = unsafe { &(*blob).bytes };
                            plugin.push_patch_set(property, bytes);
                        }
                        // The blob goes back to its issuer either way.
                        self.park(ReleaseSlot::Atom(blob));
                    }
                }
            }
            ToRt::PatchGet {
                instance_id,
                property,
                request_id,
                deadline_frames,
            } => {
                let found = self
                    .pedalboard
                    .as_mut()
                    .and_then(|board| board.find_effect_mut(instance_id))
                    .and_then(|effect| effect.as_plugin_mut())
                    .map(|plugin| plugin.push_patch_get(property))
                    .unwrap_or(false);
                let deadline = self.sample_time + deadline_frames;
                let recorded = found
                    && match self.pending.iter_mut().find(|slot| slot.is_none()) {
                        Some(slot) => {
                            *slot = Some(PendingPatch {
                                request_id,
                                instance_id,
                                property,
                                deadline,
                            });
                            true
                        }
                        None => false,
                    };
                if !recorded {
                    // Unknown target or table full: answer now so the
                    // request is never lost.
                    let result = self.notify.patch_timeout(request_id);
                    self.note(result);
                }
            }
            ToRt::AckMidiProgram { request_id } => {
                if self.program_request == Some(request_id) {
                    self.program_request = None;
                }
            }
            ToRt::AckSnapshot { request_id } => {
                if self.snapshot_request == Some(request_id) {
                    self.snapshot_request = None;
                }
            }
            ToRt::SetMidiListen { enabled } => self.midi_listen = enabled,
            ToRt::SetAtomListen { enabled } => self.atom_listen = enabled,
            ToRt::Shutdown => self.shutdown = true,
        }
    }

    fn apply_midi(&mut self, midi: &[MidiEvent]) {
        if midi.is_empty() {
            return;
        }
        if self.midi_listen {
            for event in midi {
                let result = self.notify.midi_message(event);
                self.note(result);
            }
        }

        // System bindings and program changes, gated by single-slot acks.
        for event in midi {
            if event.is_program_change() && self.program_request.is_none() {
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                let result =
                    self.notify
                        .midi_program_change(request_id, event.channel(), event.data[1]);
                if result.is_ok() {
                    self.program_request = Some(request_id);
                } else {
                    self.dropped += 1;
                }
            }
            if let Some(bindings) = self.system_bindings.as_deref() {
                for binding in bindings {
                    if !binding.triggered_by(event) {
                        continue;
                    }
                    match binding.action {
                        SystemAction::Shutdown => {
                            if self
                                .notify
                                .midi_system_event(SystemMidiEvent::Shutdown)
                                .is_err()
                            {
                                self.dropped += 1;
                            }
                        }
                        SystemAction::Reboot => {
                            if self
                                .notify
                                .midi_system_event(SystemMidiEvent::Reboot)
                                .is_err()
                            {
                                self.dropped += 1;
                            }
                        }
                        SystemAction::ToggleHotspot => {
                            if self
                                .notify
                                .midi_system_event(SystemMidiEvent::ToggleHotspot)
                                .is_err()
                            {
                                self.dropped += 1;
                            }
                        }
                        SystemAction::NextProgram | SystemAction::PreviousProgram => {
                            if self.program_request.is_none() {
                                let request_id = self.next_request_id;
                                self.next_request_id += 1;
                                let direction =
                                    if binding.action == SystemAction::NextProgram { 1 } else { -1 };
                                if self
                                    .notify
                                    .next_midi_program(request_id, direction)
                                    .is_ok()
                                {
                                    self.program_request = Some(request_id);
                                } else {
                                    self.dropped += 1;
                                }
                            }
                        }
                        SystemAction::Snapshot(index) => {
                            if self.snapshot_request.is_none() {
                                let request_id = self.next_request_id;
                                self.next_request_id += 1;
                                if self.notify.snapshot_request(request_id, index).is_ok() {
                                    self.snapshot_request = Some(request_id);
                                } else {
                                    self.dropped += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        // The board's own control/bypass mappings.
        if let Some(board) = self.pedalboard.as_mut() {
            let notify = &mut self.notify;
            let mut dropped = 0u64;
            board.apply_midi(midi, &mut |fire| {
                let result = match fire {
                    MappingFire::Control {
                        instance_id,
                        control_index,
                        value,
                    } => notify.control_changed(instance_id, control_index, value),
                    MappingFire::Enabled {
                        instance_id,
                        enabled,
                    } => notify.item_enabled_changed(instance_id, enabled),
                };
                if result.is_err() {
                    dropped += 1;
                }
            });
            self.dropped += dropped;
        }
    }

    /// Match plugin atom output against pending patch-gets; forward the
    /// rest to atom listeners; surface state-dirty flags.
    fn service_atoms(&mut self) {
        let Some(board) = self.pedalboard.as_mut() else {
            return;
        };
        let notify = &mut self.notify;
        let pending = &mut self.pending;
        let atom_listen = self.atom_listen;
        let mut dropped = 0u64;

        board.for_each_plugin_mut(&mut |plugin| {
            let instance_id = plugin.instance_id();
            for i in 0..plugin.atom_out().len() {
                let entry = plugin.atom_out().entries()[i];
                if entry.kind != pedalera_core::AtomKind::PatchSet {
                    continue;
                }
                let matched = pending.iter_mut().find(|slot| {
                    slot.is_some_and(|p| {
                        p.instance_id == instance_id && p.property == entry.property
                    })
                });
                let payload = plugin.atom_out().payload(&entry);
                if let Some(slot) = matched {
                    let request = slot.take().expect("matched slot is occupied");
                    if notify
                        .patch_reply(request.request_id, instance_id, entry.property, payload)
                        .is_err()
                    {
                        // Never lose a request: fall back to a timeout reply
                        // (8-byte payload, far more likely to fit).
                        if notify.patch_timeout(request.request_id).is_err() {
                            dropped += 1;
                        }
                    }
                } else if atom_listen
                    && notify.atom_output(instance_id, entry.property, payload).is_err()
                {
                    dropped += 1;
                }
            }
            if plugin.take_state_dirty() && notify.state_maybe_changed(instance_id).is_err() {
                dropped += 1;
            }
            plugin.clear_atom_queues();
        });
        self.dropped += dropped;
    }

    fn service_deadlines(&mut self, frames: u64) {
        let now = self.sample_time + frames;
        for slot in &mut self.pending {
            if slot.is_some_and(|p| p.deadline <= now) {
                let request = slot.take().expect("slot checked above");
                if self.notify.patch_timeout(request.request_id).is_err() {
                    self.dropped += 1;
                }
            }
        }
    }

    fn service_vu(&mut self, frames: usize) {
        let (Some(board), Some(list)) = (self.pedalboard.as_mut(), self.vu_subs.as_mut()) else {
            return;
        };
        board.accumulate_vu(list, frames);
        if list.frames_since_send < list.interval_frames {
            return;
        }
        let count = list.entries.len().min(MAX_VU_TARGETS);
        if !self.notify.fits(NotificationWriter::vu_batch_bytes(count)) {
            // Leave the accumulators running; the next attempt carries
            // fresher data (overwrite-pending semantics).
            return;
        }
        self.vu_scratch.clear();
        for entry in list.entries.iter_mut().take(count) {
            self.vu_scratch.push(entry.take_update());
        }
        let result = self.notify.vu_batch(&self.vu_scratch);
        debug_assert!(result.is_ok(), "vu batch was size-checked");
        if result.is_err() {
            self.dropped += 1;
        }
        list.frames_since_send = 0;
    }

    fn service_monitors(&mut self, frames: usize) {
        let (Some(board), Some(list)) = (self.pedalboard.as_ref(), self.monitor_subs.as_mut())
        else {
            return;
        };
        for entry in &mut list.entries {
            entry.frames_accum += frames as u32;
            if entry.frames_accum < entry.interval_frames {
                continue;
            }
            entry.frames_accum = 0;
            let Some(value) = board.control_value(entry.instance_id, entry.control_index) else {
                continue;
            };
            if self
                .notify
                .monitor_update(entry.subscription_id, value)
                .is_err()
            {
                self.dropped += 1;
            }
        }
    }

    fn report_drops(&mut self) {
        if self.dropped > self.dropped_reported
            && self.notify.notifications_dropped(self.dropped).is_ok()
        {
            self.dropped_reported = self.dropped;
        }
    }
}

impl Drop for ProcessorState {
    fn drop(&mut self) {
        // Teardown happens after the audio loop has exited; reclaiming the
        // parked objects here is the non-RT cleanup path.
        for slot in self.graveyard.drain(..) {
            match slot {
                ReleaseSlot::Board(ptr) => drop(unsafe { Box::from_raw(ptr) }),
                ReleaseSlot::Vu(ptr) => drop(unsafe { Box::from_raw(ptr) }),
                ReleaseSlot::Monitor(ptr) => drop(unsafe { Box::from_raw(ptr) }),
                ReleaseSlot::Bindings(ptr) => drop(unsafe { Box::from_raw(ptr) }),
                ReleaseSlot::Atom(ptr) => drop(unsafe { Box::from_raw(ptr) }),
            }
        }
    }
}
