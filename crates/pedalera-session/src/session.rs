//! The host-side audio session.
//!
//! [`AudioSession::open`] negotiates the device (falling back to the silent
//! dummy device when asked), starts the realtime driver around an
//! [`RtProcessor`], and spawns the notification pump thread that drains
//! `from_rt`, reclaims released objects, completes patch requests, and fans
//! updates out to subscribers.
//!
//! Locking discipline: one plain mutex guards the session state. It is
//! never held across a subscriber callback (dispatch works on snapshots)
//! and the audio thread never touches it, so nothing here can invert the
//! realtime thread's priority.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use pedalera_core::{atom, ItemKind, Pedalboard, PluginRegistry, UridMap};
use pedalera_io::{
    AudioDriver, AudioDriverHost, ChannelMap, DummyDriver, PcmDriver, PcmRequest, RawMidiInput,
};
use pedalera_midi::{MidiEvent, SystemBinding};
use pedalera_rt::{
    drain_from_rt, session_channels, CommandWriter, FromRt, RingReader, RtPedalboardBuilder,
    RtProcessor, SystemMidiEvent,
};

use crate::config::{ChannelSelection, ServerConfiguration, ServerSettings};
use crate::requests::{Completion, RequestTable};
use crate::subscriptions::{
    MonitorSubscriber, SubscriptionRegistry, VuSubscriber,
};
pub use crate::subscriptions::{MonitorCallback, MonitorHandle, VuCallback, VuHandle};
use crate::{Result, SessionError};

/// VU batches are produced at this rate.
const VU_RATE_HZ: u32 = 30;

/// How long enqueueing a pedalboard may retry before `Overloaded`.
const HANDOVER_RETRY: Duration = Duration::from_millis(250);

/// Pump thread poll interval.
const PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Bound on patch-set payloads accepted from clients.
const MAX_PATCH_BYTES: usize = 64 * 1024;

pub type MidiCallback = Arc<dyn Fn(&MidiEvent) + Send + Sync>;
pub type AtomCallback = Arc<dyn Fn(i64, &str, &serde_json::Value) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Engine-level notifications delivered to the event listener.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Underrun { count: u64 },
    RealtimeError { instance_id: i64, message: String },
    /// A plugin's opaque state may have changed.
    StateChanged { instance_id: i64 },
    /// A MIDI mapping moved a control.
    ControlChangedByMidi { instance_id: i64, control_index: u32, value: f32 },
    /// A MIDI mapping toggled an item's bypass.
    ItemEnabledChanged { instance_id: i64, enabled: bool },
    /// A MIDI program change wants handling; answer with
    /// [`AudioSession::ack_midi_program`].
    ProgramChange { request_id: u64, channel: u8, program: u8 },
    /// A system binding stepped the program (direction ±1).
    NextProgram { request_id: u64, direction: i8 },
    /// A system binding selected a snapshot; answer with
    /// [`AudioSession::ack_snapshot`].
    Snapshot { request_id: u64, index: u8 },
    SystemMidi(SystemMidiEvent),
    /// RT → host notifications were dropped (running total).
    NotificationsDropped { count: u64 },
    /// The audio thread exited; the device is gone or the session closed.
    AudioStopped,
}

struct SessionState {
    commands: CommandWriter,
    model: Option<Pedalboard>,
    requests: RequestTable,
    registry: Arc<PluginRegistry>,
    urids: Arc<UridMap>,
    subs: SubscriptionRegistry,
    next_handle: u64,
    midi_listener: Option<MidiCallback>,
    atom_listener: Option<AtomCallback>,
    event_listener: Option<EventCallback>,
    /// Control writes that did not fit the ring; last writer wins per key.
    deferred_controls: HashMap<(i64, String), f32>,
    deferred_bypass: HashMap<i64, bool>,
    closed: bool,
    sample_rate: u32,
    chain_inputs: usize,
    period_frames: usize,
}

struct Shared {
    state: Mutex<SessionState>,
    closing: AtomicBool,
}

/// Deferred dispatch gathered under the lock, run after unlocking.
enum Action {
    Complete(Completion),
    Vu(Vec<VuCallback>, pedalera_rt::VuUpdate),
    Monitor(MonitorCallback, f32),
    Midi(MidiCallback, MidiEvent),
    Atom(AtomCallback, i64, String, serde_json::Value),
    Event(EventCallback, EngineEvent),
}

impl Action {
    fn run(self) {
        match self {
            Action::Complete(completion) => completion.deliver(),
            Action::Vu(callbacks, update) => {
                for callback in callbacks {
                    callback(&update);
                }
            }
            Action::Monitor(callback, value) => callback(value),
            Action::Midi(callback, event) => callback(&event),
            Action::Atom(callback, instance_id, uri, value) => {
                callback(instance_id, &uri, &value)
            }
            Action::Event(callback, event) => callback(&event),
        }
    }
}

/// Adapter giving the driver its host surface over the RT processor.
struct RtHost {
    processor: RtProcessor,
}

impl AudioDriverHost for RtHost {
    fn on_process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
        midi: &[MidiEvent],
    ) {
        self.processor.on_process(inputs, outputs, frames, midi);
    }

    fn on_underrun(&mut self) {
        self.processor.on_underrun();
    }

    fn on_audio_stopped(&mut self) {
        self.processor.on_audio_stopped();
    }

    fn should_terminate(&self) -> bool {
        self.processor.shutdown_requested()
    }
}

/// The host-side audio session.
pub struct AudioSession {
    shared: Arc<Shared>,
    driver: Option<AudioDriver>,
    pump: Option<thread::JoinHandle<()>>,
    pump_stop: Option<Sender<()>>,
    configuration: ServerConfiguration,
}

impl AudioSession {
    /// Open the device, start the realtime driver, and spawn the pump.
    ///
    /// When the device cannot be opened and `fallback_to_dummy` is set, the
    /// session runs on the silent dummy device at the same period cadence.
    pub fn open(
        settings: &ServerSettings,
        selection: &ChannelSelection,
        registry: Arc<PluginRegistry>,
        pcm: &dyn PcmDriver,
        midi_inputs: Vec<Box<dyn RawMidiInput>>,
    ) -> Result<AudioSession> {
        settings
            .validate()
            .map_err(SessionError::Configuration)?;
        if selection.input_channels.is_empty() || selection.output_channels.is_empty() {
            return Err(SessionError::Configuration(
                "at least one input and one output channel must be selected".into(),
            ));
        }

        let request = PcmRequest {
            device_name: settings.device_name.clone(),
            sample_rate: settings.sample_rate,
            period_frames: settings.period_frames,
            period_count: settings.period_count,
        };
        let device = match pcm.open(&request) {
            Ok(device) => device,
            Err(error) if settings.fallback_to_dummy => {
                tracing::warn!(%error, "device open failed; falling back to dummy device");
                let channels = selection
                    .input_channels
                    .iter()
                    .chain(&selection.output_channels)
                    .map(|&c| c + 1)
                    .max()
                    .unwrap_or(2);
                DummyDriver { channels }.open(&request)?
            }
            Err(error) => return Err(error.into()),
        };
        let device_config = device.config().clone();
        tracing::info!(config = %device_config.description(), "session device ready");

        let map = ChannelMap {
            inputs: selection.input_channels.clone(),
            outputs: selection.output_channels.clone(),
        };
        let configuration = ServerConfiguration {
            description: device_config.description(),
            sample_rate: device_config.sample_rate,
            period_frames: device_config.period_frames,
            period_count: device_config.period_count,
            input_channels: selection.input_channels.clone(),
            output_channels: selection.output_channels.clone(),
        };

        let (processor, commands, from_rt) = session_channels();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                commands,
                model: None,
                requests: RequestTable::new(),
                registry,
                urids: Arc::new(UridMap::new()),
                subs: SubscriptionRegistry::default(),
                next_handle: 1,
                midi_listener: None,
                atom_listener: None,
                event_listener: None,
                deferred_controls: HashMap::new(),
                deferred_bypass: HashMap::new(),
                closed: false,
                sample_rate: device_config.sample_rate,
                chain_inputs: selection.input_channels.len(),
                period_frames: device_config.period_frames,
            }),
            closing: AtomicBool::new(false),
        });

        let driver = AudioDriver::start(device, map, midi_inputs, RtHost { processor })?;

        let (pump_stop, stop_signal) = bounded(1);
        let pump_shared = Arc::clone(&shared);
        let pump = thread::Builder::new()
            .name("pedalera-session".into())
            .spawn(move || pump_loop(pump_shared, from_rt, stop_signal))
            .map_err(|e| {
                SessionError::Configuration(format!("failed to spawn session pump: {e}"))
            })?;

        Ok(AudioSession {
            shared,
            driver: Some(driver),
            pump: Some(pump),
            pump_stop: Some(pump_stop),
            configuration,
        })
    }

    /// Current sample rate, period size, and channel maps.
    pub fn server_configuration(&self) -> &ServerConfiguration {
        &self.configuration
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| SessionError::Closed)?;
        if state.closed {
            return Err(SessionError::Closed);
        }
        Ok(state)
    }

    // --- pedalboard mutation ---

    /// Build and hand over a new realtime pedalboard.
    ///
    /// Returns per-item build warnings (bad state, unknown symbols); an
    /// unknown plugin URI refuses the whole call. Outstanding patch
    /// requests are completed with [`SessionError::Superseded`].
    pub fn set_pedalboard(&self, model: &Pedalboard) -> Result<Vec<String>> {
        let (completions, warnings) = {
            let mut state = self.lock()?;
            let completions = state.requests.fail_all(|| SessionError::Superseded);

            let builder = RtPedalboardBuilder {
                registry: state.registry.as_ref(),
                urids: state.urids.as_ref(),
                sample_rate: state.sample_rate as f64,
                max_frames: state.period_frames,
                input_channels: state.chain_inputs,
            };
            let (board, errors) = builder.build(model)?;

            state.enqueue_pedalboard(board)?;
            state.model = Some(model.clone());
            state.push_subscription_lists();

            let warnings = errors
                .into_iter()
                .map(|e| format!("instance {}: {}", e.instance_id, e.message))
                .collect();
            (completions, warnings)
        };
        for completion in completions {
            completion.deliver();
        }
        Ok(warnings)
    }

    /// Write one control value. Idempotent under dropped duplicates: when
    /// the queue is full the newest value per (instance, symbol) is kept
    /// and flushed by the pump.
    pub fn set_control(&self, instance_id: i64, symbol: &str, value: f32) -> Result<()> {
        let mut state = self.lock()?;
        state.control_exists(instance_id, symbol)?;
        if let Some(model) = state.model.as_mut() {
            model.set_control(instance_id, symbol, value);
        }
        if state
            .commands
            .set_control(instance_id, symbol, value)
            .is_err()
        {
            state
                .deferred_controls
                .insert((instance_id, symbol.to_owned()), value);
        }
        Ok(())
    }

    pub fn set_bypass(&self, instance_id: i64, enabled: bool) -> Result<()> {
        let mut state = self.lock()?;
        let bypass = !enabled;
        let known = state
            .model
            .as_mut()
            .is_some_and(|m| m.set_bypass(instance_id, bypass));
        if !known {
            return Err(SessionError::UnknownInstance(instance_id));
        }
        if state.commands.set_bypass(instance_id, bypass).is_err() {
            state.deferred_bypass.insert(instance_id, bypass);
        }
        Ok(())
    }

    /// Apply a plugin preset: a batch of control values, set atomically
    /// with respect to audio blocks.
    pub fn load_plugin_preset(
        &self,
        instance_id: i64,
        controls: &[(String, f32)],
    ) -> Result<()> {
        let mut state = self.lock()?;
        for (symbol, _) in controls {
            state.control_exists(instance_id, symbol)?;
        }
        if let Some(model) = state.model.as_mut() {
            for (symbol, value) in controls {
                model.set_control(instance_id, symbol, *value);
            }
        }
        state
            .commands
            .load_preset(
                instance_id,
                controls.iter().map(|(s, v)| (s.as_str(), *v)),
            )
            .map_err(|_| SessionError::Overloaded)
    }

    // --- gain ---

    /// Set the input volume and record it in the current pedalboard.
    pub fn set_input_volume(&self, db: f32) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(model) = state.model.as_mut() {
            model.input_volume_db = db;
        }
        state
            .commands
            .set_input_volume(db)
            .map_err(|_| SessionError::Overloaded)
    }

    pub fn set_output_volume(&self, db: f32) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(model) = state.model.as_mut() {
            model.output_volume_db = db;
        }
        state
            .commands
            .set_output_volume(db)
            .map_err(|_| SessionError::Overloaded)
    }

    /// Audition an input volume without marking the preset dirty.
    pub fn preview_input_volume(&self, db: f32) -> Result<()> {
        let mut state = self.lock()?;
        state
            .commands
            .set_input_volume(db)
            .map_err(|_| SessionError::Overloaded)
    }

    pub fn preview_output_volume(&self, db: f32) -> Result<()> {
        let mut state = self.lock()?;
        state
            .commands
            .set_output_volume(db)
            .map_err(|_| SessionError::Overloaded)
    }

    // --- patch properties ---

    /// Request a patch property value; resolves through `on_success` /
    /// `on_error` on the pump thread. Every request completes unless the
    /// session closes first.
    pub fn send_patch_get(
        &self,
        client_id: u64,
        instance_id: i64,
        property_uri: &str,
        timeout: Duration,
        on_success: impl FnOnce(serde_json::Value) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        let on_success: crate::requests::SuccessCallback = Box::new(on_success);
        let on_error: crate::requests::ErrorCallback = Box::new(on_error);

        let mut failed: Option<(crate::requests::ErrorCallback, SessionError)> = None;
        let mut aborted: Option<Completion> = None;
        match self.lock() {
            Err(error) => failed = Some((on_error, error)),
            Ok(mut state) => match state.plugin_exists(instance_id) {
                Err(error) => failed = Some((on_error, error)),
                Ok(()) => {
                    let property = state.urids.map(property_uri);
                    let deadline_frames =
                        (timeout.as_secs_f64() * state.sample_rate as f64) as u64;
                    let fallback =
                        Instant::now() + timeout + timeout / 2 + Duration::from_millis(250);
                    match state.requests.insert(
                        client_id,
                        instance_id,
                        property,
                        fallback,
                        on_success,
                        on_error,
                    ) {
                        Err((_, on_error)) => {
                            failed = Some((on_error, SessionError::Overloaded));
                        }
                        Ok(request_id) => {
                            if state
                                .commands
                                .patch_get(instance_id, property, request_id, deadline_frames)
                                .is_err()
                            {
                                aborted = state.requests.abort(request_id);
                            }
                        }
                    }
                }
            },
        }
        if let Some((callback, error)) = failed {
            callback(error);
        }
        if let Some(completion) = aborted {
            completion.deliver();
        }
    }

    /// Write a patch property. Success means the value was handed to the
    /// audio thread; the plugin applies it at the next block.
    pub fn send_patch_set(
        &self,
        instance_id: i64,
        property_uri: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let payload = atom::json_to_payload(value);
        if payload.len() > MAX_PATCH_BYTES {
            return Err(SessionError::ValueTooLarge);
        }
        let mut state = self.lock()?;
        state.plugin_exists(instance_id)?;
        let property = state.urids.map(property_uri);
        state
            .commands
            .patch_set(instance_id, property, &payload)
            .map_err(|_| SessionError::Overloaded)
    }

    // --- observation ---

    /// Subscribe to VU updates for an instance (or a bus pseudo-id).
    pub fn subscribe_vu(&self, instance_id: i64, callback: VuCallback) -> Result<VuHandle> {
        let mut state = self.lock()?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.subs.vus.push(VuSubscriber {
            handle,
            instance_id,
            callback,
        });
        state.push_subscription_lists();
        Ok(VuHandle(handle))
    }

    pub fn unsubscribe_vu(&self, handle: VuHandle) -> Result<()> {
        let mut state = self.lock()?;
        state.subs.vus.retain(|s| s.handle != handle.0);
        state.push_subscription_lists();
        Ok(())
    }

    /// Subscribe to a control-output port, sampled every `interval` seconds.
    pub fn subscribe_monitor_port(
        &self,
        instance_id: i64,
        symbol: &str,
        interval: Duration,
        callback: MonitorCallback,
    ) -> Result<MonitorHandle> {
        let mut state = self.lock()?;
        let control_index = state.resolve_control(instance_id, symbol)? as u32;
        let interval_frames =
            ((interval.as_secs_f64() * state.sample_rate as f64) as u32).max(1);
        let handle = state.next_handle;
        state.next_handle += 1;
        state.subs.monitors.push(MonitorSubscriber {
            handle,
            instance_id,
            control_index,
            interval_frames,
            callback,
        });
        state.push_subscription_lists();
        Ok(MonitorHandle(handle))
    }

    pub fn unsubscribe_monitor_port(&self, handle: MonitorHandle) -> Result<()> {
        let mut state = self.lock()?;
        state.subs.monitors.retain(|s| s.handle != handle.0);
        state.push_subscription_lists();
        Ok(())
    }

    /// Install (or clear) the raw MIDI listener.
    pub fn set_midi_listener(&self, listener: Option<MidiCallback>) -> Result<()> {
        let mut state = self.lock()?;
        let enabled = listener.is_some();
        state.midi_listener = listener;
        state
            .commands
            .set_midi_listen(enabled)
            .map_err(|_| SessionError::Overloaded)
    }

    /// Install (or clear) the atom-output listener.
    pub fn set_atom_listener(&self, listener: Option<AtomCallback>) -> Result<()> {
        let mut state = self.lock()?;
        let enabled = listener.is_some();
        state.atom_listener = listener;
        state
            .commands
            .set_atom_listen(enabled)
            .map_err(|_| SessionError::Overloaded)
    }

    /// Install (or clear) the engine event listener.
    pub fn set_event_listener(&self, listener: Option<EventCallback>) -> Result<()> {
        let mut state = self.lock()?;
        state.event_listener = listener;
        Ok(())
    }

    /// Replace the system-wide MIDI bindings.
    pub fn set_system_bindings(&self, bindings: Vec<SystemBinding>) -> Result<()> {
        let mut state = self.lock()?;
        let list = if bindings.is_empty() {
            None
        } else {
            Some(Box::new(bindings))
        };
        state
            .commands
            .set_system_bindings(list)
            .map_err(|_| SessionError::Overloaded)
    }

    /// Allow the next MIDI program-change request to be emitted.
    pub fn ack_midi_program(&self, request_id: u64) -> Result<()> {
        let mut state = self.lock()?;
        state
            .commands
            .ack_midi_program(request_id)
            .map_err(|_| SessionError::Overloaded)
    }

    pub fn ack_snapshot(&self, request_id: u64) -> Result<()> {
        let mut state = self.lock()?;
        state
            .commands
            .ack_snapshot(request_id)
            .map_err(|_| SessionError::Overloaded)
    }

    /// A control-plane client disconnected: cancel its outstanding
    /// requests.
    pub fn cancel_client(&self, client_id: u64) {
        let completions = match self.lock() {
            Ok(mut state) => state.requests.cancel_client(client_id),
            Err(_) => Vec::new(),
        };
        for completion in completions {
            completion.deliver();
        }
    }

    /// The current editable pedalboard, state captures included.
    pub fn pedalboard(&self) -> Result<Option<Pedalboard>> {
        Ok(self.lock()?.model.clone())
    }

    /// Stop the audio thread, drain both queues, and release everything.
    pub fn close(&mut self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let completions = {
            let mut state = match self.shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.closed = true;
            let _ = state.commands.shutdown();
            state.requests.fail_all(|| SessionError::Closed)
        };
        for completion in completions {
            completion.deliver();
        }

        if let Some(mut driver) = self.driver.take() {
            if !driver.stop(Duration::from_secs(2)) {
                tracing::error!("audio driver did not stop in time; force-closed");
            }
        }

        // Only now stop the pump: the final drain reclaims everything the
        // audio thread released on its way out.
        drop(self.pump_stop.take());
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        tracing::info!("audio session closed");
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionState {
    /// Validate that `(instance, symbol)` names a real control port.
    fn control_exists(&self, instance_id: i64, symbol: &str) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or(SessionError::UnknownInstance(instance_id))?;
        let item = model
            .find_item(instance_id)
            .ok_or(SessionError::UnknownInstance(instance_id))?;
        let known = match &item.kind {
            ItemKind::Plugin(config) => self
                .registry
                .descriptor(&config.uri)
                .and_then(|d| d.control_index(symbol))
                .is_some(),
            ItemKind::Split(_) => symbol == "mix",
        };
        if known {
            Ok(())
        } else {
            Err(SessionError::UnknownControl {
                instance_id,
                symbol: symbol.to_owned(),
            })
        }
    }

    fn resolve_control(&self, instance_id: i64, symbol: &str) -> Result<usize> {
        let model = self
            .model
            .as_ref()
            .ok_or(SessionError::UnknownInstance(instance_id))?;
        let item = model
            .find_item(instance_id)
            .ok_or(SessionError::UnknownInstance(instance_id))?;
        match &item.kind {
            ItemKind::Plugin(config) => self
                .registry
                .descriptor(&config.uri)
                .and_then(|d| d.control_index(symbol))
                .ok_or_else(|| SessionError::UnknownControl {
                    instance_id,
                    symbol: symbol.to_owned(),
                }),
            ItemKind::Split(_) => {
                if symbol == "mix" {
                    Ok(0)
                } else {
                    Err(SessionError::UnknownControl {
                        instance_id,
                        symbol: symbol.to_owned(),
                    })
                }
            }
        }
    }

    fn plugin_exists(&self, instance_id: i64) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or(SessionError::UnknownInstance(instance_id))?;
        match model.find_item(instance_id) {
            Some(item) if matches!(item.kind, ItemKind::Plugin(_)) => Ok(()),
            _ => Err(SessionError::UnknownInstance(instance_id)),
        }
    }

    fn enqueue_pedalboard(&mut self, board: Box<pedalera_rt::RtPedalboard>) -> Result<()> {
        let mut board = board;
        let deadline = Instant::now() + HANDOVER_RETRY;
        loop {
            match self.commands.set_pedalboard(board) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    if Instant::now() >= deadline {
                        return Err(SessionError::Overloaded);
                    }
                    board = returned;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Rebuild and hand over both subscription lists.
    fn push_subscription_lists(&mut self) {
        let interval_frames = (self.sample_rate / VU_RATE_HZ).max(1);
        let vu_list = self.subs.build_vu_list(interval_frames);
        if let Err(list) = self.commands.set_vu_subscriptions(vu_list) {
            drop(list);
            tracing::warn!("vu subscription handover deferred: control queue full");
        }
        let monitor_list = self.subs.build_monitor_list();
        if let Err(list) = self.commands.set_monitor_subscriptions(monitor_list) {
            drop(list);
            tracing::warn!("monitor subscription handover deferred: control queue full");
        }
    }

    /// Map a control index back to its symbol for model bookkeeping.
    fn symbol_for(&self, instance_id: i64, control_index: u32) -> Option<String> {
        let model = self.model.as_ref()?;
        let item = model.find_item(instance_id)?;
        match &item.kind {
            ItemKind::Plugin(config) => self
                .registry
                .descriptor(&config.uri)?
                .controls
                .get(control_index as usize)
                .map(|port| port.symbol.to_owned()),
            ItemKind::Split(_) => (control_index == 0).then(|| "mix".to_owned()),
        }
    }

    fn event(&self, actions: &mut Vec<Action>, event: EngineEvent) {
        if let Some(listener) = &self.event_listener {
            actions.push(Action::Event(Arc::clone(listener), event));
        }
    }
}

fn pump_loop(shared: Arc<Shared>, mut from_rt: RingReader, stop: Receiver<()>) {
    loop {
        pump_once(&shared, &mut from_rt);
        housekeeping(&shared);
        match stop.recv_timeout(PUMP_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => continue,
            // Stop arrives only after the audio thread has joined, so one
            // final drain reclaims everything it released on the way out.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                pump_once(&shared, &mut from_rt);
                break;
            }
        }
    }
}

fn pump_once(shared: &Shared, from_rt: &mut RingReader) {
    let mut actions: Vec<Action> = Vec::new();
    {
        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        drain_from_rt(from_rt, |message| {
            handle_notification(&mut state, message, &mut actions)
        });
    }
    for action in actions {
        action.run();
    }
}

fn housekeeping(shared: &Shared) {
    let completions = {
        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Flush deferred control writes, newest value per key.
        let deferred: Vec<((i64, String), f32)> = state.deferred_controls.drain().collect();
        for ((instance_id, symbol), value) in deferred {
            if state
                .commands
                .set_control(instance_id, &symbol, value)
                .is_err()
            {
                state.deferred_controls.insert((instance_id, symbol), value);
            }
        }
        let deferred: Vec<(i64, bool)> = state.deferred_bypass.drain().collect();
        for (instance_id, bypass) in deferred {
            if state.commands.set_bypass(instance_id, bypass).is_err() {
                state.deferred_bypass.insert(instance_id, bypass);
            }
        }

        state.requests.take_expired(Instant::now())
    };
    for completion in completions {
        completion.deliver();
    }
}

fn handle_notification(state: &mut SessionState, message: FromRt<'_>, actions: &mut Vec<Action>) {
    match message {
        FromRt::ReleasePedalboard { board } => {
            // RT no longer holds it; reclaim and capture plugin state into
            // the editable model before dropping.
            let board = unsafe { Box::from_raw(board) };
            capture_states(state, &board);
            drop(board);
        }
        FromRt::ReleaseVuSubscriptions { list } => drop(unsafe { Box::from_raw(list) }),
        FromRt::ReleaseMonitorSubscriptions { list } => drop(unsafe { Box::from_raw(list) }),
        FromRt::ReleaseSystemBindings { list } => drop(unsafe { Box::from_raw(list) }),
        FromRt::ReleaseAtom { atom } => drop(unsafe { Box::from_raw(atom) }),
        FromRt::VuBatch(batch) => {
            for update in batch {
                let callbacks = state.subs.vu_snapshot(update.instance_id);
                if !callbacks.is_empty() {
                    actions.push(Action::Vu(callbacks, update));
                }
            }
        }
        FromRt::MonitorUpdate {
            subscription_id,
            value,
        } => {
            if let Some(callback) = state.subs.monitor_callback(subscription_id) {
                actions.push(Action::Monitor(callback, value));
            }
        }
        FromRt::AtomOutput {
            instance_id,
            property,
            payload,
        } => {
            if let Some(listener) = &state.atom_listener {
                if let (Some(uri), Ok(value)) =
                    (state.urids.unmap(property), atom::payload_to_json(payload))
                {
                    actions.push(Action::Atom(
                        Arc::clone(listener),
                        instance_id,
                        uri,
                        value,
                    ));
                }
            }
        }
        FromRt::PatchReply {
            request_id,
            payload,
            ..
        } => {
            let completion = match atom::payload_to_json(payload) {
                Ok(value) => state.requests.complete_success(request_id, value),
                Err(_) => state.requests.complete_error(
                    request_id,
                    SessionError::Configuration("malformed patch reply payload".into()),
                ),
            };
            if let Some(completion) = completion {
                actions.push(Action::Complete(completion));
            }
        }
        FromRt::PatchTimeout { request_id } => {
            if let Some(completion) = state
                .requests
                .complete_error(request_id, SessionError::Timeout)
            {
                actions.push(Action::Complete(completion));
            }
        }
        FromRt::ControlChanged {
            instance_id,
            control_index,
            value,
        } => {
            if let Some(symbol) = state.symbol_for(instance_id, control_index) {
                if let Some(model) = state.model.as_mut() {
                    model.set_control(instance_id, &symbol, value);
                }
            }
            state.event(
                actions,
                EngineEvent::ControlChangedByMidi {
                    instance_id,
                    control_index,
                    value,
                },
            );
        }
        FromRt::ItemEnabledChanged {
            instance_id,
            enabled,
        } => {
            if let Some(model) = state.model.as_mut() {
                model.set_bypass(instance_id, !enabled);
            }
            state.event(
                actions,
                EngineEvent::ItemEnabledChanged {
                    instance_id,
                    enabled,
                },
            );
        }
        FromRt::StateMaybeChanged { instance_id } => {
            state.event(actions, EngineEvent::StateChanged { instance_id });
        }
        FromRt::RealtimeError {
            instance_id,
            message,
        } => {
            tracing::warn!(instance_id, error = message, "realtime error");
            state.event(
                actions,
                EngineEvent::RealtimeError {
                    instance_id,
                    message: message.to_owned(),
                },
            );
        }
        FromRt::MidiProgramChange {
            request_id,
            channel,
            program,
        } => {
            state.event(
                actions,
                EngineEvent::ProgramChange {
                    request_id,
                    channel,
                    program,
                },
            );
        }
        FromRt::NextMidiProgram {
            request_id,
            direction,
        } => {
            state.event(
                actions,
                EngineEvent::NextProgram {
                    request_id,
                    direction,
                },
            );
        }
        FromRt::SnapshotRequest {
            request_id,
            snapshot_index,
        } => {
            state.event(
                actions,
                EngineEvent::Snapshot {
                    request_id,
                    index: snapshot_index,
                },
            );
        }
        FromRt::MidiSystemEvent { event } => {
            state.event(actions, EngineEvent::SystemMidi(event));
        }
        FromRt::MidiMessage { event } => {
            if let Some(listener) = &state.midi_listener {
                actions.push(Action::Midi(Arc::clone(listener), event));
            }
        }
        FromRt::Underrun { count } => {
            state.event(actions, EngineEvent::Underrun { count });
        }
        FromRt::NotificationsDropped { count } => {
            tracing::warn!(count, "realtime notifications dropped");
            state.event(actions, EngineEvent::NotificationsDropped { count });
        }
        FromRt::AudioStopped => {
            tracing::info!("audio thread stopped");
            state.event(actions, EngineEvent::AudioStopped);
        }
    }
}

/// Pull each plugin's state out of a released board into the model,
/// advancing the monotonic update counter when the bytes changed.
fn capture_states(state: &mut SessionState, board: &pedalera_rt::RtPedalboard) {
    let Some(model) = state.model.as_mut() else {
        return;
    };
    board.for_each_plugin(&mut |plugin| {
        let Some(bytes) = plugin.save_state() else {
            return;
        };
        let instance_id = plugin.instance_id();
        let Some(item) = model.find_item(instance_id) else {
            return;
        };
        let ItemKind::Plugin(config) = &item.kind else {
            return;
        };
        if config.state.as_deref() != Some(bytes.as_slice()) {
            let next = config.state_update_count + 1;
            model.apply_captured_state(instance_id, bytes, next);
        }
    });
}
