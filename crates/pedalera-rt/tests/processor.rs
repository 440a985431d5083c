//! Integration tests for the RT command processor: pedalboard handover,
//! control latency, patch request lifecycle, and metering cadence.

use pedalera_core::builtin::{GAIN_LABEL_PROPERTY, GAIN_URI};
use pedalera_core::{
    atom, Pedalboard, PluginRegistry, UridMap, OUTPUT_BUS_INSTANCE_ID,
};
use pedalera_rt::{
    drain_from_rt, session_channels, FromRt, MonitorSubscription, MonitorSubscriptionList,
    RtPedalboardBuilder, RtProcessor, VuSubscriptionList,
};

const FRAMES: usize = 64;

struct Harness {
    processor: RtProcessor,
    commands: pedalera_rt::CommandWriter,
    from_rt: pedalera_rt::RingReader,
    registry: PluginRegistry,
    urids: UridMap,
}

/// Host-visible notifications, with released pointers already reclaimed.
#[derive(Debug, PartialEq)]
enum Note {
    ReleasedPedalboard(usize),
    Vu { instance_id: i64, peak_left: f32 },
    Monitor { subscription_id: u64, value: f32 },
    PatchReply { request_id: u64, payload: Vec<u8> },
    PatchTimeout { request_id: u64 },
    StateMaybeChanged { instance_id: i64 },
    Underrun { count: u64 },
    Other,
}

impl Harness {
    fn new() -> Self {
        let (processor, commands, from_rt) = session_channels();
        Self {
            processor,
            commands,
            from_rt,
            registry: PluginRegistry::with_builtins(),
            urids: UridMap::new(),
        }
    }

    fn gain_board(&self, gain: f32) -> (Box<pedalera_rt::RtPedalboard>, i64) {
        let mut model = Pedalboard::new("test");
        let id = model.push_plugin(GAIN_URI);
        model.set_control(id, "gain", gain);
        let builder = RtPedalboardBuilder {
            registry: &self.registry,
            urids: &self.urids,
            sample_rate: 48000.0,
            max_frames: FRAMES,
            input_channels: 2,
        };
        let (board, errors) = builder.build(&model).unwrap();
        assert!(errors.is_empty());
        (board, id)
    }

    fn run_block(&mut self, level: f32) -> Vec<f32> {
        let input = vec![level; FRAMES];
        let mut left = vec![0.0f32; FRAMES];
        let mut right = vec![0.0f32; FRAMES];
        let inputs = [input.as_slice(), input.as_slice()];
        let mut outputs = [left.as_mut_slice(), right.as_mut_slice()];
        self.processor
            .on_process(&inputs, &mut outputs, FRAMES, &[]);
        left
    }

    fn drain(&mut self) -> Vec<Note> {
        let mut notes = Vec::new();
        drain_from_rt(&mut self.from_rt, |message| {
            notes.push(match message {
                FromRt::ReleasePedalboard { board } => {
                    let reclaimed = unsafe { Box::from_raw(board) };
                    let address = board as usize;
                    drop(reclaimed);
                    Note::ReleasedPedalboard(address)
                }
                FromRt::ReleaseVuSubscriptions { list } => {
                    drop(unsafe { Box::from_raw(list) });
                    Note::Other
                }
                FromRt::ReleaseMonitorSubscriptions { list } => {
                    drop(unsafe { Box::from_raw(list) });
                    Note::Other
                }
                FromRt::VuBatch(batch) => {
                    let first = batch.clone().next().unwrap();
                    Note::Vu {
                        instance_id: first.instance_id,
                        peak_left: first.peak_left,
                    }
                }
                FromRt::MonitorUpdate {
                    subscription_id,
                    value,
                } => Note::Monitor {
                    subscription_id,
                    value,
                },
                FromRt::PatchReply {
                    request_id,
                    payload,
                    ..
                } => Note::PatchReply {
                    request_id,
                    payload: payload.to_vec(),
                },
                FromRt::PatchTimeout { request_id } => Note::PatchTimeout { request_id },
                FromRt::StateMaybeChanged { instance_id } => {
                    Note::StateMaybeChanged { instance_id }
                }
                FromRt::Underrun { count } => Note::Underrun { count },
                _ => Note::Other,
            });
        });
        notes
    }
}

#[test]
fn without_a_pedalboard_output_is_silence() {
    let mut h = Harness::new();
    let out = h.run_block(0.8);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn pedalboard_swap_releases_previous_exactly_once() {
    let mut h = Harness::new();
    let (first, _) = h.gain_board(1.0);
    let first_address = &*first as *const _ as usize;
    assert!(h.commands.set_pedalboard(first).is_ok());
    h.run_block(0.0);
    assert!(h.drain().is_empty(), "nothing to release yet");

    let (second, _) = h.gain_board(0.5);
    assert!(h.commands.set_pedalboard(second).is_ok());
    let out = h.run_block(1.0);
    // The swap is a barrier: the new board processed this block.
    assert!((out[FRAMES - 1] - 0.5).abs() < 1e-6);

    let releases: Vec<_> = h
        .drain()
        .into_iter()
        .filter(|n| matches!(n, Note::ReleasedPedalboard(_)))
        .collect();
    assert_eq!(releases, vec![Note::ReleasedPedalboard(first_address)]);

    // Further blocks release nothing else.
    h.run_block(0.0);
    assert!(h
        .drain()
        .iter()
        .all(|n| !matches!(n, Note::ReleasedPedalboard(_))));
}

#[test]
fn set_control_is_visible_in_the_next_block() {
    let mut h = Harness::new();
    let (board, id) = h.gain_board(1.0);
    assert!(h.commands.set_pedalboard(board).is_ok());
    let out = h.run_block(1.0);
    assert!((out[0] - 1.0).abs() < 1e-6);

    h.commands.set_control(id, "gain", 0.5).unwrap();
    let out = h.run_block(1.0);
    // Applied at the block boundary: every sample of this block sees it.
    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
}

#[test]
fn load_preset_sets_every_control() {
    let mut h = Harness::new();
    let (board, id) = h.gain_board(1.0);
    assert!(h.commands.set_pedalboard(board).is_ok());
    h.run_block(0.0);

    h.commands
        .load_preset(id, [("gain", 0.25f32)].iter().map(|(s, v)| (*s, *v)))
        .unwrap();
    let out = h.run_block(1.0);
    assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
}

#[test]
fn patch_set_then_get_resolves_with_the_value() {
    let mut h = Harness::new();
    let (board, id) = h.gain_board(1.0);
    let label = h.urids.map(GAIN_LABEL_PROPERTY);
    assert!(h.commands.set_pedalboard(board).is_ok());
    h.run_block(0.0);
    h.drain();

    let payload = atom::json_to_payload(&serde_json::json!("crunch"));
    h.commands.patch_set(id, label, &payload).unwrap();
    h.commands.patch_get(id, label, 77, 48_000).unwrap();
    h.run_block(0.0);

    let notes = h.drain();
    assert!(
        notes.contains(&Note::PatchReply {
            request_id: 77,
            payload: payload.clone(),
        }),
        "expected a patch reply, got {notes:?}"
    );
    // The patch-set also marked state dirty.
    assert!(notes.contains(&Note::StateMaybeChanged { instance_id: id }));
}

#[test]
fn patch_get_for_unanswered_property_times_out() {
    let mut h = Harness::new();
    let (board, id) = h.gain_board(1.0);
    let unknown = h.urids.map("urn:x:not-a-property");
    assert!(h.commands.set_pedalboard(board).is_ok());
    h.run_block(0.0);

    // Deadline of two blocks.
    h.commands
        .patch_get(id, unknown, 99, (FRAMES * 2) as u64)
        .unwrap();
    h.run_block(0.0);
    h.run_block(0.0);
    h.run_block(0.0);

    let notes = h.drain();
    assert!(notes.contains(&Note::PatchTimeout { request_id: 99 }));
}

#[test]
fn patch_get_for_unknown_instance_answers_immediately() {
    let mut h = Harness::new();
    let (board, _) = h.gain_board(1.0);
    assert!(h.commands.set_pedalboard(board).is_ok());
    h.run_block(0.0);

    h.commands.patch_get(9999, 1, 5, 48_000).unwrap();
    h.run_block(0.0);
    assert!(h.drain().contains(&Note::PatchTimeout { request_id: 5 }));
}

#[test]
fn monitor_subscription_fires_at_its_interval() {
    let mut h = Harness::new();
    let (board, id) = h.gain_board(1.0);
    assert!(h.commands.set_pedalboard(board).is_ok());

    // out_level is control index 1 on the gain plugin.
    let list = MonitorSubscriptionList::new(vec![MonitorSubscription {
        subscription_id: 42,
        instance_id: id,
        control_index: 1,
        interval_frames: (FRAMES * 4) as u32,
        frames_accum: 0,
    }]);
    assert!(h
        .commands
        .set_monitor_subscriptions(Some(Box::new(list)))
        .is_ok());

    for _ in 0..10 {
        h.run_block(0.5);
    }
    let updates: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|n| match n {
            Note::Monitor {
                subscription_id,
                value,
            } => Some((subscription_id, value)),
            _ => None,
        })
        .collect();
    // 10 blocks / interval of 4 blocks -> 2 updates.
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|&(id, _)| id == 42));
    assert!(updates.iter().all(|&(_, v)| (v - 0.5).abs() < 0.05));
}

#[test]
fn vu_batches_cover_buses_and_report_levels() {
    let mut h = Harness::new();
    let (board, _) = h.gain_board(0.5);
    assert!(h.commands.set_pedalboard(board).is_ok());

    let list = VuSubscriptionList::new([OUTPUT_BUS_INSTANCE_ID], (FRAMES * 2) as u32);
    assert!(h.commands.set_vu_subscriptions(Some(Box::new(list))).is_ok());

    for _ in 0..4 {
        h.run_block(1.0);
    }
    let vu: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|n| match n {
            Note::Vu {
                instance_id,
                peak_left,
            } => Some((instance_id, peak_left)),
            _ => None,
        })
        .collect();
    assert_eq!(vu.len(), 2);
    assert!(vu
        .iter()
        .all(|&(id, peak)| id == OUTPUT_BUS_INSTANCE_ID && (peak - 0.5).abs() < 1e-6));
}

#[test]
fn shutdown_command_raises_the_flag() {
    let mut h = Harness::new();
    assert!(!h.processor.shutdown_requested());
    h.commands.shutdown().unwrap();
    h.run_block(0.0);
    assert!(h.processor.shutdown_requested());
}

#[test]
fn underruns_are_counted_and_reported() {
    let mut h = Harness::new();
    h.processor.on_underrun();
    h.processor.on_underrun();
    let notes = h.drain();
    assert_eq!(
        notes,
        vec![Note::Underrun { count: 1 }, Note::Underrun { count: 2 }]
    );
}
