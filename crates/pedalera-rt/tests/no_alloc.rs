//! The audio-thread contract: once a session is set up, a processed block
//! performs zero heap allocations - no matter what control traffic,
//! metering, or MIDI it has to handle.
//!
//! This test installs a counting global allocator and must therefore live
//! alone in its own test binary.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

struct CountingAllocator;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

use pedalera_core::builtin::GAIN_URI;
use pedalera_core::{Pedalboard, PluginRegistry, UridMap, OUTPUT_BUS_INSTANCE_ID};
use pedalera_midi::MidiEvent;
use pedalera_rt::{session_channels, RtPedalboardBuilder, VuSubscriptionList};

const FRAMES: usize = 64;

#[test]
fn processing_a_block_does_not_allocate() {
    let registry = PluginRegistry::with_builtins();
    let urids = UridMap::new();
    let (mut processor, mut commands, mut from_rt) = session_channels();

    let mut model = Pedalboard::new("rig");
    let id = model.push_plugin(GAIN_URI);
    let builder = RtPedalboardBuilder {
        registry: &registry,
        urids: &urids,
        sample_rate: 48000.0,
        max_frames: FRAMES,
        input_channels: 2,
    };
    let (board, errors) = builder.build(&model).unwrap();
    assert!(errors.is_empty());
    assert!(commands.set_pedalboard(board).is_ok());
    let list = VuSubscriptionList::new([OUTPUT_BUS_INSTANCE_ID, id], 128);
    assert!(commands.set_vu_subscriptions(Some(Box::new(list))).is_ok());

    let input = vec![0.25f32; FRAMES];
    let mut left = vec![0.0f32; FRAMES];
    let mut right = vec![0.0f32; FRAMES];
    let midi = [MidiEvent::new(0, &[0xB0, 7, 64])];

    // Warm-up blocks: the handover lands, activation runs, and scratch
    // buffers reach their high-water marks.
    for _ in 0..4 {
        let inputs = [input.as_slice(), input.as_slice()];
        let mut outputs = [left.as_mut_slice(), right.as_mut_slice()];
        processor.on_process(&inputs, &mut outputs, FRAMES, &midi);
    }
    // Keep steady-state control traffic flowing during the measured runs.
    commands.set_control(id, "gain", 0.75).unwrap();

    let before = ALLOCATIONS.load(Ordering::SeqCst);
    for _ in 0..64 {
        let inputs = [input.as_slice(), input.as_slice()];
        let mut outputs = [left.as_mut_slice(), right.as_mut_slice()];
        processor.on_process(&inputs, &mut outputs, FRAMES, &midi);
    }
    let after = ALLOCATIONS.load(Ordering::SeqCst);
    assert_eq!(
        after - before,
        0,
        "audio-thread block processing allocated {} times",
        after - before
    );

    // The blocks above really did process audio and emit metering.
    assert!((left[0] - 0.25 * 0.75).abs() < 1e-6);
    let mut saw_vu = false;
    while from_rt.read(|_, _| ()).is_some() {
        saw_vu = true;
    }
    assert!(saw_vu);
}
