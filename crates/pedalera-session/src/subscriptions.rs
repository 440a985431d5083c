//! Host-side subscription registries.
//!
//! VU and monitor-port subscribers are registered here; each change
//! rebuilds the corresponding RT-side list, which the session hands over
//! whole (the RT side swaps lists at a block boundary and releases the old
//! one). Notification dispatch takes a snapshot of the matching callbacks
//! first, so a subscriber that unsubscribes from inside its own callback
//! never deadlocks or invalidates the iteration.

use std::sync::Arc;

use pedalera_rt::vu::{MonitorSubscription, MonitorSubscriptionList, VuSubscriptionList};
use pedalera_rt::VuUpdate;

pub type VuCallback = Arc<dyn Fn(&VuUpdate) + Send + Sync>;
pub type MonitorCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Opaque handle for a VU subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VuHandle(pub(crate) u64);

/// Opaque handle for a monitor-port subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle(pub(crate) u64);

pub(crate) struct VuSubscriber {
    pub handle: u64,
    pub instance_id: i64,
    pub callback: VuCallback,
}

pub(crate) struct MonitorSubscriber {
    pub handle: u64,
    pub instance_id: i64,
    /// Control index resolved against the plugin descriptor at subscribe
    /// time; descriptor port order is stable per URI.
    pub control_index: u32,
    pub interval_frames: u32,
    pub callback: MonitorCallback,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    pub vus: Vec<VuSubscriber>,
    pub monitors: Vec<MonitorSubscriber>,
}

impl SubscriptionRegistry {
    /// The RT-side VU list matching the current subscriber set, or `None`
    /// when nobody is listening.
    pub fn build_vu_list(&self, interval_frames: u32) -> Option<Box<VuSubscriptionList>> {
        if self.vus.is_empty() {
            return None;
        }
        let mut ids: Vec<i64> = self.vus.iter().map(|s| s.instance_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Some(Box::new(VuSubscriptionList::new(ids, interval_frames)))
    }

    /// The RT-side monitor list matching the current subscriber set.
    pub fn build_monitor_list(&self) -> Option<Box<MonitorSubscriptionList>> {
        if self.monitors.is_empty() {
            return None;
        }
        let entries = self
            .monitors
            .iter()
            .map(|s| MonitorSubscription {
                subscription_id: s.handle,
                instance_id: s.instance_id,
                control_index: s.control_index,
                interval_frames: s.interval_frames,
                frames_accum: 0,
            })
            .collect();
        Some(Box::new(MonitorSubscriptionList::new(entries)))
    }

    /// Snapshot the VU callbacks subscribed to `instance_id`.
    pub fn vu_snapshot(&self, instance_id: i64) -> Vec<VuCallback> {
        self.vus
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .map(|s| Arc::clone(&s.callback))
            .collect()
    }

    /// The monitor callback registered under `handle`, if it still exists.
    pub fn monitor_callback(&self, handle: u64) -> Option<MonitorCallback> {
        self.monitors
            .iter()
            .find(|s| s.handle == handle)
            .map(|s| Arc::clone(&s.callback))
    }
}
