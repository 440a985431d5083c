//! Outstanding patch-request tracking.
//!
//! Every `patch get` the session sends is recorded here until it completes
//! with a value, an error, or a timeout. Completion is guaranteed: the RT
//! side answers or times out each request, the table enforces a host-side
//! fallback deadline in case the audio thread dies, and close/disconnect
//! paths fail whatever is left.

use std::collections::HashMap;
use std::time::Instant;

use pedalera_core::Urid;

use crate::SessionError;

pub type SuccessCallback = Box<dyn FnOnce(serde_json::Value) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(SessionError) + Send>;

/// Requests a single session tracks at once. Matches the RT-side pending
/// table so a queued request always has a slot on both sides.
pub const MAX_OUTSTANDING: usize = pedalera_rt::MAX_PENDING_PATCHES;

pub struct OutstandingRequest {
    pub client_id: u64,
    pub instance_id: i64,
    pub property: Urid,
    /// Host-side fallback deadline; the RT deadline is authoritative.
    pub fallback_deadline: Instant,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

#[derive(Default)]
pub struct RequestTable {
    next_id: u64,
    entries: HashMap<u64, OutstandingRequest>,
}

/// A completed request's callbacks, invoked by the caller after unlocking.
pub enum Completion {
    Success(SuccessCallback, serde_json::Value),
    Error(ErrorCallback, SessionError),
}

impl Completion {
    /// Invoke the stored callback.
    pub fn deliver(self) {
        match self {
            Completion::Success(callback, value) => callback(value),
            Completion::Error(callback, error) => callback(error),
        }
    }
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Allocate a request id; a full table hands the callbacks back so the
    /// caller can fail the request with `Overloaded`.
    pub fn insert(
        &mut self,
        client_id: u64,
        instance_id: i64,
        property: Urid,
        fallback_deadline: Instant,
        on_success: SuccessCallback,
        on_error: ErrorCallback,
    ) -> std::result::Result<u64, (SuccessCallback, ErrorCallback)> {
        if self.entries.len() >= MAX_OUTSTANDING {
            return Err((on_success, on_error));
        }
        let request_id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            request_id,
            OutstandingRequest {
                client_id,
                instance_id,
                property,
                fallback_deadline,
                on_success: Some(on_success),
                on_error: Some(on_error),
            },
        );
        Ok(request_id)
    }

    /// Remove a request immediately after a failed enqueue.
    pub fn abort(&mut self, request_id: u64) -> Option<Completion> {
        let mut entry = self.entries.remove(&request_id)?;
        entry
            .on_error
            .take()
            .map(|cb| Completion::Error(cb, SessionError::Overloaded))
    }

    pub fn complete_success(
        &mut self,
        request_id: u64,
        value: serde_json::Value,
    ) -> Option<Completion> {
        let mut entry = self.entries.remove(&request_id)?;
        entry
            .on_success
            .take()
            .map(|cb| Completion::Success(cb, value))
    }

    pub fn complete_error(&mut self, request_id: u64, error: SessionError) -> Option<Completion> {
        let mut entry = self.entries.remove(&request_id)?;
        entry.on_error.take().map(|cb| Completion::Error(cb, error))
    }

    /// Fail every request a disconnected client still has in flight.
    pub fn cancel_client(&mut self, client_id: u64) -> Vec<Completion> {
        self.drain_matching(|entry| entry.client_id == client_id, || SessionError::ClientGone)
    }

    /// Fail every request; used when the pedalboard is superseded or the
    /// session closes.
    pub fn fail_all(&mut self, error: impl Fn() -> SessionError) -> Vec<Completion> {
        self.drain_matching(|_| true, error)
    }

    /// Requests whose host-side fallback deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Completion> {
        self.drain_matching(
            |entry| entry.fallback_deadline <= now,
            || SessionError::Timeout,
        )
    }

    fn drain_matching(
        &mut self,
        matches: impl Fn(&OutstandingRequest) -> bool,
        error: impl Fn() -> SessionError,
    ) -> Vec<Completion> {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches(entry))
            .map(|(&id, _)| id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.complete_error(id, error()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn callbacks(
        successes: &Arc<AtomicU32>,
        errors: &Arc<AtomicU32>,
    ) -> (SuccessCallback, ErrorCallback) {
        let s = Arc::clone(successes);
        let e = Arc::clone(errors);
        (
            Box::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn request_completes_exactly_once() {
        let successes = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let mut table = RequestTable::new();
        let (on_success, on_error) = callbacks(&successes, &errors);
        let id = table
            .insert(
                1,
                2,
                3,
                Instant::now() + Duration::from_secs(1),
                on_success,
                on_error,
            )
            .ok()
            .unwrap();

        table
            .complete_success(id, serde_json::json!(42))
            .unwrap()
            .deliver();
        assert!(table.complete_error(id, SessionError::Timeout).is_none());
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let successes = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let mut table = RequestTable::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        for _ in 0..MAX_OUTSTANDING {
            let (s, e) = callbacks(&successes, &errors);
            assert!(table.insert(1, 1, 1, deadline, s, e).is_ok());
        }
        let (s, e) = callbacks(&successes, &errors);
        let (_, on_error) = table.insert(1, 1, 1, deadline, s, e).unwrap_err();
        on_error(SessionError::Overloaded);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_disconnect_cancels_only_its_requests() {
        let successes = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let mut table = RequestTable::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let (s, e) = callbacks(&successes, &errors);
        assert!(table.insert(1, 1, 1, deadline, s, e).is_ok());
        let (s, e) = callbacks(&successes, &errors);
        let kept = table.insert(2, 1, 1, deadline, s, e).ok().unwrap();

        for completion in table.cancel_client(1) {
            completion.deliver();
        }
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
        assert!(table
            .complete_success(kept, serde_json::json!(null))
            .is_some());
    }

    #[test]
    fn expiry_uses_the_fallback_deadline() {
        let successes = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let mut table = RequestTable::new();
        let (s, e) = callbacks(&successes, &errors);
        assert!(table
            .insert(1, 1, 1, Instant::now() - Duration::from_millis(1), s, e)
            .is_ok());
        let expired = table.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        for completion in expired {
            completion.deliver();
        }
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 0);
    }
}
