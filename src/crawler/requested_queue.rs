use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::request::Request;

struct Entry {
    request: Request,
    deadline: Instant,
}

/// Requests dispatched to an agent and not yet answered, keyed by hash
#[derive(Default)]
pub struct RequestedQueue {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RequestedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a dispatched request until `now + timeout`.
    /// Returns false when the hash is already tracked.
    pub fn enqueue(&self, request: Request) -> bool {
        self.enqueue_at(request, Instant::now())
    }

    pub(crate) fn enqueue_at(&self, request: Request, now: Instant) -> bool {
        let deadline = now + Duration::from_millis(request.timeout());
        let mut entries = self.entries.lock();
        if entries.contains_key(request.hash()) {
            return false;
        }
        entries.insert(request.hash().to_string(), Entry { request, deadline });
        true
    }

    /// Remove and return the request with this hash, if tracked
    pub fn dequeue(&self, hash: &str) -> Option<Request> {
        self.entries.lock().remove(hash).map(|entry| entry.request)
    }

    /// Remove and return every request whose deadline has passed
    pub fn timeout_list(&self) -> Vec<Request> {
        self.timeout_list_at(Instant::now())
    }

    pub(crate) fn timeout_list_at(&self, now: Instant) -> Vec<Request> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(hash, _)| hash.clone())
            .collect();

        expired
            .iter()
            .filter_map(|hash| entries.remove(hash))
            .map(|entry| entry.request)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
