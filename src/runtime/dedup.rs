//! Per-recipient message deduplication.
//!
//! Keys are `(episode_id, msg_id)` scoped to one recipient. Entries age out
//! by TTL and by capacity (oldest first); a duplicate never drops the
//! original, only the duplicate enqueue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct RecipientWindow {
    seen: HashSet<(String, String)>,
    order: VecDeque<((String, String), Instant)>,
}

impl RecipientWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub struct DedupStore {
    windows: HashMap<String, RecipientWindow>,
    capacity: usize,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Record `key` for `recipient`. Returns true when the key was already
    /// present (the caller is looking at a duplicate).
    pub fn check_and_record(&mut self, recipient: &str, key: (String, String), now: Instant) -> bool {
        let window = self
            .windows
            .entry(recipient.to_string())
            .or_insert_with(RecipientWindow::new);

        // Age out expired entries first so a stale key does not flag a
        // legitimate re-send as duplicate.
        while let Some((entry_key, inserted)) = window.order.front() {
            if now.duration_since(*inserted) > self.ttl {
                window.seen.remove(entry_key);
                window.order.pop_front();
            } else {
                break;
            }
        }

        if window.seen.contains(&key) {
            return true;
        }

        if window.order.len() >= self.capacity {
            if let Some((evicted, _)) = window.order.pop_front() {
                window.seen.remove(&evicted);
            }
        }
        window.seen.insert(key.clone());
        window.order.push_back((key, now));
        false
    }

    #[cfg(test)]
    fn len(&self, recipient: &str) -> usize {
        self.windows.get(recipient).map_or(0, |w| w.order.len())
    }
}
