use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    delay: Duration,
    last_update: Instant,
}

/// Per-cluster exponential backoff for failed specs.
#[derive(Debug)]
pub struct FailureBackoff {
    base: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FailureBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records another failure for `key`, doubling its delay up to the ceiling.
    pub fn next(&self, key: &str, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            delay: Duration::ZERO,
            last_update: now,
        });
        entry.delay = if entry.delay.is_zero() {
            self.base
        } else {
            (entry.delay * 2).min(self.max)
        };
        entry.last_update = now;
    }

    pub fn get(&self, key: &str) -> Duration {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.delay)
            .unwrap_or(Duration::ZERO)
    }

    /// Time left before `key` may be retried, if it is still backing off.
    pub fn remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        let elapsed = now.saturating_duration_since(entry.last_update);
        entry.delay.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let b = FailureBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
        let now = Instant::now();
        for _ in 0..3 {
            b.next("c-1", now);
        }
        assert_eq!(b.get("c-1"), Duration::from_secs(120));
        for _ in 0..10 {
            b.next("c-1", now);
        }
        assert_eq!(b.get("c-1"), Duration::from_secs(600));
    }

    #[test]
    fn window_closes_after_delay() {
        let b = FailureBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
        let now = Instant::now();
        b.next("c-1", now);
        assert_eq!(b.remaining("c-1", now + Duration::from_secs(10)), Some(Duration::from_secs(20)));
        assert_eq!(b.remaining("c-1", now + Duration::from_secs(30)), None);
        b.delete("c-1");
        assert_eq!(b.get("c-1"), Duration::ZERO);
        assert_eq!(b.remaining("c-2", now), None);
    }
}
