//! Subscriber id allocation

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one logical subscription to a config key
pub type SubscriberId = u64;

/// Monotonic subscriber id allocator.
///
/// Each config client owns its own allocator, so ids are unique per client
/// and never reused while the client lives.
#[derive(Debug, Default)]
pub struct SubscriberIds {
    last: AtomicU64,
}

impl SubscriberIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id (the first id is 1)
    pub fn next(&self) -> SubscriberId {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_monotonic() {
        let ids = SubscriberIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = Arc::new(SubscriberIds::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
