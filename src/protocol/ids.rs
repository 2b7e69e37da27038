use std::sync::atomic::{AtomicU64, Ordering};

/// Source of correlation ids.
///
/// Ids must be unique for the lifetime of the issuing context. Injected so
/// tests can use a deterministic sequence.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Monotonic counter plus a random suffix.
///
/// The counter alone is unique within one process; the suffix keeps two
/// contexts (or a restarted context) from colliding on the same counter value.
pub struct SequentialIdSource {
    counter: AtomicU64,
    randomized: bool,
}

impl SequentialIdSource {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            randomized: true,
        }
    }

    /// Counter-only ids (`"1"`, `"2"`, ...) for reproducible tests.
    pub fn deterministic() -> Self {
        Self {
            counter: AtomicU64::new(0),
            randomized: false,
        }
    }
}

impl Default for SequentialIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SequentialIdSource {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self.randomized {
            let suffix = rand::random::<u32>();
            format!("{n}-{suffix:08x}")
        } else {
            n.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn deterministic_ids_count_up() {
        let ids = SequentialIdSource::deterministic();
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
    }

    #[test]
    fn randomized_ids_are_unique_and_ordered_by_counter() {
        let ids = SequentialIdSource::new();
        let generated: Vec<String> = (0..1000).map(|_| ids.next_id()).collect();
        let unique: HashSet<&String> = generated.iter().collect();
        assert_eq!(unique.len(), generated.len());
        assert!(generated[0].starts_with("1-"));
        assert!(generated[999].starts_with("1000-"));
    }

    #[test]
    fn two_sources_share_counter_but_not_suffix() {
        let a = SequentialIdSource::new();
        let b = SequentialIdSource::new();
        let first_a = a.next_id();
        let first_b = b.next_id();
        assert_eq!(first_a.split('-').next(), first_b.split('-').next());
        assert_ne!(first_a, first_b);
    }
}
