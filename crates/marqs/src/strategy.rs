//! Queue selection: which child queue does a dequeue pull from?
//!
//! The parent "queue of queues" ZSET orders child queues by their oldest
//! member, so a candidate window taken from its head is a set of the
//! longest-waiting queues. The default strategy then makes a weighted random
//! choice across that window, biased toward queues with more concurrency
//! headroom and older heads, which keeps a single hot tenant from starving
//! everyone else.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// How many child queues the default strategy considers per dequeue.
pub const DEFAULT_QUEUE_SELECTION_COUNT: usize = 12;

/// Divisor applied to a queue head's age before it scales the queue's weight.
const AGE_NORMALIZER_MS: f64 = 1000.0;

/// A `(current, limit)` pair for one concurrency scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub current: u32,
    pub limit: u32,
}

impl Capacity {
    pub fn headroom(&self) -> i64 {
        self.limit as i64 - self.current as i64
    }
}

/// The three nested concurrency scopes of one child queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCapacities {
    pub queue: Capacity,
    pub env: Capacity,
    pub org: Capacity,
}

impl QueueCapacities {
    /// How many more messages this queue may have in flight before one of the
    /// queue/env/org ceilings is hit. May be negative if limits were lowered
    /// under load.
    pub fn available(&self) -> i64 {
        self.queue
            .headroom()
            .min(self.env.headroom())
            .min(self.org.headroom())
    }
}

/// One candidate child queue, scored for selection.
#[derive(Debug, Clone)]
pub struct QueueWithScores {
    /// The child queue key, as stored in the parent ZSET.
    pub queue: String,
    pub capacities: QueueCapacities,
    /// Age of the queue's oldest message, in ms, relative to "now".
    pub age_ms: i64,
}

/// An index window into the parent ZSET plus a correlation token for the
/// subsequent [`QueuePriorityStrategy::choose_queue`] call.
#[derive(Debug, Clone)]
pub struct CandidateSelection {
    pub range: RangeInclusive<isize>,
    pub selection_id: u64,
}

/// Picks a candidate window of child queues from a parent queue, then chooses
/// one queue from the scored candidates. The broker holds one instance per
/// parent path, and instances may be swapped for custom fairness policies.
pub trait QueuePriorityStrategy: Send + Sync {
    fn next_candidate_selection(&self, parent_queue: &str) -> CandidateSelection;

    /// Returns the chosen child queue key, or `None` when every candidate is
    /// at one of its concurrency ceilings (the dequeue must then abort).
    fn choose_queue(
        &self,
        queues: &[QueueWithScores],
        parent_queue: &str,
        selection_id: u64,
    ) -> Option<String>;
}

/// The default, age-aware weighted random strategy.
///
/// Weight per eligible candidate is `available * (1 + age_ms / normalizer)`;
/// saturated candidates are excluded outright. Candidates are ordered by
/// queue key before sampling so a seeded RNG selects deterministically.
pub struct SimpleWeightedChoiceStrategy {
    queue_selection_count: usize,
    next_selection_id: AtomicU64,
    rng: Mutex<SmallRng>,
    /// Rolling cursor: last (selection id, chosen index) per parent queue.
    /// Advisory only; losing it never affects correctness.
    cursors: Mutex<HashMap<String, (u64, usize)>>,
}

impl SimpleWeightedChoiceStrategy {
    pub fn new(queue_selection_count: usize) -> Self {
        Self {
            queue_selection_count,
            next_selection_id: AtomicU64::new(0),
            rng: Mutex::new(SmallRng::from_entropy()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// A deterministic instance for tests.
    pub fn with_seed(queue_selection_count: usize, seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            ..Self::new(queue_selection_count)
        }
    }

    fn weight(queue: &QueueWithScores) -> f64 {
        let available = queue.capacities.available() as f64;
        available * (1.0 + queue.age_ms.max(0) as f64 / AGE_NORMALIZER_MS)
    }
}

impl Default for SimpleWeightedChoiceStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SELECTION_COUNT)
    }
}

impl QueuePriorityStrategy for SimpleWeightedChoiceStrategy {
    fn next_candidate_selection(&self, _parent_queue: &str) -> CandidateSelection {
        CandidateSelection {
            range: 0..=(self.queue_selection_count as isize - 1),
            selection_id: self.next_selection_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn choose_queue(
        &self,
        queues: &[QueueWithScores],
        parent_queue: &str,
        selection_id: u64,
    ) -> Option<String> {
        let mut candidates: Vec<&QueueWithScores> = queues
            .iter()
            .filter(|q| q.capacities.available() > 0)
            .collect();
        candidates.sort_by(|a, b| a.queue.cmp(&b.queue));

        let distribution = WeightedIndex::new(candidates.iter().map(|q| Self::weight(q))).ok()?;
        let choice = {
            let mut rng = self.rng.lock().unwrap();
            distribution.sample(&mut *rng)
        };

        self.cursors
            .lock()
            .unwrap()
            .insert(parent_queue.to_string(), (selection_id, choice));

        Some(candidates[choice].queue.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn queue(key: &str, current: u32, limit: u32, age_ms: i64) -> QueueWithScores {
        QueueWithScores {
            queue: key.to_string(),
            capacities: QueueCapacities {
                queue: Capacity { current, limit },
                env: Capacity {
                    current: 0,
                    limit: 100,
                },
                org: Capacity {
                    current: 0,
                    limit: 300,
                },
            },
            age_ms,
        }
    }

    #[test]
    fn default_window_is_the_first_k_queues() {
        let strategy = SimpleWeightedChoiceStrategy::default();
        let selection = strategy.next_candidate_selection("sharedQueue");
        assert_eq!(selection.range, 0..=11);

        let next = strategy.next_candidate_selection("sharedQueue");
        assert_ne!(selection.selection_id, next.selection_id);
    }

    #[test]
    fn saturated_queues_are_excluded() {
        let strategy = SimpleWeightedChoiceStrategy::with_seed(12, 7);
        let queues = vec![queue("queue:e1:full:o:o1", 10, 10, 5000), queue("queue:e1:open:o:o1", 0, 10, 0)];

        for _ in 0..20 {
            let choice = strategy.choose_queue(&queues, "sharedQueue", 0);
            assert_eq!(choice.as_deref(), Some("queue:e1:open:o:o1"));
        }
    }

    #[test]
    fn all_saturated_yields_none() {
        let strategy = SimpleWeightedChoiceStrategy::with_seed(12, 7);
        let queues = vec![queue("queue:e1:a:o:o1", 10, 10, 0), queue("queue:e1:b:o:o1", 3, 3, 0)];
        assert_eq!(strategy.choose_queue(&queues, "sharedQueue", 0), None);
        assert_eq!(strategy.choose_queue(&[], "sharedQueue", 1), None);
    }

    #[test]
    fn env_and_org_ceilings_also_exclude() {
        let mut q = queue("queue:e1:a:o:o1", 0, 10, 0);
        q.capacities.env = Capacity {
            current: 100,
            limit: 100,
        };
        assert_eq!(q.capacities.available(), 0);

        let strategy = SimpleWeightedChoiceStrategy::with_seed(12, 7);
        assert_eq!(strategy.choose_queue(&[q], "sharedQueue", 0), None);
    }

    #[test]
    fn age_biases_the_choice() {
        let strategy = SimpleWeightedChoiceStrategy::with_seed(12, 42);
        let queues = vec![
            queue("queue:e1:old:o:o1", 0, 10, 600_000),
            queue("queue:e1:new:o:o1", 0, 10, 0),
        ];

        let mut old_wins = 0;
        for _ in 0..200 {
            if strategy.choose_queue(&queues, "sharedQueue", 0).as_deref()
                == Some("queue:e1:old:o:o1")
            {
                old_wins += 1;
            }
        }
        // Weight ratio is ~601:1; anything close to uniform means the age
        // term is broken.
        assert!(old_wins > 180, "old queue chosen only {old_wins}/200 times");
    }

    #[test]
    fn same_seed_same_choices() {
        let queues: Vec<_> = (0..5)
            .map(|ix| queue(&format!("queue:e1:q{ix}:o:o1"), 0, 10, 1000 * ix as i64))
            .collect();

        let a = SimpleWeightedChoiceStrategy::with_seed(12, 99);
        let b = SimpleWeightedChoiceStrategy::with_seed(12, 99);
        for _ in 0..50 {
            assert_eq!(
                a.choose_queue(&queues, "sharedQueue", 0),
                b.choose_queue(&queues, "sharedQueue", 0)
            );
        }
    }
}
