use crate::types::Priority;
use std::collections::VecDeque;

/// Bounded priority queue: `critical > high > normal > low`, FIFO within a tier.
///
/// When full, the oldest item of the lowest non-empty tier makes room for the
/// incoming one, unless the incoming item ranks below everything queued, in
/// which case it is handed back instead.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    tiers: [VecDeque<T>; 4],
    len: usize,
    max_size: usize,
}

/// Result of a push into a full queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Overflow<T> {
    /// The incoming item was queued; this one was evicted to make room.
    Evicted(T),
    /// The incoming item was not queued.
    Rejected(T),
}

impl<T> PriorityQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            tiers: Default::default(),
            len: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Per-tier lengths, indexed by [`Priority`] (`low` first).
    pub fn len_by_priority(&self) -> [usize; 4] {
        [
            self.tiers[0].len(),
            self.tiers[1].len(),
            self.tiers[2].len(),
            self.tiers[3].len(),
        ]
    }

    fn lowest_nonempty(&self) -> Option<Priority> {
        Priority::DISPATCH_ORDER
            .iter()
            .rev()
            .copied()
            .find(|p| !self.tiers[p.index()].is_empty())
    }

    pub fn push(&mut self, priority: Priority, item: T) -> Option<Overflow<T>> {
        if self.len < self.max_size {
            self.tiers[priority.index()].push_back(item);
            self.len += 1;
            return None;
        }
        let Some(lowest) = self.lowest_nonempty() else {
            // Zero capacity.
            return Some(Overflow::Rejected(item));
        };
        if priority < lowest {
            return Some(Overflow::Rejected(item));
        }
        let evicted = self.tiers[lowest.index()].pop_front();
        self.tiers[priority.index()].push_back(item);
        evicted.map(Overflow::Evicted)
    }

    pub fn pop(&mut self) -> Option<T> {
        for p in Priority::DISPATCH_ORDER {
            if let Some(item) = self.tiers[p.index()].pop_front() {
                self.len -= 1;
                return Some(item);
            }
        }
        None
    }

    /// Remove the first item matching `pred`.
    pub fn remove_first(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(&mut pred) {
                self.len -= 1;
                return tier.remove(pos);
            }
        }
        None
    }

    /// Remove every item matching `pred`, preserving the order of the rest.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out = Vec::new();
        for tier in self.tiers.iter_mut() {
            let mut kept = VecDeque::with_capacity(tier.len());
            for item in tier.drain(..) {
                if pred(&item) {
                    out.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *tier = kept;
        }
        self.len -= out.len();
        out
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        self.drain_where(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut q = PriorityQueue::new(10);
        q.push(Priority::Normal, "n1");
        q.push(Priority::Low, "l1");
        q.push(Priority::Critical, "c1");
        q.push(Priority::Normal, "n2");
        q.push(Priority::High, "h1");
        let order: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(order, vec!["c1", "h1", "n1", "n2", "l1"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_full_queue_evicts_oldest_lowest() {
        let mut q = PriorityQueue::new(3);
        q.push(Priority::Low, "l1");
        q.push(Priority::Low, "l2");
        q.push(Priority::High, "h1");
        assert_eq!(q.push(Priority::Normal, "n1"), Some(Overflow::Evicted("l1")));
        assert_eq!(q.len(), 3);
        assert_eq!(q.len_by_priority(), [1, 1, 1, 0]);
    }

    #[test]
    fn test_same_tier_evicts_oldest() {
        let mut q = PriorityQueue::new(2);
        q.push(Priority::Normal, 1);
        q.push(Priority::Normal, 2);
        assert_eq!(q.push(Priority::Normal, 3), Some(Overflow::Evicted(1)));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_lower_incoming_is_rejected() {
        let mut q = PriorityQueue::new(2);
        q.push(Priority::High, "h1");
        q.push(Priority::Normal, "n1");
        assert_eq!(q.push(Priority::Low, "l1"), Some(Overflow::Rejected("l1")));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_never_evicts_higher_priority() {
        let mut q = PriorityQueue::new(4);
        for (i, p) in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
            .into_iter()
            .enumerate()
        {
            q.push(p, i);
        }
        for i in 10..20 {
            match q.push(Priority::Normal, i) {
                Some(Overflow::Evicted(v)) => assert!(v >= 2, "evicted a higher-priority item"),
                other => panic!("unexpected {:?}", other),
            }
            assert!(q.len() <= q.max_size());
        }
        assert_eq!(q.len_by_priority()[Priority::Critical.index()], 1);
        assert_eq!(q.len_by_priority()[Priority::High.index()], 1);
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let mut q = PriorityQueue::new(0);
        assert_eq!(q.push(Priority::Critical, 1), Some(Overflow::Rejected(1)));
    }

    #[test]
    fn test_remove_and_drain() {
        let mut q = PriorityQueue::new(10);
        for i in 0..6 {
            q.push(if i % 2 == 0 { Priority::Low } else { Priority::High }, i);
        }
        assert_eq!(q.remove_first(|v| *v == 3), Some(3));
        assert_eq!(q.remove_first(|v| *v == 42), None);
        let evens = q.drain_where(|v| v % 2 == 0);
        assert_eq!(evens, vec![0, 2, 4]);
        assert_eq!(q.len(), 2);
        assert_eq!(q.drain_all(), vec![1, 5]);
        assert!(q.is_empty());
    }
}
