//! Multilevel queue: one FIFO per priority with wrap-around dequeue.
//!
//! The scheduler's ready queue. Dequeue starts at a given level and scans
//! upward (numerically) with wrap-around, so a weighted starting level
//! gives lower-numbered queues more frequent service without starving the
//! rest.

use crate::queue::{Fifo, LinkSlab};

pub struct MultilevelQueue {
    levels: Vec<Fifo>,
}

impl MultilevelQueue {
    pub fn new(levels: usize) -> Self {
        MultilevelQueue { levels: (0..levels).map(|_| Fifo::new()).collect() }
    }

    pub fn enqueue(&mut self, slab: &mut impl LinkSlab, level: usize, index: u32) {
        self.levels[level].push_back(slab, index);
    }

    /// Dequeue from the first non-empty level at or after `start`,
    /// wrapping around. Returns the index and the level it came from.
    pub fn dequeue_from(
        &mut self,
        slab: &mut impl LinkSlab,
        start: usize,
    ) -> Option<(u32, usize)> {
        let n = self.levels.len();
        for i in 0..n {
            let level = (start + i) % n;
            if let Some(index) = self.levels[level].pop_front(slab) {
                return Some((index, level));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(Fifo::is_empty)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(Fifo::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Link;

    struct Slab(Vec<Link>);

    impl LinkSlab for Slab {
        fn link(&self, i: u32) -> &Link {
            &self.0[i as usize]
        }
        fn link_mut(&mut self, i: u32) -> &mut Link {
            &mut self.0[i as usize]
        }
    }

    #[test]
    fn dequeue_wraps_around() {
        let mut slab = Slab(vec![Link::default(); 8]);
        let mut q = MultilevelQueue::new(4);
        q.enqueue(&mut slab, 1, 7);
        // Starting past the only occupied level must wrap to find it.
        assert_eq!(q.dequeue_from(&mut slab, 3), Some((7, 1)));
        assert_eq!(q.dequeue_from(&mut slab, 0), None);
    }

    #[test]
    fn prefers_start_level() {
        let mut slab = Slab(vec![Link::default(); 8]);
        let mut q = MultilevelQueue::new(4);
        q.enqueue(&mut slab, 0, 1);
        q.enqueue(&mut slab, 2, 2);
        assert_eq!(q.dequeue_from(&mut slab, 2), Some((2, 2)));
        assert_eq!(q.dequeue_from(&mut slab, 2), Some((1, 0)));
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn fifo_within_level() {
        let mut slab = Slab(vec![Link::default(); 8]);
        let mut q = MultilevelQueue::new(4);
        for i in [4, 5, 6] {
            q.enqueue(&mut slab, 0, i);
        }
        assert_eq!(q.dequeue_from(&mut slab, 0), Some((4, 0)));
        assert_eq!(q.dequeue_from(&mut slab, 0), Some((5, 0)));
        assert_eq!(q.dequeue_from(&mut slab, 0), Some((6, 0)));
    }
}
