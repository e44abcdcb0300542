//! Cooperative timer queue.
//!
//! The stack is single-threaded: the only suspension points are TCP
//! retransmission timers and deferred callback fires, both of which land
//! here. The embedding event loop drives the queue through
//! `Adapter::poll` on every iteration.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

pub type TimerTask = Box<dyn FnOnce()>;

struct Entry {
    deadline: Instant,
    id: u64,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap pops the earliest deadline first; ties run
// in scheduling order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct TimerQueue {
    next_id: u64,
    entries: BinaryHeap<Entry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            next_id: 0,
            entries: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, deadline: Instant, task: TimerTask) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry { deadline, id, task });
        id
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|e| e.deadline)
    }

    /// Remove and return every task due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerTask> {
        let mut due = Vec::new();
        while matches!(self.entries.peek(), Some(e) if e.deadline <= now) {
            due.push(self.entries.pop().expect("peeked entry").task);
        }
        due
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_due_tasks_run_in_deadline_order() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

        for (label, delay_ms) in [(2u8, 20u64), (1, 10), (3, 30)] {
            let order = order.clone();
            q.schedule(
                t0 + Duration::from_millis(delay_ms),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }

        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(10)));
        for task in q.take_due(t0 + Duration::from_millis(25)) {
            task();
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn test_same_deadline_runs_in_scheduling_order() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        for label in 0..5u8 {
            let order = order.clone();
            q.schedule(t0, Box::new(move || order.borrow_mut().push(label)));
        }
        for task in q.take_due(t0) {
            task();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }
}
