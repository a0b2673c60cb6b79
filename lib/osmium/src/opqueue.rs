//! The server's pending-write queue. The head owns the write grant; the
//! step tracks where the current operation stands.

use crate::{ConnId, Pid};
use std::collections::VecDeque;

/// Progress of the operation at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No write in flight.
    Ready,
    /// Grant issued; waiting for the writer's data.
    AwaitData,
    /// Data broadcast; waiting for acknowledgements from every arbiter.
    AwaitAck,
}

pub struct OpQueue {
    queue: VecDeque<(ConnId, Pid)>,
    pub step: Step,
}

impl OpQueue {
    pub fn new() -> OpQueue {
        OpQueue { queue: VecDeque::new(), step: Step::Ready }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// The current writer.
    #[inline]
    pub fn head(&self) -> Option<(ConnId, Pid)> {
        self.queue.front().copied()
    }

    pub fn enqueue(&mut self, conn: ConnId, pid: Pid) {
        self.queue.push_back((conn, pid));
    }

    /// Removes the completed head operation.
    pub fn dequeue(&mut self) -> (ConnId, Pid) {
        self.queue.pop_front().expect("dequeue on empty operation queue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut ops = OpQueue::new();
        ops.enqueue(3, 30);
        ops.enqueue(1, 10);
        ops.enqueue(2, 20);

        assert_eq!(ops.head(), Some((3, 30)));
        assert_eq!(ops.dequeue(), (3, 30));
        assert_eq!(ops.dequeue(), (1, 10));
        assert_eq!(ops.head(), Some((2, 20)));
        assert_eq!(ops.dequeue(), (2, 20));
        assert!(ops.is_empty());
    }

    #[test]
    fn test_starts_ready() {
        let ops = OpQueue::new();
        assert_eq!(ops.step, Step::Ready);
        assert!(ops.head().is_none());
    }

    #[test]
    #[should_panic(expected = "dequeue on empty")]
    fn test_dequeue_empty_panics() {
        OpQueue::new().dequeue();
    }
}
