//! Group-addressed (CAB) traffic queues.
//!
//! Each interface buffers its group-addressed frames privately between
//! DTIMs; at a DTIM beacon the private queue is spliced onto the shared
//! post-beacon queue in one move.

use std::collections::VecDeque;

use bytes::Bytes;
use tbtt_core::VifId;

/// One buffered group-addressed frame.
#[derive(Debug, Clone)]
pub struct CabFrame {
    pub vif: VifId,
    pub payload: Bytes,
}

/// FIFO of pending CAB frames with transfer-preserving counters.
#[derive(Debug, Default)]
pub struct CabQueue {
    frames: VecDeque<CabFrame>,
    total_queued: u64,
    pending_bytes: u64,
}

impl CabQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: CabFrame) {
        self.total_queued += 1;
        self.pending_bytes += frame.payload.len() as u64;
        self.frames.push_back(frame);
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frames accepted over this queue's lifetime, including everything
    /// spliced in from other queues.
    pub fn total_queued(&self) -> u64 {
        self.total_queued
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Moves the entire contents of `other` to this queue's tail. Counters
    /// transfer with the frames and `other` is left empty.
    pub fn splice_from(&mut self, other: &mut CabQueue) {
        self.total_queued += other.total_queued;
        self.pending_bytes += other.pending_bytes;
        self.frames.append(&mut other.frames);
        other.total_queued = 0;
        other.pending_bytes = 0;
    }

    /// Empties the queue, handing every pending frame back to the caller.
    pub fn drain_all(&mut self) -> Vec<CabFrame> {
        self.pending_bytes = 0;
        self.frames.drain(..).collect()
    }

    pub fn pop(&mut self) -> Option<CabFrame> {
        let frame = self.frames.pop_front()?;
        self.pending_bytes -= frame.payload.len() as u64;
        Some(frame)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CabFrame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(vif: VifId, len: usize) -> CabFrame {
        CabFrame {
            vif,
            payload: Bytes::from(vec![0u8; len]),
        }
    }

    #[test]
    fn test_splice_moves_everything() {
        let mut shared = CabQueue::new();
        let mut group = CabQueue::new();
        shared.push(frame(1, 10));
        group.push(frame(2, 20));
        group.push(frame(2, 30));

        shared.splice_from(&mut group);

        assert_eq!(shared.depth(), 3);
        assert_eq!(shared.total_queued(), 3);
        assert_eq!(shared.pending_bytes(), 60);
        assert_eq!(group.depth(), 0);
        assert_eq!(group.total_queued(), 0);
        assert_eq!(group.pending_bytes(), 0);
        // order preserved: prior tail, then the spliced frames
        let order: Vec<_> = shared.iter().map(|f| f.payload.len()).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_drain_keeps_lifetime_counter() {
        let mut queue = CabQueue::new();
        queue.push(frame(1, 5));
        queue.push(frame(1, 5));
        let drained = queue.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.pending_bytes(), 0);
        assert_eq!(queue.total_queued(), 2);
    }

    #[test]
    fn test_pop_tracks_bytes() {
        let mut queue = CabQueue::new();
        queue.push(frame(1, 8));
        queue.push(frame(1, 4));
        assert_eq!(queue.pop().unwrap().payload.len(), 8);
        assert_eq!(queue.pending_bytes(), 4);
    }
}
