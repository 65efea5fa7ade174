//! Per-connection outbound queue and ref allocator.

use crate::codec::OutboundFrame;

/// Frames queued by a handler during one event, flushed by the supervisor
/// right after the handler returns.
///
/// One `Outbox` exists per connection generation; refs start at 1 and grow
/// monotonically for the lifetime of that connection.
#[derive(Debug)]
pub struct Outbox {
    generation: u64,
    last_ref: u64,
    queued: Vec<OutboundFrame>,
}

impl Outbox {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            last_ref: 0,
            queued: Vec::new(),
        }
    }

    /// Connection generation this outbox belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn next_ref(&mut self) -> u64 {
        self.last_ref += 1;
        self.last_ref
    }

    /// Queue a join; returns its ref.
    pub fn join(&mut self, topic: String) -> u64 {
        let reference = self.next_ref();
        self.queued.push(OutboundFrame::join(topic, reference));
        reference
    }

    /// Queue a leave for a topic joined under `join_ref`; returns its ref.
    pub fn leave(&mut self, topic: String, join_ref: u64) -> u64 {
        let reference = self.next_ref();
        self.queued.push(OutboundFrame::leave(topic, reference, join_ref));
        reference
    }

    pub fn heartbeat(&mut self) -> u64 {
        let reference = self.next_ref();
        self.queued.push(OutboundFrame::heartbeat(reference));
        reference
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.queued)
    }
}
