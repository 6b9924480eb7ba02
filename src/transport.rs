//! The external transport. Pairwise message delivery between peers is out
//! of scope here — only the trait the core drives is specified; callers
//! supply their own concrete socket, queue, or in-process router.

use crate::message::Message;
use crate::types::NodeId;

/// Best-effort, unreliable send: may duplicate, reorder, or drop. The core
/// never blocks on it and never assumes a reply will arrive.
pub trait Transport: Send {
    fn send(&mut self, to: &NodeId, message: Message);
}

/// Transport that records sends instead of delivering them; used by tests
/// and by the in-process cluster harness to route messages deterministically.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<(NodeId, Message)>,
}

impl Transport for RecordingTransport {
    fn send(&mut self, to: &NodeId, message: Message) {
        self.sent.push((to.clone(), message));
    }
}

impl RecordingTransport {
    pub fn drain(&mut self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut self.sent)
    }
}
