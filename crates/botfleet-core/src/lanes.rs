use std::collections::HashMap;

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::domain::SenderId;

const PRUNE_THRESHOLD: usize = 256;

/// Per-sender ordering lanes for one session.
///
/// `enqueue` runs synchronously in receive order and hands back a ticket that
/// waits for the previous message from the same sender. Lanes for different
/// senders never wait on each other.
#[derive(Default)]
pub struct SenderLanes {
    tails: HashMap<SenderId, oneshot::Receiver<()>>,
}

/// Position of one message in its sender's lane.
pub struct LaneTicket {
    prev: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

/// Held while a message is being handled; dropping it releases the next one.
pub struct LaneGuard {
    _done: oneshot::Sender<()>,
}

impl SenderLanes {
    pub fn enqueue(&mut self, sender: &SenderId) -> LaneTicket {
        if self.tails.len() >= PRUNE_THRESHOLD {
            self.prune();
        }
        let (done, tail) = oneshot::channel();
        let prev = self.tails.insert(sender.clone(), tail);
        LaneTicket { prev, done }
    }

    /// Drop lanes whose last message already finished.
    fn prune(&mut self) {
        self.tails
            .retain(|_, rx| matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}

impl LaneTicket {
    /// Wait until every earlier message from this sender has been handled
    /// (or its task was dropped).
    pub async fn acquire(self) -> LaneGuard {
        if let Some(prev) = self.prev {
            let _ = prev.await;
        }
        LaneGuard { _done: self.done }
    }
}
