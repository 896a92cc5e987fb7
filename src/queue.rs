//! Prioritised send queues.
//!
//! Outbound work is spread over five queues drained in strict priority
//! order, plus a NoOp slot used by the idle loop. Within one queue order of
//! arrival is preserved; across queues priority always wins over age.

use std::collections::VecDeque;

use crate::message::Message;
use crate::node::query::QueryStage;

/// Scheduling class of an outbound item, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum SendQueue {
    /// Controller commands; always scheduled before anything else.
    Command = 0,
    /// Deferred messages released by a node waking up.
    WakeUp = 1,
    /// Ordinary requests.
    Send = 2,
    /// Node interrogation traffic.
    Query = 3,
    /// Periodic value refreshes.
    Poll = 4,
    /// Keep-alive probes from the idle loop.
    NoOp = 5,
}

impl SendQueue {
    /// Number of queues.
    pub const COUNT: usize = 6;

    /// All queues, highest priority first.
    pub const ORDERED: [SendQueue; SendQueue::COUNT] = [
        SendQueue::Command,
        SendQueue::WakeUp,
        SendQueue::Send,
        SendQueue::Query,
        SendQueue::Poll,
        SendQueue::NoOp,
    ];
}

/// One unit of work on a send queue.
#[derive(Debug)]
pub enum QueueItem {
    /// Transmit a message.
    Send(Message),
    /// A node finished an interrogation stage; advance its state machine.
    QueryStageComplete {
        /// Node whose stage completed.
        node_id: u8,
        /// The stage that completed.
        stage: QueryStage,
    },
}

impl QueueItem {
    /// Node this item concerns.
    pub fn target_node_id(&self) -> u8 {
        match self {
            QueueItem::Send(msg) => msg.target_node_id(),
            QueueItem::QueryStageComplete { node_id, .. } => *node_id,
        }
    }
}

/// The set of prioritised FIFOs. Guarded by the send mutex in the driver.
#[derive(Debug, Default)]
pub(crate) struct SendQueues {
    queues: [VecDeque<QueueItem>; SendQueue::COUNT],
}

impl SendQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the back of a queue.
    pub fn push(&mut self, queue: SendQueue, item: QueueItem) {
        self.queues[queue as usize].push_back(item);
    }

    /// Remove and return the frontmost item of the highest non-empty queue.
    pub fn pop_next(&mut self) -> Option<(SendQueue, QueueItem)> {
        for queue in SendQueue::ORDERED {
            if let Some(item) = self.queues[queue as usize].pop_front() {
                return Some((queue, item));
            }
        }
        None
    }

    /// Whether every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Number of items waiting on one queue.
    pub fn len(&self, queue: SendQueue) -> usize {
        self.queues[queue as usize].len()
    }

    /// Remove every item addressed to `node_id` from every queue, preserving
    /// per-queue order. Used when a node is discovered asleep.
    pub fn take_for_node(&mut self, node_id: u8) -> Vec<QueueItem> {
        let mut taken = Vec::new();
        for queue in &mut self.queues {
            let mut kept = VecDeque::with_capacity(queue.len());
            for item in queue.drain(..) {
                if item.target_node_id() == node_id {
                    taken.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *queue = kept;
        }
        taken
    }

    /// Drain everything, for shutdown.
    pub fn drain_all(&mut self) -> Vec<QueueItem> {
        let mut all = Vec::new();
        for queue in &mut self.queues {
            all.extend(queue.drain(..));
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_for(node_id: u8, tag: u8) -> QueueItem {
        let mut msg = Message::request(format!("test {tag}"), node_id, 0x13);
        msg.push(tag);
        QueueItem::Send(msg)
    }

    fn tag_of(item: &QueueItem) -> u8 {
        match item {
            QueueItem::Send(msg) => {
                let label = msg.label();
                label.rsplit(' ').next().unwrap().parse().unwrap()
            }
            _ => panic!("expected a Send item"),
        }
    }

    #[test]
    fn test_fifo_within_a_queue() {
        let mut queues = SendQueues::new();
        for tag in 0..5 {
            queues.push(SendQueue::Send, msg_for(1, tag));
        }

        for expected in 0..5 {
            let (queue, item) = queues.pop_next().unwrap();
            assert_eq!(queue, SendQueue::Send);
            assert_eq!(tag_of(&item), expected);
        }
        assert!(queues.is_empty());
    }

    #[test]
    fn test_priority_beats_age() {
        let mut queues = SendQueues::new();
        queues.push(SendQueue::Poll, msg_for(1, 0));
        queues.push(SendQueue::Query, msg_for(1, 1));
        queues.push(SendQueue::Send, msg_for(1, 2));
        queues.push(SendQueue::Command, msg_for(1, 3));

        let order: Vec<SendQueue> = std::iter::from_fn(|| queues.pop_next().map(|(q, _)| q))
            .collect();
        assert_eq!(
            order,
            vec![
                SendQueue::Command,
                SendQueue::Send,
                SendQueue::Query,
                SendQueue::Poll
            ]
        );
    }

    #[test]
    fn test_take_for_node_preserves_order() {
        let mut queues = SendQueues::new();
        queues.push(SendQueue::Send, msg_for(7, 0));
        queues.push(SendQueue::Send, msg_for(3, 1));
        queues.push(SendQueue::Send, msg_for(7, 2));
        queues.push(
            SendQueue::Query,
            QueueItem::QueryStageComplete {
                node_id: 7,
                stage: QueryStage::ProtocolInfo,
            },
        );

        let taken = queues.take_for_node(7);
        assert_eq!(taken.len(), 3);
        assert_eq!(tag_of(&taken[0]), 0);
        assert_eq!(tag_of(&taken[1]), 2);
        assert!(matches!(
            taken[2],
            QueueItem::QueryStageComplete { node_id: 7, .. }
        ));

        // The unrelated node's message stays put.
        let (_, remaining) = queues.pop_next().unwrap();
        assert_eq!(remaining.target_node_id(), 3);
        assert!(queues.is_empty());
    }
}
