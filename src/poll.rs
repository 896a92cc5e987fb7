//! Periodic value polling.
//!
//! A rotating list of value identifiers is swept once per poll interval: the
//! front entry moves to the back, the sleep between entries is
//! `interval / list length`, and sleeping nodes are marked for a poll on
//! their next wake-up instead of being queued directly.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;

use crate::driver::DriverInner;
use crate::queue::SendQueue;

/// Identifies one pollable value: a command-class datum on a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId {
    /// Node the value lives on.
    pub node_id: u8,
    /// Command class owning the value.
    pub class_id: u8,
    /// Instance of the command class.
    pub instance: u8,
    /// Index within the instance.
    pub index: u8,
}

/// The rotating poll list. Guarded by the poll mutex in the driver.
#[derive(Debug, Default)]
pub(crate) struct PollList {
    entries: VecDeque<ValueId>,
}

impl PollList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value. Adding a value already present is a successful no-op.
    pub fn insert(&mut self, value_id: ValueId) {
        if !self.contains(value_id) {
            self.entries.push_back(value_id);
        }
    }

    /// Remove a value. Returns whether it was present.
    pub fn remove(&mut self, value_id: ValueId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|v| *v != value_id);
        self.entries.len() != before
    }

    pub fn contains(&self, value_id: ValueId) -> bool {
        self.entries.iter().any(|v| *v == value_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Take the front entry and move it to the back.
    pub fn rotate(&mut self) -> Option<ValueId> {
        let front = self.entries.pop_front()?;
        self.entries.push_back(front);
        Some(front)
    }
}

/// The poll task. Runs until shutdown is signalled.
pub(crate) async fn run(inner: Arc<DriverInner>, mut shutdown: watch::Receiver<bool>) {
    info!("poll task started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let interval = Duration::from_secs(inner.poll_interval_secs.load(Ordering::Relaxed) as u64);
        let mut sleep_for = interval;

        if inner.awake_nodes_queried.load(Ordering::Relaxed) {
            let next = {
                let mut list = inner.poll_list.lock().unwrap();
                let len = list.len();
                if len > 0 {
                    sleep_for = interval / len as u32;
                }
                list.rotate()
            };

            if let Some(value_id) = next {
                poll_value(&inner, value_id);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("poll task exiting");
}

/// Queue a refresh of one value, or mark a sleeping node for a poll on its
/// next wake-up.
fn poll_value(inner: &Arc<DriverInner>, value_id: ValueId) {
    let ctx = {
        let mut nodes = inner.nodes.write().unwrap();
        let Some(node) = nodes.get_mut(value_id.node_id) else {
            return;
        };

        if !node.is_listening() {
            if let Some(wake_up) = node.wake_up_mut() {
                if !wake_up.is_awake() {
                    debug!(
                        "node {:03}: asleep, poll of class 0x{:02x} deferred to next wake-up",
                        value_id.node_id, value_id.class_id
                    );
                    wake_up.set_poll_required();
                    return;
                }
            }
        }

        let queue_depth = inner.queues.lock().unwrap().len(SendQueue::Poll);
        debug!(
            "node {:03}: polling class 0x{:02x} index {} instance {} ({} poll messages queued)",
            value_id.node_id, value_id.class_id, value_id.index, value_id.instance, queue_depth
        );
        node.request_value(value_id)
    };

    inner.apply_class_context(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(node_id: u8, index: u8) -> ValueId {
        ValueId {
            node_id,
            class_id: 0x25,
            instance: 1,
            index,
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut list = PollList::new();
        list.insert(value(1, 0));
        list.insert(value(1, 0));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_remove_restores_prior_state() {
        let mut list = PollList::new();
        list.insert(value(1, 0));
        list.insert(value(2, 0));

        assert!(list.remove(value(2, 0)));
        assert_eq!(list.len(), 1);
        assert!(list.contains(value(1, 0)));

        // Removing again reports absence.
        assert!(!list.remove(value(2, 0)));
    }

    #[test]
    fn test_rotate_cycles_entries() {
        let mut list = PollList::new();
        list.insert(value(1, 0));
        list.insert(value(2, 0));
        list.insert(value(3, 0));

        assert_eq!(list.rotate().unwrap().node_id, 1);
        assert_eq!(list.rotate().unwrap().node_id, 2);
        assert_eq!(list.rotate().unwrap().node_id, 3);
        assert_eq!(list.rotate().unwrap().node_id, 1);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_rotate_empty() {
        let mut list = PollList::new();
        assert!(list.rotate().is_none());
    }
}
