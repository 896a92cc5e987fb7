//! Wake-up state for battery-powered nodes.
//!
//! Non-listening devices sleep between wake-up intervals. While a node is
//! asleep its outbound messages are parked on the deferred queue owned
//! here; a wake-up notification releases them back onto the main queues.
//! The scheduler depends on this state, which is why it is built into the
//! core rather than supplied by the embedder.

use std::collections::VecDeque;

use crate::core::constants::{COMMAND_CLASS_WAKE_UP, FUNC_ID_APPLICATION_COMMAND_HANDLER, WAKE_UP_INTERVAL_GET, WAKE_UP_INTERVAL_REPORT};
use crate::message::Message;
use crate::queue::QueueItem;

/// Per-node wake-up bookkeeping: the awake flag, the configured interval,
/// and the deferred message queue.
#[derive(Debug, Default)]
pub struct WakeUpState {
    awake: bool,
    poll_required: bool,
    interval_secs: Option<u32>,
    pending: VecDeque<QueueItem>,
}

impl WakeUpState {
    /// Fresh state. Nodes are assumed awake until a failed delivery or an
    /// explicit sleep proves otherwise, so that interrogation can start
    /// immediately after inclusion.
    pub fn new() -> Self {
        Self {
            awake: true,
            poll_required: false,
            interval_secs: None,
            pending: VecDeque::new(),
        }
    }

    /// Whether the node is currently believed awake.
    pub fn is_awake(&self) -> bool {
        self.awake
    }

    /// Record the node as awake or asleep.
    pub fn set_awake(&mut self, awake: bool) {
        self.awake = awake;
    }

    /// Park an item until the node next wakes.
    pub fn queue_item(&mut self, item: QueueItem) {
        self.pending.push_back(item);
    }

    /// Release all deferred items, in their original order.
    pub fn take_pending(&mut self) -> Vec<QueueItem> {
        self.pending.drain(..).collect()
    }

    /// Number of deferred items.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ask for a poll when the node next wakes.
    pub fn set_poll_required(&mut self) {
        self.poll_required = true;
    }

    /// Consume the poll-required mark.
    pub fn take_poll_required(&mut self) -> bool {
        std::mem::take(&mut self.poll_required)
    }

    /// Reported wake-up interval, once known.
    pub fn interval_secs(&self) -> Option<u32> {
        self.interval_secs
    }

    /// Record the interval from a Wake-Up Interval Report.
    pub fn set_interval_secs(&mut self, secs: u32) {
        self.interval_secs = Some(secs);
    }
}

/// Build the Wake-Up Interval Get request for the interrogation pipeline.
pub(crate) fn interval_get(node_id: u8) -> Message {
    Message::send_data(
        "Wake-up Interval Get",
        node_id,
        &[COMMAND_CLASS_WAKE_UP, WAKE_UP_INTERVAL_GET],
    )
    .expect_reply(FUNC_ID_APPLICATION_COMMAND_HANDLER)
    .expect_command_class(COMMAND_CLASS_WAKE_UP)
}

/// Extract the interval from a Wake-Up Interval Report payload
/// (`data` starts at the command byte).
pub(crate) fn parse_interval_report(data: &[u8]) -> Option<u32> {
    if data.len() < 4 || data[0] != WAKE_UP_INTERVAL_REPORT {
        return None;
    }
    Some(((data[1] as u32) << 16) | ((data[2] as u32) << 8) | data[3] as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::query::QueryStage;

    #[test]
    fn test_starts_awake_and_empty() {
        let state = WakeUpState::new();
        assert!(state.is_awake());
        assert_eq!(state.pending_len(), 0);
        assert!(state.interval_secs().is_none());
    }

    #[test]
    fn test_pending_preserves_order() {
        let mut state = WakeUpState::new();
        state.set_awake(false);

        for tag in 0..3u8 {
            let mut msg = Message::request(format!("m{tag}"), 7, 0x13);
            msg.push(tag);
            state.queue_item(QueueItem::Send(msg));
        }
        state.queue_item(QueueItem::QueryStageComplete {
            node_id: 7,
            stage: QueryStage::WakeUp,
        });

        let released = state.take_pending();
        assert_eq!(released.len(), 4);
        for (i, item) in released.iter().take(3).enumerate() {
            match item {
                QueueItem::Send(msg) => assert_eq!(msg.label(), format!("m{i}")),
                _ => panic!("expected Send items first"),
            }
        }
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_poll_required_is_consumed() {
        let mut state = WakeUpState::new();
        assert!(!state.take_poll_required());
        state.set_poll_required();
        assert!(state.take_poll_required());
        assert!(!state.take_poll_required());
    }

    #[test]
    fn test_parse_interval_report() {
        // WAKE_UP_INTERVAL_REPORT, interval 0x000e10 (3600 s), capability byte
        assert_eq!(
            parse_interval_report(&[WAKE_UP_INTERVAL_REPORT, 0x00, 0x0e, 0x10]),
            Some(3600)
        );
        assert_eq!(parse_interval_report(&[WAKE_UP_INTERVAL_REPORT, 0x00]), None);
        assert_eq!(parse_interval_report(&[0x04, 0x00, 0x0e, 0x10]), None);
    }
}
