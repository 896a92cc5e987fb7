//! Pluggable command-class handlers.
//!
//! The driver core routes Application Command Handler frames to handlers
//! keyed by command-class id, and asks them to issue interrogation and poll
//! requests. It never interprets class semantics itself; the one exception
//! is the wake-up class in [`wake_up`], whose awake/asleep state the
//! scheduler depends on.

pub mod wake_up;

use std::sync::Arc;

use crate::message::Message;
use crate::node::query::QueryStage;
use crate::notification::NotificationKind;
use crate::poll::ValueId;
use crate::queue::SendQueue;

/// Effects a handler may produce while the node table is locked.
///
/// Handlers run under the node lock, so instead of touching the driver
/// directly they record messages and notifications here; the driver applies
/// them once the lock is released.
#[derive(Debug)]
pub struct ClassContext {
    /// Node the frame or request concerns.
    pub node_id: u8,
    /// Network identifier, for notifications.
    pub home_id: u32,
    pub(crate) outgoing: Vec<(Message, SendQueue)>,
    pub(crate) notifications: Vec<NotificationKind>,
    pub(crate) completed_stages: Vec<QueryStage>,
}

impl ClassContext {
    pub(crate) fn new(node_id: u8, home_id: u32) -> Self {
        Self {
            node_id,
            home_id,
            outgoing: Vec::new(),
            notifications: Vec::new(),
            completed_stages: Vec::new(),
        }
    }

    /// Queue a message for transmission.
    pub fn send(&mut self, msg: Message, queue: SendQueue) {
        self.outgoing.push((msg, queue));
    }

    /// Report a refreshed value to the embedder.
    pub fn value_refreshed(&mut self, value_id: ValueId) {
        self.notifications.push(NotificationKind::Value { value_id });
    }

    /// Mark an interrogation stage of this node as complete.
    pub fn query_stage_complete(&mut self, stage: QueryStage) {
        self.completed_stages.push(stage);
    }
}

/// A decoder for one command class.
///
/// The driver needs nothing beyond frame routing and a small metadata
/// surface; per-class state lives inside the implementation. Handlers are
/// owned by the node table, which is shared between threads behind its
/// lock, hence the `Send + Sync` bound; mutation always happens through
/// the table's write lock.
pub trait CommandClass: Send + Sync {
    /// Command-class identifier this handler consumes.
    fn class_id(&self) -> u8;

    /// Class name for the log.
    fn name(&self) -> &'static str;

    /// Handle an inbound frame of this class. `data` starts at the command
    /// byte (the class id has already been consumed).
    fn handle_msg(&mut self, ctx: &mut ClassContext, data: &[u8], instance: u8);

    /// Issue the request(s) for an interrogation stage. Return `true` if a
    /// request was queued; the stage then completes when the handler calls
    /// [`ClassContext::query_stage_complete`] on the matching reply.
    fn request_state(&mut self, _ctx: &mut ClassContext, _stage: QueryStage) -> bool {
        false
    }

    /// Issue a refresh request for one value, for the poll loop. Return
    /// `true` if a request was queued.
    fn request_value(&mut self, _ctx: &mut ClassContext, _instance: u8, _index: u8) -> bool {
        false
    }
}

/// Factory producing handlers for the command classes a node advertises.
/// Classes the factory returns `None` for are routed nowhere.
pub type ClassFactory = Arc<dyn Fn(u8) -> Option<Box<dyn CommandClass>> + Send + Sync>;

/// Pass-through for frames captured in promiscuous mode.
pub type PromiscuousHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
