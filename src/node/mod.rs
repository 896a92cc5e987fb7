//! Node records and their interrogation state machine.

pub mod query;
pub(crate) mod table;

use std::collections::BTreeMap;

use log::{debug, info};

use crate::command_class::wake_up::{self, WakeUpState};
use crate::command_class::{ClassContext, ClassFactory, CommandClass};
use crate::config::NodeRecord;
use crate::core::constants::{
    BASIC_TYPE_CONTROLLER, BASIC_TYPE_STATIC_CONTROLLER, COMMAND_CLASS_MARK,
    COMMAND_CLASS_WAKE_UP, FUNC_ID_ZW_APPLICATION_UPDATE, FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO,
    FUNC_ID_ZW_REQUEST_NODE_INFO, NUM_NODE_BITFIELD_BYTES,
};
use crate::message::Message;
use crate::poll::ValueId;
use crate::queue::SendQueue;
use query::QueryStage;

/// What the interrogation planner decided for a node.
#[derive(Debug)]
pub(crate) enum QueryPlan {
    /// Nothing to do right now.
    Idle,
    /// Requests were issued; their effects are in the context.
    Send(ClassContext),
    /// The current stage had no work; the node advanced a stage.
    Advanced,
    /// The node just reached [`QueryStage::Complete`].
    Complete,
}

/// One Z-Wave node as the driver knows it.
pub struct Node {
    home_id: u32,
    node_id: u8,

    listening: bool,
    frequent_listening: bool,
    routing: bool,
    beaming: bool,
    security: bool,
    max_baud_rate: u32,
    protocol_version: u8,

    basic: u8,
    generic: u8,
    specific: u8,

    neighbors: [u8; NUM_NODE_BITFIELD_BYTES],

    query_stage: QueryStage,
    query_retries: u8,

    write_count: u32,

    /// Bridge mode: handheld button id -> virtual node id.
    button_map: BTreeMap<u8, u8>,

    wake_up: Option<WakeUpState>,
    class_ids: Vec<u8>,
    handlers: BTreeMap<u8, Box<dyn CommandClass>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("listening", &self.listening)
            .field("query_stage", &self.query_stage)
            .field("class_ids", &self.class_ids)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Fresh node record, created on first discovery.
    pub fn new(home_id: u32, node_id: u8) -> Self {
        Self {
            home_id,
            node_id,
            listening: true,
            frequent_listening: false,
            routing: false,
            beaming: false,
            security: false,
            max_baud_rate: 0,
            protocol_version: 0,
            basic: 0,
            generic: 0,
            specific: 0,
            neighbors: [0; NUM_NODE_BITFIELD_BYTES],
            query_stage: QueryStage::None,
            query_retries: 0,
            write_count: 0,
            button_map: BTreeMap::new(),
            wake_up: None,
            class_ids: Vec::new(),
            handlers: BTreeMap::new(),
        }
    }

    /// Rebuild a node from its persisted record.
    pub(crate) fn from_record(
        home_id: u32,
        record: &NodeRecord,
        factory: Option<&ClassFactory>,
    ) -> Self {
        let mut node = Self::new(home_id, record.node_id);
        node.listening = record.listening;
        node.frequent_listening = record.frequent_listening;
        node.routing = record.routing;
        node.beaming = record.beaming;
        node.security = record.security;
        node.max_baud_rate = record.max_baud_rate;
        node.protocol_version = record.protocol_version;
        node.basic = record.basic;
        node.generic = record.generic;
        node.specific = record.specific;
        node.query_stage = record.query_stage;
        for &class_id in &record.class_ids {
            node.add_command_class(class_id, factory);
        }
        if !node.listening && node.wake_up.is_none() {
            node.wake_up = Some(WakeUpState::new());
        }
        node
    }

    /// Snapshot for persistence.
    pub(crate) fn to_record(&self) -> NodeRecord {
        NodeRecord {
            node_id: self.node_id,
            listening: self.listening,
            frequent_listening: self.frequent_listening,
            routing: self.routing,
            beaming: self.beaming,
            security: self.security,
            max_baud_rate: self.max_baud_rate,
            protocol_version: self.protocol_version,
            basic: self.basic,
            generic: self.generic,
            specific: self.specific,
            query_stage: self.query_stage,
            class_ids: self.class_ids.clone(),
        }
    }

    /// The node's id on the network.
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Whether the node's receiver is always on.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether the node wakes on a short beam interval (FLiRS).
    pub fn is_frequent_listening(&self) -> bool {
        self.frequent_listening
    }

    /// Whether the node is a controller, judged by its basic device class.
    pub fn is_controller(&self) -> bool {
        self.basic == BASIC_TYPE_CONTROLLER || self.basic == BASIC_TYPE_STATIC_CONTROLLER
    }

    /// Whether messages for this node must be parked on its wake-up queue.
    pub(crate) fn should_defer_messages(&self) -> bool {
        if self.listening || self.frequent_listening || self.is_controller() {
            return false;
        }
        match &self.wake_up {
            Some(wake_up) => !wake_up.is_awake(),
            None => false,
        }
    }

    /// Wake-up state, for non-listening nodes.
    pub fn wake_up(&self) -> Option<&WakeUpState> {
        self.wake_up.as_ref()
    }

    pub(crate) fn wake_up_mut(&mut self) -> Option<&mut WakeUpState> {
        self.wake_up.as_mut()
    }

    /// Current interrogation stage.
    pub fn query_stage(&self) -> QueryStage {
        self.query_stage
    }

    /// Force the interrogation pipeline to `stage` and reset the retry count.
    pub(crate) fn set_query_stage(&mut self, stage: QueryStage) {
        debug!(
            "node {:03}: query stage set to {}",
            self.node_id,
            stage.name()
        );
        self.query_stage = stage;
        self.query_retries = 0;
    }

    /// Record that `stage` finished and advance past it.
    pub(crate) fn query_stage_complete(&mut self, stage: QueryStage) {
        if self.query_stage != stage {
            return;
        }
        let next = stage.next();
        debug!(
            "node {:03}: query stage {} complete, next {}",
            self.node_id,
            stage.name(),
            next.name()
        );
        self.query_stage = next;
        self.query_retries = 0;
    }

    /// Record a failure of the current stage. After `max_attempts` failures
    /// the stage is skipped rather than retried forever.
    pub(crate) fn query_stage_retry(&mut self, stage: QueryStage, max_attempts: u8) {
        if self.query_stage != stage {
            return;
        }
        self.query_retries += 1;
        if max_attempts != 0 && self.query_retries >= max_attempts {
            info!(
                "node {:03}: giving up on query stage {} after {} attempts",
                self.node_id,
                stage.name(),
                self.query_retries
            );
            self.query_stage = stage.next();
            self.query_retries = 0;
        }
    }

    /// Decide the next interrogation action for this node.
    pub(crate) fn plan_next_query(&mut self) -> QueryPlan {
        let node_id = self.node_id;
        let stage = self.query_stage;
        let mut ctx = ClassContext::new(node_id, self.home_id);

        match stage {
            QueryStage::None => QueryPlan::Idle,

            // Already finished; let the caller re-check whether the whole
            // network is done.
            QueryStage::Complete => QueryPlan::Complete,

            QueryStage::ProtocolInfo => {
                let mut msg = Message::request(
                    "Get Node Protocol Info",
                    node_id,
                    FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO,
                );
                msg.push(node_id);
                ctx.send(msg, SendQueue::Query);
                QueryPlan::Send(ctx)
            }

            QueryStage::NodeInfo => {
                let mut msg = Message::request("Request Node Info", node_id, FUNC_ID_ZW_REQUEST_NODE_INFO)
                    .expect_reply(FUNC_ID_ZW_APPLICATION_UPDATE);
                msg.push(node_id);
                ctx.send(msg, SendQueue::Query);
                QueryPlan::Send(ctx)
            }

            QueryStage::WakeUp => {
                if self.wake_up.is_some() && !self.listening {
                    ctx.send(wake_up::interval_get(node_id), SendQueue::Query);
                    QueryPlan::Send(ctx)
                } else {
                    self.advance_stage()
                }
            }

            QueryStage::Instances
            | QueryStage::ManufacturerSpecific
            | QueryStage::Versions
            | QueryStage::SecurityReport
            | QueryStage::Associations
            | QueryStage::Session
            | QueryStage::Dynamic => {
                let mut issued = false;
                for handler in self.handlers.values_mut() {
                    issued |= handler.request_state(&mut ctx, stage);
                }
                if issued {
                    QueryPlan::Send(ctx)
                } else {
                    self.advance_stage()
                }
            }
        }
    }

    fn advance_stage(&mut self) -> QueryPlan {
        let next = self.query_stage.next();
        self.query_stage = next;
        self.query_retries = 0;
        if next == QueryStage::Complete {
            info!("node {:03}: interrogation complete", self.node_id);
            QueryPlan::Complete
        } else {
            QueryPlan::Advanced
        }
    }

    /// Merge the protocol info reply (starting at the capability byte).
    pub(crate) fn update_protocol_info(&mut self, data: &[u8]) -> bool {
        if data.len() < 6 {
            return false;
        }

        let caps = data[0];
        self.listening = caps & 0x80 != 0;
        self.routing = caps & 0x40 != 0;
        self.max_baud_rate = if caps & 0x38 == 0x10 { 40_000 } else { 9_600 };
        self.protocol_version = (caps & 0x07) + 1;

        let security = data[1];
        self.frequent_listening = security & 0x60 != 0;
        self.beaming = security & 0x10 != 0;
        self.security = security & 0x01 != 0;

        self.basic = data[3];
        self.generic = data[4];
        self.specific = data[5];

        if !self.listening && self.wake_up.is_none() {
            // Battery device: it needs a deferred queue before we learn its
            // command classes, so messages sent meanwhile can be parked.
            self.wake_up = Some(WakeUpState::new());
        }

        info!(
            "node {:03}: protocol info: listening={} routing={} freq={} beaming={} version={} class {:02x}:{:02x}:{:02x}",
            self.node_id,
            self.listening,
            self.routing,
            self.frequent_listening,
            self.beaming,
            self.protocol_version,
            self.basic,
            self.generic,
            self.specific,
        );
        true
    }

    /// Merge the command-class list of a node info frame.
    pub(crate) fn update_node_info(&mut self, class_ids: &[u8], factory: Option<&ClassFactory>) {
        for &class_id in class_ids {
            if class_id == COMMAND_CLASS_MARK {
                // Everything after the mark is controlled, not supported.
                break;
            }
            self.add_command_class(class_id, factory);
        }
    }

    fn add_command_class(&mut self, class_id: u8, factory: Option<&ClassFactory>) {
        if !self.class_ids.contains(&class_id) {
            self.class_ids.push(class_id);
        }
        if class_id == COMMAND_CLASS_WAKE_UP {
            if self.wake_up.is_none() {
                self.wake_up = Some(WakeUpState::new());
            }
            return;
        }
        if !self.handlers.contains_key(&class_id) {
            if let Some(handler) = factory.and_then(|f| f(class_id)) {
                debug!(
                    "node {:03}: registered handler {} for class 0x{:02x}",
                    self.node_id,
                    handler.name(),
                    class_id
                );
                self.handlers.insert(class_id, handler);
            }
        }
    }

    /// Whether the node advertised a command class.
    pub fn has_command_class(&self, class_id: u8) -> bool {
        self.class_ids.contains(&class_id)
    }

    /// Route an Application Command Handler payload to this node's handler.
    /// `data` starts at the command byte.
    pub(crate) fn handle_application_command(
        &mut self,
        class_id: u8,
        data: &[u8],
        instance: u8,
    ) -> ClassContext {
        let mut ctx = ClassContext::new(self.node_id, self.home_id);
        match self.handlers.get_mut(&class_id) {
            Some(handler) => handler.handle_msg(&mut ctx, data, instance),
            None => debug!(
                "node {:03}: no handler for command class 0x{:02x}, frame dropped",
                self.node_id, class_id
            ),
        }
        ctx
    }

    /// Ask the owning handler to queue a refresh of one value.
    pub(crate) fn request_value(&mut self, value_id: ValueId) -> ClassContext {
        let mut ctx = ClassContext::new(self.node_id, self.home_id);
        match self.handlers.get_mut(&value_id.class_id) {
            Some(handler) => {
                handler.request_value(&mut ctx, value_id.instance, value_id.index);
            }
            None => debug!(
                "node {:03}: no handler for polled class 0x{:02x}",
                self.node_id, value_id.class_id
            ),
        }
        ctx
    }

    /// Replace the neighbor bitmap with routing info from the controller.
    pub(crate) fn set_neighbors(&mut self, bitmap: &[u8]) {
        let len = bitmap.len().min(NUM_NODE_BITFIELD_BYTES);
        self.neighbors[..len].copy_from_slice(&bitmap[..len]);
    }

    /// Node ids set in the neighbor bitmap.
    pub fn neighbor_ids(&self) -> Vec<u8> {
        let mut ids = Vec::new();
        for (byte_index, byte) in self.neighbors.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1u8 << bit) != 0 {
                    ids.push((byte_index * 8 + bit + 1) as u8);
                }
            }
        }
        ids
    }

    /// Basic / generic / specific device class triple.
    pub fn device_class(&self) -> (u8, u8, u8) {
        (self.basic, self.generic, self.specific)
    }

    /// Bind a handheld button to a virtual node.
    pub(crate) fn map_button(&mut self, button_id: u8, virtual_node_id: u8) {
        self.button_map.insert(button_id, virtual_node_id);
    }

    /// Remove a button binding. Returns whether it existed.
    pub(crate) fn unmap_button(&mut self, button_id: u8) -> bool {
        self.button_map.remove(&button_id).is_some()
    }

    /// Virtual node a button is bound to.
    pub fn virtual_node_for_button(&self, button_id: u8) -> Option<u8> {
        self.button_map.get(&button_id).copied()
    }

    /// Button bound to a virtual node.
    pub fn button_for_virtual_node(&self, virtual_node_id: u8) -> Option<u8> {
        self.button_map
            .iter()
            .find(|(_, &v)| v == virtual_node_id)
            .map(|(&b, _)| b)
    }

    /// The full button map.
    pub fn button_map(&self) -> &BTreeMap<u8, u8> {
        &self.button_map
    }

    pub(crate) fn record_write(&mut self) {
        self.write_count += 1;
    }

    /// Frames written to this node since the driver started.
    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    /// Cloneable snapshot of the externally interesting state.
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            node_id: self.node_id,
            listening: self.listening,
            frequent_listening: self.frequent_listening,
            routing: self.routing,
            beaming: self.beaming,
            security: self.security,
            max_baud_rate: self.max_baud_rate,
            protocol_version: self.protocol_version,
            basic: self.basic,
            generic: self.generic,
            specific: self.specific,
            query_stage: self.query_stage,
            awake: self.wake_up.as_ref().map_or(true, WakeUpState::is_awake),
            pending_wake_up_messages: self
                .wake_up
                .as_ref()
                .map_or(0, WakeUpState::pending_len),
            command_classes: self.class_ids.clone(),
            neighbors: self.neighbor_ids(),
        }
    }
}

/// Point-in-time view of a node, safe to hold outside the node lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    /// The node's id on the network.
    pub node_id: u8,
    /// Receiver always on.
    pub listening: bool,
    /// FLiRS beam interval listener.
    pub frequent_listening: bool,
    /// Routes frames for others.
    pub routing: bool,
    /// Beam capable.
    pub beaming: bool,
    /// Supports the security command class.
    pub security: bool,
    /// Maximum communication baud rate.
    pub max_baud_rate: u32,
    /// Z-Wave protocol version.
    pub protocol_version: u8,
    /// Basic device class.
    pub basic: u8,
    /// Generic device class.
    pub generic: u8,
    /// Specific device class.
    pub specific: u8,
    /// Interrogation progress.
    pub query_stage: QueryStage,
    /// Whether the node is believed reachable right now.
    pub awake: bool,
    /// Messages parked on the wake-up queue.
    pub pending_wake_up_messages: usize,
    /// Advertised command classes.
    pub command_classes: Vec<u8>,
    /// Known neighbors.
    pub neighbors: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_protocol_info_listening_switch() {
        let mut node = Node::new(0xc0ffee00, 2);
        // listening + routing, 40 kbit, version 3; no security bits; binary switch
        assert!(node.update_protocol_info(&[0xd2, 0x00, 0x00, 0x04, 0x10, 0x01]));

        assert!(node.is_listening());
        assert!(node.routing);
        assert_eq!(node.max_baud_rate, 40_000);
        assert_eq!(node.protocol_version, 3);
        assert!(!node.is_frequent_listening());
        assert!(!node.is_controller());
        assert_eq!(node.device_class(), (0x04, 0x10, 0x01));
        assert!(node.wake_up().is_none());
    }

    #[test]
    fn test_update_protocol_info_battery_sensor_gets_wake_up_state() {
        let mut node = Node::new(0xc0ffee00, 7);
        // non-listening battery sensor
        assert!(node.update_protocol_info(&[0x53, 0x00, 0x00, 0x04, 0x21, 0x01]));

        assert!(!node.is_listening());
        assert_eq!(node.max_baud_rate, 40_000);
        assert!(node.wake_up().is_some());
        // Assumed awake until proven otherwise, so nothing defers yet.
        assert!(!node.should_defer_messages());

        node.wake_up_mut().unwrap().set_awake(false);
        assert!(node.should_defer_messages());
    }

    #[test]
    fn test_update_protocol_info_rejects_short_data() {
        let mut node = Node::new(0, 3);
        assert!(!node.update_protocol_info(&[0x80, 0x00]));
    }

    #[test]
    fn test_controllers_never_defer() {
        let mut node = Node::new(0, 1);
        // Static controller, non-listening bit clear in caps on purpose
        assert!(node.update_protocol_info(&[0x12, 0x00, 0x00, 0x02, 0x02, 0x01]));
        assert!(node.is_controller());
        assert!(!node.should_defer_messages());
    }

    #[test]
    fn test_update_node_info_stops_at_mark() {
        let mut node = Node::new(0, 5);
        node.update_node_info(&[0x25, COMMAND_CLASS_WAKE_UP, COMMAND_CLASS_MARK, 0x20], None);

        assert!(node.has_command_class(0x25));
        assert!(node.has_command_class(COMMAND_CLASS_WAKE_UP));
        assert!(!node.has_command_class(0x20));
        assert!(node.wake_up().is_some());
    }

    #[test]
    fn test_query_stage_complete_advances_only_current() {
        let mut node = Node::new(0, 4);
        node.set_query_stage(QueryStage::ProtocolInfo);

        node.query_stage_complete(QueryStage::NodeInfo);
        assert_eq!(node.query_stage(), QueryStage::ProtocolInfo);

        node.query_stage_complete(QueryStage::ProtocolInfo);
        assert_eq!(node.query_stage(), QueryStage::NodeInfo);
    }

    #[test]
    fn test_query_stage_retry_gives_up_after_max() {
        let mut node = Node::new(0, 4);
        node.set_query_stage(QueryStage::NodeInfo);

        node.query_stage_retry(QueryStage::NodeInfo, 3);
        node.query_stage_retry(QueryStage::NodeInfo, 3);
        assert_eq!(node.query_stage(), QueryStage::NodeInfo);

        node.query_stage_retry(QueryStage::NodeInfo, 3);
        assert_eq!(node.query_stage(), QueryStage::Instances);
    }

    #[test]
    fn test_plan_skips_stages_with_no_handlers() {
        let mut node = Node::new(0, 4);
        node.set_query_stage(QueryStage::ProtocolInfo);

        // ProtocolInfo issues a controller request.
        match node.plan_next_query() {
            QueryPlan::Send(ctx) => {
                assert_eq!(ctx.outgoing.len(), 1);
                assert_eq!(
                    ctx.outgoing[0].0.function_id(),
                    FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO
                );
            }
            other => panic!("unexpected plan {other:?}"),
        }

        // A listening node with no handlers walks straight from Instances
        // to Complete once NodeInfo is done.
        node.set_query_stage(QueryStage::Instances);
        loop {
            match node.plan_next_query() {
                QueryPlan::Advanced => continue,
                QueryPlan::Complete => break,
                other => panic!("unexpected plan {other:?}"),
            }
        }
        assert_eq!(node.query_stage(), QueryStage::Complete);
    }

    #[test]
    fn test_plan_wake_up_stage_requests_interval() {
        let mut node = Node::new(0, 9);
        node.update_protocol_info(&[0x53, 0x00, 0x00, 0x04, 0x21, 0x01]);
        node.set_query_stage(QueryStage::WakeUp);

        match node.plan_next_query() {
            QueryPlan::Send(ctx) => {
                assert_eq!(ctx.outgoing.len(), 1);
                let (msg, queue) = &ctx.outgoing[0];
                assert_eq!(*queue, SendQueue::Query);
                assert_eq!(msg.expected_command_class_id(), COMMAND_CLASS_WAKE_UP);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_button_map_lookups() {
        let mut node = Node::new(0, 3);
        node.map_button(1, 200);
        node.map_button(2, 201);

        assert_eq!(node.virtual_node_for_button(1), Some(200));
        assert_eq!(node.button_for_virtual_node(201), Some(2));
        assert!(node.unmap_button(1));
        assert!(!node.unmap_button(1));
        assert_eq!(node.button_for_virtual_node(200), None);
    }

    #[test]
    fn test_record_roundtrip() {
        let mut node = Node::new(0xfeed, 6);
        node.update_protocol_info(&[0x53, 0x10, 0x00, 0x04, 0x21, 0x01]);
        node.update_node_info(&[0x25, COMMAND_CLASS_WAKE_UP], None);
        node.set_query_stage(QueryStage::Associations);

        let record = node.to_record();
        let restored = Node::from_record(0xfeed, &record, None);

        assert_eq!(restored.summary().node_id, 6);
        assert_eq!(restored.query_stage(), QueryStage::Associations);
        assert!(!restored.is_listening());
        assert!(restored.has_command_class(0x25));
        assert!(restored.wake_up().is_some());
        assert_eq!(restored.device_class(), node.device_class());
    }
}
