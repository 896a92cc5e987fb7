//! The driver: public handle, shared state and worker tasks.
//!
//! [`Driver::start`] spawns two tasks: the driver task owning the transport
//! and the transaction engine, and the poll task feeding the Poll queue.
//! The handle's methods may be called from any thread; they communicate
//! with the tasks through the prioritised queues and shared state, never by
//! touching the transport directly.

mod dispatch;
mod task;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::command_class::ClassContext;
use crate::config::{self, ButtonEntry, DriverOptions, PersistedDriver};
use crate::controller::{ActiveCommand, ControllerCallback, ControllerCommand, ControllerState};
use crate::core::constants::*;
use crate::core::error::ControllerError;
use crate::message::{CallbackIds, Message};
use crate::node::query::QueryStage;
use crate::node::table::NodeTable;
use crate::node::{NodeSummary, QueryPlan};
use crate::notification::{Notification, NotificationKind, Notifications};
use crate::poll::{PollList, ValueId};
use crate::queue::{QueueItem, SendQueue, SendQueues};
use crate::transport::Transport;

static LIBRARY_TYPE_NAMES: [&str; 9] = [
    "Unknown",
    "Static Controller",
    "Controller",
    "Enhanced Slave",
    "Slave",
    "Installer",
    "Routing Slave",
    "Bridge Controller",
    "Device Under Test",
];

/// Identity and capabilities of the attached controller, filled in during
/// the init handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    /// 32-bit network identifier; zero until the controller reports it.
    pub home_id: u32,
    /// The controller's own node id; zero until reported.
    pub node_id: u8,
    /// Z-Wave library version string.
    pub library_version: String,
    /// Z-Wave library type byte.
    pub library_type: u8,
    /// Controller capability bit-field (SIS, SUC, secondary, ...).
    pub controller_caps: u8,
    /// Serial API capability bit-field from the init data.
    pub init_caps: u8,
    /// Serial API version from the init data.
    pub init_version: u8,
    /// USB vendor of the stick.
    pub manufacturer_id: u16,
    /// Product type identifier.
    pub product_type: u16,
    /// Product identifier.
    pub product_id: u16,
    /// One bit per supported Serial API function id.
    pub api_mask: [u8; 32],
    /// Bitmap of virtual nodes owned by a bridge controller.
    pub virtual_neighbors: [u8; NUM_NODE_BITFIELD_BYTES],
    /// Whether the virtual-neighbor bitmap has been received.
    pub virtual_neighbors_received: bool,
}

impl ControllerIdentity {
    fn new() -> Self {
        Self {
            home_id: 0,
            node_id: 0,
            library_version: String::new(),
            library_type: 0,
            controller_caps: 0,
            init_caps: 0,
            init_version: 0,
            manufacturer_id: 0,
            product_type: 0,
            product_id: 0,
            api_mask: [0; 32],
            virtual_neighbors: [0; NUM_NODE_BITFIELD_BYTES],
            virtual_neighbors_received: false,
        }
    }

    /// Name of the reported library type.
    pub fn library_type_name(&self) -> &'static str {
        LIBRARY_TYPE_NAMES
            .get(self.library_type as usize)
            .copied()
            .unwrap_or("Unknown")
    }

    /// Whether the controller runs the bridge library and can own virtual
    /// nodes.
    pub fn is_bridge_controller(&self) -> bool {
        self.library_type == LIBRARY_TYPE_BRIDGE_CONTROLLER
    }

    /// Whether we are the primary controller of the network.
    pub fn is_primary_controller(&self) -> bool {
        self.init_caps & INIT_CAPS_SECONDARY == 0
    }

    /// Whether a SUC id server is present and we can include nodes.
    pub fn is_inclusion_controller(&self) -> bool {
        self.controller_caps & CONTROLLER_CAPS_SIS != 0
    }

    /// Whether the controller is a static update controller.
    pub fn is_static_update_controller(&self) -> bool {
        self.controller_caps & CONTROLLER_CAPS_SUC != 0
    }

    /// Whether the controller implements the given Serial API function.
    pub fn supports_function(&self, function_id: u8) -> bool {
        if function_id == 0 {
            return false;
        }
        let bit = function_id as usize - 1;
        self.api_mask[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Whether a node id is one of our virtual nodes.
    pub fn is_virtual_node(&self, node_id: u8) -> bool {
        if node_id == 0 || node_id > MAX_NODES || !self.virtual_neighbors_received {
            return false;
        }
        let bit = node_id as usize - 1;
        self.virtual_neighbors[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Ids of all virtual nodes, ascending.
    pub fn virtual_node_ids(&self) -> Vec<u8> {
        (1..=MAX_NODES).filter(|&n| self.is_virtual_node(n)).collect()
    }
}

/// Cumulative transfer and error counters.
#[derive(Debug, Default)]
pub(crate) struct DriverStats {
    pub sof_count: AtomicU32,
    pub ack_waiting: AtomicU32,
    pub read_aborts: AtomicU32,
    pub bad_checksums: AtomicU32,
    pub reads: AtomicU32,
    pub writes: AtomicU32,
    pub can_count: AtomicU32,
    pub nak_count: AtomicU32,
    pub ack_count: AtomicU32,
    pub oof_count: AtomicU32,
    pub dropped: AtomicU32,
    pub retries: AtomicU32,
    pub controller_reads: AtomicU32,
    pub controller_writes: AtomicU32,
}

impl DriverStats {
    fn snapshot(&self) -> DriverStatistics {
        DriverStatistics {
            sof_count: self.sof_count.load(Ordering::Relaxed),
            ack_waiting: self.ack_waiting.load(Ordering::Relaxed),
            read_aborts: self.read_aborts.load(Ordering::Relaxed),
            bad_checksums: self.bad_checksums.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            can_count: self.can_count.load(Ordering::Relaxed),
            nak_count: self.nak_count.load(Ordering::Relaxed),
            ack_count: self.ack_count.load(Ordering::Relaxed),
            oof_count: self.oof_count.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            controller_reads: self.controller_reads.load(Ordering::Relaxed),
            controller_writes: self.controller_writes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the driver's transfer and error counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStatistics {
    /// Start-of-frame markers seen.
    pub sof_count: u32,
    /// Unsolicited frames received while waiting for an ACK.
    pub ack_waiting: u32,
    /// Frame reads abandoned on a sub-timeout.
    pub read_aborts: u32,
    /// Frames rejected for a bad checksum.
    pub bad_checksums: u32,
    /// Frames received intact.
    pub reads: u32,
    /// Frames transmitted.
    pub writes: u32,
    /// CANs received.
    pub can_count: u32,
    /// NAKs received.
    pub nak_count: u32,
    /// ACKs received.
    pub ack_count: u32,
    /// Bytes received outside any frame.
    pub oof_count: u32,
    /// Messages dropped after exhausting their retries.
    pub dropped: u32,
    /// Message retransmissions.
    pub retries: u32,
    /// Frames received addressed to the controller itself.
    pub controller_reads: u32,
    /// Frames sent addressed to the controller itself.
    pub controller_writes: u32,
}

/// State shared between the handle, the driver task and the poll task.
pub(crate) struct DriverInner {
    pub options: DriverOptions,

    pub queues: Mutex<SendQueues>,
    pub queue_ready: Notify,

    pub nodes: RwLock<NodeTable>,
    pub identity: RwLock<ControllerIdentity>,
    pub active_command: Mutex<ActiveCommand>,

    pub poll_list: Mutex<PollList>,
    pub poll_interval_secs: AtomicU32,

    notifications: Mutex<VecDeque<Notification>>,
    notify_tx: mpsc::UnboundedSender<Notification>,

    pub stats: DriverStats,
    callback_ids: CallbackIds,

    pub init_done: AtomicBool,
    pub awake_nodes_queried: AtomicBool,
    pub all_nodes_queried: AtomicBool,
}

impl DriverInner {
    fn new(options: DriverOptions, notify_tx: mpsc::UnboundedSender<Notification>) -> Self {
        let poll_interval = options.poll_interval_secs;
        Self {
            options,
            queues: Mutex::new(SendQueues::new()),
            queue_ready: Notify::new(),
            nodes: RwLock::new(NodeTable::new()),
            identity: RwLock::new(ControllerIdentity::new()),
            active_command: Mutex::new(ActiveCommand::idle()),
            poll_list: Mutex::new(PollList::new()),
            poll_interval_secs: AtomicU32::new(poll_interval),
            notifications: Mutex::new(VecDeque::new()),
            notify_tx,
            stats: DriverStats::default(),
            callback_ids: CallbackIds::new(),
            init_done: AtomicBool::new(false),
            awake_nodes_queried: AtomicBool::new(false),
            all_nodes_queried: AtomicBool::new(false),
        }
    }

    /// Current home id, zero before the controller has identified itself.
    pub fn home_id(&self) -> u32 {
        self.identity.read().unwrap().home_id
    }

    /// Queue a message, or park it on its target's wake-up queue if the
    /// target is a sleeping battery node.
    pub fn send_msg(&self, mut msg: Message, queue: SendQueue) {
        let callback_id = if msg.callback_required() {
            self.callback_ids.next()
        } else {
            0
        };
        msg.finalize(callback_id);

        {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(msg.target_node_id()) {
                if node.should_defer_messages() {
                    if msg.is_wake_up_no_more_information() {
                        // The node just went back to sleep; telling it so
                        // again next wake-up would be nonsense.
                        debug!(
                            "node {:03}: discarding no-more-information for sleeping node",
                            msg.target_node_id()
                        );
                        return;
                    }
                    debug!(
                        "node {:03}: queuing wake-up command: {}",
                        node.node_id(),
                        msg.label()
                    );
                    node.wake_up_mut()
                        .expect("deferring node always has wake-up state")
                        .queue_item(QueueItem::Send(msg));
                    return;
                }
            }
        }

        debug!(
            "node {:03}: queuing command ({:?}): {}",
            msg.target_node_id(),
            queue,
            msg.label()
        );
        self.queues.lock().unwrap().push(queue, QueueItem::Send(msg));
        self.queue_ready.notify_one();
    }

    /// Queue a query-stage completion, or park it with the sleeping node.
    pub fn send_query_stage_complete(&self, node_id: u8, stage: QueryStage) {
        let item = QueueItem::QueryStageComplete { node_id, stage };

        {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(node_id) {
                if node.should_defer_messages() {
                    debug!(
                        "node {:03}: queuing wake-up query stage complete ({})",
                        node_id,
                        stage.name()
                    );
                    node.wake_up_mut()
                        .expect("deferring node always has wake-up state")
                        .queue_item(item);
                    return;
                }
            } else {
                return;
            }
        }

        debug!(
            "node {:03}: queuing query stage complete ({})",
            node_id,
            stage.name()
        );
        self.queues.lock().unwrap().push(SendQueue::Query, item);
        self.queue_ready.notify_one();
    }

    /// Buffer a notification for delivery at the end of the loop iteration.
    pub fn queue_notification(&self, kind: NotificationKind) {
        let home_id = self.home_id();
        self.notifications
            .lock()
            .unwrap()
            .push_back(Notification { home_id, kind });
    }

    /// Deliver everything buffered, outside any lock.
    pub fn flush_notifications(&self) {
        loop {
            let next = self.notifications.lock().unwrap().pop_front();
            match next {
                Some(notification) => {
                    let _ = self.notify_tx.send(notification);
                }
                None => break,
            }
        }
    }

    /// Apply the effects a command-class handler recorded.
    pub fn apply_class_context(&self, ctx: ClassContext) {
        let node_id = ctx.node_id;
        let ClassContext {
            outgoing,
            notifications,
            completed_stages,
            ..
        } = ctx;
        for (msg, queue) in outgoing {
            self.send_msg(msg, queue);
        }
        for kind in notifications {
            self.queue_notification(kind);
        }
        for stage in completed_stages {
            self.send_query_stage_complete(node_id, stage);
        }
    }

    /// Walk a node's interrogation machine until it issues a request,
    /// runs out of work, or completes.
    pub fn advance_node_queries(&self, node_id: u8) {
        loop {
            let plan = {
                let mut nodes = self.nodes.write().unwrap();
                match nodes.get_mut(node_id) {
                    Some(node) => node.plan_next_query(),
                    None => return,
                }
            };

            match plan {
                QueryPlan::Idle => return,
                QueryPlan::Advanced => continue,
                QueryPlan::Send(ctx) => {
                    self.apply_class_context(ctx);
                    return;
                }
                QueryPlan::Complete => {
                    self.check_completed_node_queries();
                    return;
                }
            }
        }
    }

    /// Emit AllNodesQueried / AwakeNodesQueried once the respective set of
    /// interrogations has finished.
    pub fn check_completed_node_queries(&self) {
        // Not before the initial node table has been fully built, or a
        // node finishing early would claim completion for nodes that do
        // not exist yet.
        if !self.init_done.load(Ordering::Relaxed)
            || self.all_nodes_queried.load(Ordering::Relaxed)
        {
            return;
        }

        let (all, sleeping_only) = {
            let nodes = self.nodes.read().unwrap();
            let mut all = true;
            let mut sleeping_only = true;
            for node in nodes.iter() {
                if node.query_stage() != QueryStage::Complete {
                    all = false;
                    if node.is_listening() {
                        sleeping_only = false;
                    }
                }
            }
            (all, sleeping_only)
        };

        if all {
            info!("node query processing complete");
            self.queue_notification(NotificationKind::AllNodesQueried);
            self.awake_nodes_queried.store(true, Ordering::Relaxed);
            self.all_nodes_queried.store(true, Ordering::Relaxed);
        } else if sleeping_only && !self.awake_nodes_queried.load(Ordering::Relaxed) {
            info!("node query processing complete except for sleeping nodes");
            self.queue_notification(NotificationKind::AwakeNodesQueried);
            self.awake_nodes_queried.store(true, Ordering::Relaxed);
        }
    }

    /// Invoke the controller-command progress callback, outside the lock.
    pub fn controller_callback(&self, state: ControllerState) {
        let callback = self.active_command.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    /// Clear the active controller command.
    pub fn clear_controller_command(&self) {
        self.active_command.lock().unwrap().clear();
    }

    /// Persist the button maps of every node.
    pub fn save_buttons(&self) {
        let entries: Vec<ButtonEntry> = {
            let nodes = self.nodes.read().unwrap();
            nodes
                .iter()
                .flat_map(|node| {
                    node.button_map().iter().map(move |(&button_id, &virtual_node_id)| {
                        ButtonEntry {
                            node_id: node.node_id(),
                            button_id,
                            virtual_node_id,
                        }
                    })
                })
                .collect()
        };

        if let Err(err) = config::save_buttons(&self.options.user_path, &entries) {
            warn!("failed to save button maps: {err}");
        }
    }

    /// Persist the driver configuration, if a home id is known.
    pub fn save_config(&self) {
        let identity = self.identity.read().unwrap().clone();
        if identity.home_id == 0 {
            warn!("not writing driver config: no home id yet");
            return;
        }

        let nodes: Vec<_> = {
            let table = self.nodes.read().unwrap();
            table.iter().map(|node| node.to_record()).collect()
        };

        let persisted = PersistedDriver {
            home_id: identity.home_id,
            node_id: identity.node_id,
            api_capabilities: identity.init_caps,
            controller_capabilities: identity.controller_caps,
            poll_interval_secs: self.poll_interval_secs.load(Ordering::Relaxed),
            nodes,
        };

        if let Err(err) = config::save_config(&self.options.user_path, &persisted) {
            warn!("failed to save driver config: {err}");
        }
    }

    /// Queue the virtual node info frame announcing `from` to `to`.
    pub fn send_virtual_node_info(&self, from_node_id: u8, to_node_id: u8) {
        let mut msg = Message::request(
            format!("Send Virtual Node Info from {from_node_id} to {to_node_id}"),
            CONTROLLER_NODE_ID,
            FUNC_ID_ZW_SEND_SLAVE_NODE_INFO,
        )
        .with_callback();
        msg.push(from_node_id);
        msg.push(to_node_id);
        msg.push(TRANSMIT_OPTION_ACK);
        self.send_msg(msg, SendQueue::Command);
    }

    /// Replace any record for `node_id` with a fresh one and start its
    /// interrogation from the top.
    pub fn init_node(&self, node_id: u8) {
        let home_id = self.home_id();

        let existed = self.nodes.write().unwrap().remove(node_id).is_some();
        if existed {
            self.queue_notification(NotificationKind::NodeRemoved { node_id });
        }

        let mut node = crate::node::Node::new(home_id, node_id);
        self.apply_persisted_buttons(&mut node);
        node.set_query_stage(QueryStage::ProtocolInfo);
        self.nodes.write().unwrap().insert(node);
        self.queue_notification(NotificationKind::NodeAdded { node_id });

        self.advance_node_queries(node_id);
    }

    /// Throw away every node record and rediscover the network.
    pub fn init_all_nodes(&self) {
        let _ = self.nodes.write().unwrap().drain();
        self.all_nodes_queried.store(false, Ordering::Relaxed);
        self.awake_nodes_queried.store(false, Ordering::Relaxed);

        self.queue_notification(NotificationKind::DriverReset);
        self.send_msg(
            Message::request(
                "Get Init Data",
                CONTROLLER_NODE_ID,
                FUNC_ID_SERIAL_API_GET_INIT_DATA,
            ),
            SendQueue::Send,
        );
    }

    /// Restore a node's persisted button bindings.
    pub fn apply_persisted_buttons(&self, node: &mut crate::node::Node) {
        match config::load_buttons(&self.options.user_path) {
            Ok(entries) => {
                let target_node_id = node.node_id();
                for entry in entries.iter().filter(|e| e.node_id == target_node_id) {
                    node.map_button(entry.button_id, entry.virtual_node_id);
                    self.queue_notification(NotificationKind::CreateButton {
                        node_id: entry.node_id,
                        button_id: entry.button_id,
                    });
                }
            }
            Err(err) => warn!("failed to load button maps: {err}"),
        }
    }

    /// Ask the controller for its stored neighbor list of a node; the
    /// reply handler copies the bitmap into the node record.
    pub fn request_node_neighbors(&self, node_id: u8) {
        if !self
            .identity
            .read()
            .unwrap()
            .supports_function(FUNC_ID_ZW_GET_ROUTING_INFO)
        {
            return;
        }

        self.active_command.lock().unwrap().node_id = node_id;
        debug!("requesting routing info (neighbor list) for node {node_id}");
        let mut msg = Message::request("Get Routing Info", node_id, FUNC_ID_ZW_GET_ROUTING_INFO);
        msg.push(node_id);
        msg.push(1); // exclude bad links
        msg.push(1); // exclude non-routing neighbors
        self.send_msg(msg, SendQueue::Command);
    }

    /// Queue the frame taking the controller out of slave learn mode.
    pub fn send_slave_learn_mode_off(&self) {
        let identity = self.identity.read().unwrap();
        if identity.is_primary_controller() || identity.is_inclusion_controller() {
            return;
        }
        drop(identity);

        let mut msg = Message::request(
            "Set Slave Learn Mode Off",
            CONTROLLER_NODE_ID,
            FUNC_ID_ZW_SET_SLAVE_LEARN_MODE,
        )
        .with_callback();
        msg.push(0);
        msg.push(SLAVE_LEARN_MODE_DISABLE);
        self.send_msg(msg, SendQueue::Command);
    }
}

/// Handle to a running driver.
///
/// Dropping the handle signals shutdown; [`shutdown`](Driver::shutdown)
/// additionally waits for the worker tasks, persists state and emits the
/// teardown notifications.
pub struct Driver {
    inner: Arc<DriverInner>,
    shutdown_tx: watch::Sender<bool>,
    driver_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

impl Driver {
    /// Spawn the driver against a transport. Must be called inside a tokio
    /// runtime. Returns the handle and the notification stream.
    pub fn start<T: Transport>(transport: T, options: DriverOptions) -> (Driver, Notifications) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(DriverInner::new(options, notify_tx));

        let driver_task = tokio::spawn(task::run(
            inner.clone(),
            transport,
            shutdown_rx.clone(),
        ));
        let poll_task = tokio::spawn(crate::poll::run(inner.clone(), shutdown_rx));

        (
            Driver {
                inner,
                shutdown_tx,
                driver_task: Some(driver_task),
                poll_task: Some(poll_task),
            },
            Notifications::new(notify_rx),
        )
    }

    /// Queue a message for transmission.
    pub fn send_msg(&self, msg: Message, queue: SendQueue) {
        self.inner.send_msg(msg, queue);
    }

    /// Report an interrogation stage of a node as complete. Command-class
    /// handlers call this (through their context) when the reply that
    /// finishes a stage arrives.
    pub fn send_query_stage_complete(&self, node_id: u8, stage: QueryStage) {
        self.inner.send_query_stage_complete(node_id, stage);
    }

    /// Start a network-management operation.
    ///
    /// Fails with [`ControllerError::Busy`], making no state changes, if a
    /// command is already active. Progress is reported through `callback`.
    pub fn begin_controller_command(
        &self,
        command: ControllerCommand,
        callback: Option<ControllerCallback>,
        high_power: bool,
        node_id: u8,
        arg: u8,
    ) -> Result<(), ControllerError> {
        if command == ControllerCommand::None {
            return Ok(());
        }

        let mut active = self.inner.active_command.lock().unwrap();
        if active.is_active() {
            return Err(ControllerError::Busy);
        }

        // The button commands have preconditions; check them before any
        // state change so a failure has no side effects.
        match command {
            ControllerCommand::CreateButton => {
                self.begin_create_button(&mut active, callback, node_id, arg)?
            }
            ControllerCommand::DeleteButton => {
                self.begin_delete_button(&mut active, callback, node_id, arg)?
            }
            _ => {
                active.command = command;
                active.node_id = node_id;
                active.arg = arg;
                active.controller_added = false;
                active.callback = callback;
                drop(active);
                self.queue_controller_command(command, high_power, node_id);
            }
        }
        Ok(())
    }

    fn queue_controller_command(&self, command: ControllerCommand, high_power: bool, node_id: u8) {
        let power_flag = if high_power { OPTION_HIGH_POWER } else { 0 };
        info!("{}", command.name());

        match command {
            ControllerCommand::AddController => {
                let mut msg = Message::request(
                    "AddController",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
                )
                .with_callback();
                msg.push(ADD_NODE_CONTROLLER | power_flag);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::AddDevice => {
                let mut msg = Message::request(
                    "AddDevice",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
                )
                .with_callback();
                msg.push(ADD_NODE_SLAVE | power_flag);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::CreateNewPrimary => {
                let mut msg = Message::request(
                    "CreateNewPrimary",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_CREATE_NEW_PRIMARY,
                )
                .with_callback();
                msg.push(CREATE_PRIMARY_START);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::ReceiveConfiguration => {
                let mut msg = Message::request(
                    "ReceiveConfiguration",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_SET_LEARN_MODE,
                )
                .with_callback();
                msg.push(LEARN_MODE_ENABLE);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::RemoveController | ControllerCommand::RemoveDevice => {
                let mut msg = Message::request(
                    command.name(),
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_REMOVE_NODE_FROM_NETWORK,
                )
                .with_callback();
                msg.push(REMOVE_NODE_ANY | power_flag);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::HasNodeFailed => {
                let mut msg = Message::request(
                    "Has Node Failed?",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_IS_FAILED_NODE_ID,
                );
                msg.push(node_id);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::RemoveFailedNode => {
                let mut msg = Message::request(
                    "Mark Node As Failed",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_REMOVE_FAILED_NODE_ID,
                )
                .with_callback();
                msg.push(node_id);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::ReplaceFailedNode => {
                let mut msg = Message::request(
                    "ReplaceFailedNode",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_REPLACE_FAILED_NODE,
                )
                .with_callback();
                msg.push(node_id);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::TransferPrimaryRole => {
                let mut msg = Message::request(
                    "TransferPrimaryRole",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_CONTROLLER_CHANGE,
                )
                .with_callback();
                msg.push(CONTROLLER_CHANGE_START);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::RequestNetworkUpdate => {
                let msg = Message::request(
                    "RequestNetworkUpdate",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_REQUEST_NETWORK_UPDATE,
                )
                .with_callback();
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::RequestNodeNeighborUpdate => {
                let mut msg = Message::request(
                    "Requesting Neighbor Update",
                    node_id,
                    FUNC_ID_ZW_REQUEST_NODE_NEIGHBOR_UPDATE,
                )
                .with_callback();
                msg.push(node_id);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::AssignReturnRoute => {
                let our_node_id = self.inner.identity.read().unwrap().node_id;
                let mut msg = Message::request(
                    "Assigning return route",
                    node_id,
                    FUNC_ID_ZW_ASSIGN_RETURN_ROUTE,
                )
                .with_callback();
                msg.push(node_id); // from the node
                msg.push(our_node_id); // to the controller
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::DeleteAllReturnRoutes => {
                let mut msg = Message::request(
                    "Deleting return routes",
                    node_id,
                    FUNC_ID_ZW_DELETE_RETURN_ROUTE,
                )
                .with_callback();
                msg.push(node_id);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::None
            | ControllerCommand::CreateButton
            | ControllerCommand::DeleteButton => {}
        }
    }

    fn begin_create_button(
        &self,
        active: &mut ActiveCommand,
        callback: Option<ControllerCallback>,
        node_id: u8,
        button_id: u8,
    ) -> Result<(), ControllerError> {
        let identity = self.inner.identity.read().unwrap().clone();
        if !identity.is_bridge_controller() {
            return Err(ControllerError::NotBridgeController);
        }
        if !identity.virtual_neighbors_received {
            return Err(ControllerError::VirtualNodesUnknown);
        }

        let mut nodes = self.inner.nodes.write().unwrap();
        let node = nodes
            .get_mut(node_id)
            .ok_or(ControllerError::NodeNotFound(node_id))?;
        if node.virtual_node_for_button(button_id).is_some() {
            return Err(ControllerError::ButtonInUse(button_id));
        }

        active.command = ControllerCommand::CreateButton;
        active.node_id = node_id;
        active.arg = button_id;
        active.controller_added = false;
        active.callback = callback;

        // Prefer an existing virtual node not yet bound to one of this
        // node's buttons.
        let unused = identity
            .virtual_node_ids()
            .into_iter()
            .find(|&v| node.button_for_virtual_node(v).is_none());

        if let Some(virtual_node_id) = unused {
            node.map_button(button_id, virtual_node_id);
            drop(nodes);
            self.inner.send_virtual_node_info(virtual_node_id, node_id);
        } else {
            drop(nodes);
            info!("no free virtual node, creating one");
            let mut msg = Message::request(
                "Slave Node Information",
                CONTROLLER_NODE_ID,
                FUNC_ID_SERIAL_API_SLAVE_NODE_INFO,
            )
            .no_reply();
            msg.push(0); // node 0: allocate a new id
            msg.push(1); // listening
            msg.push(VIRTUAL_NODE_GENERIC_TYPE);
            msg.push(0x00); // specific type undefined
            msg.push(0); // no command classes
            self.inner.send_msg(msg, SendQueue::Command);

            let mut msg = Message::request(
                "Add Virtual Node",
                CONTROLLER_NODE_ID,
                FUNC_ID_ZW_SET_SLAVE_LEARN_MODE,
            )
            .with_callback();
            msg.push(0);
            if identity.is_primary_controller() || identity.is_inclusion_controller() {
                msg.push(SLAVE_LEARN_MODE_ADD);
            } else {
                msg.push(SLAVE_LEARN_MODE_ENABLE);
            }
            self.inner.send_msg(msg, SendQueue::Command);
        }
        Ok(())
    }

    fn begin_delete_button(
        &self,
        _active: &mut ActiveCommand,
        callback: Option<ControllerCallback>,
        node_id: u8,
        button_id: u8,
    ) -> Result<(), ControllerError> {
        if !self.inner.identity.read().unwrap().is_bridge_controller() {
            return Err(ControllerError::NotBridgeController);
        }

        {
            let mut nodes = self.inner.nodes.write().unwrap();
            let node = nodes
                .get_mut(node_id)
                .ok_or(ControllerError::NodeNotFound(node_id))?;
            if !node.unmap_button(button_id) {
                return Err(ControllerError::ButtonNotFound(button_id));
            }
        }

        // Nothing happens on the wire; the command completes synchronously
        // and never occupies the active slot.
        self.inner.save_buttons();
        self.inner
            .queue_notification(NotificationKind::DeleteButton { node_id, button_id });
        if let Some(callback) = callback {
            callback(ControllerState::Completed);
        }
        Ok(())
    }

    /// Cancel the active controller command.
    ///
    /// Returns `false` when no command is active or the active command
    /// cannot be cancelled.
    pub fn cancel_controller_command(&self) -> bool {
        let mut active = self.inner.active_command.lock().unwrap();
        let command = active.command;
        if !command.is_cancellable() {
            return false;
        }

        info!("cancelling {}", command.name());
        match command {
            ControllerCommand::AddController | ControllerCommand::AddDevice => {
                // No new node to initialise when the DONE callback arrives.
                active.node_id = CONTROLLER_NODE_ID;
                let mut msg = Message::request(
                    "Cancel Add Node",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
                )
                .with_callback();
                msg.push(ADD_NODE_STOP);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::CreateNewPrimary => {
                let mut msg = Message::request(
                    "Cancel Create New Primary",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_CREATE_NEW_PRIMARY,
                )
                .with_callback();
                msg.push(CREATE_PRIMARY_STOP);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::ReceiveConfiguration => {
                let mut msg = Message::request(
                    "Cancel Receive Configuration",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_SET_LEARN_MODE,
                )
                .no_reply();
                msg.push(0);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::RemoveController | ControllerCommand::RemoveDevice => {
                let mut msg = Message::request(
                    "Cancel Remove Node",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_REMOVE_NODE_FROM_NETWORK,
                )
                .with_callback();
                msg.push(REMOVE_NODE_STOP);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::TransferPrimaryRole => {
                let mut msg = Message::request(
                    "Cancel Transfer Primary Role",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_CONTROLLER_CHANGE,
                )
                .with_callback();
                msg.push(CONTROLLER_CHANGE_STOP);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ControllerCommand::CreateButton | ControllerCommand::DeleteButton => {
                if active.node_id != 0 {
                    self.inner.send_slave_learn_mode_off();
                }
            }
            ControllerCommand::None
            | ControllerCommand::HasNodeFailed
            | ControllerCommand::RemoveFailedNode
            | ControllerCommand::ReplaceFailedNode
            | ControllerCommand::RequestNetworkUpdate
            | ControllerCommand::RequestNodeNeighborUpdate
            | ControllerCommand::AssignReturnRoute
            | ControllerCommand::DeleteAllReturnRoutes => {}
        }

        active.clear();
        true
    }

    /// Add a value to the poll list. Adding a value twice is a successful
    /// no-op. Fails if the node is unknown or does not advertise the class.
    pub fn enable_poll(&self, value_id: ValueId) -> bool {
        let mut poll_list = self.inner.poll_list.lock().unwrap();

        let nodes = self.inner.nodes.read().unwrap();
        match nodes.get(value_id.node_id) {
            Some(node) if node.has_command_class(value_id.class_id) => {
                poll_list.insert(value_id);
                true
            }
            Some(_) => {
                info!(
                    "enable_poll failed: node {} does not advertise class 0x{:02x}",
                    value_id.node_id, value_id.class_id
                );
                false
            }
            None => {
                info!("enable_poll failed: node {} not found", value_id.node_id);
                false
            }
        }
    }

    /// Remove a value from the poll list. Returns whether it was present.
    pub fn disable_poll(&self, value_id: ValueId) -> bool {
        self.inner.poll_list.lock().unwrap().remove(value_id)
    }

    /// Whether a value is on the poll list.
    pub fn is_polled(&self, value_id: ValueId) -> bool {
        self.inner.poll_list.lock().unwrap().contains(value_id)
    }

    /// Snapshot of one node, if known.
    pub fn node_summary(&self, node_id: u8) -> Option<NodeSummary> {
        self.inner
            .nodes
            .read()
            .unwrap()
            .get(node_id)
            .map(|node| node.summary())
    }

    /// Ids of all known nodes.
    pub fn node_ids(&self) -> Vec<u8> {
        self.inner.nodes.read().unwrap().ids()
    }

    /// Snapshot of the controller identity.
    pub fn identity(&self) -> ControllerIdentity {
        self.inner.identity.read().unwrap().clone()
    }

    /// The network's home id, zero until the controller has identified
    /// itself.
    pub fn home_id(&self) -> u32 {
        self.inner.home_id()
    }

    /// Snapshot of the transfer and error counters.
    pub fn statistics(&self) -> DriverStatistics {
        self.inner.stats.snapshot()
    }

    /// Frames written to one node so far.
    pub fn node_write_count(&self, node_id: u8) -> u32 {
        self.inner
            .nodes
            .read()
            .unwrap()
            .get(node_id)
            .map_or(0, |node| node.write_count())
    }

    /// Soft-reset the controller chip.
    pub fn soft_reset(&self) {
        info!("soft-resetting the Z-Wave controller chip");
        let msg = Message::request(
            "Soft Reset",
            CONTROLLER_NODE_ID,
            FUNC_ID_SERIAL_API_SOFT_RESET,
        )
        .no_reply();
        self.inner.send_msg(msg, SendQueue::Command);
    }

    /// Factory-reset the controller, erasing all network information.
    pub fn reset_controller(&self) {
        info!("resetting controller and erasing all node information");
        let msg = Message::request(
            "Reset Controller",
            CONTROLLER_NODE_ID,
            FUNC_ID_ZW_SET_DEFAULT,
        )
        .with_callback();
        self.inner.send_msg(msg, SendQueue::Command);
    }

    /// Ask the controller for its current neighbor list of a node; the
    /// reply is copied into the node record.
    pub fn request_node_neighbors(&self, node_id: u8) {
        self.inner.request_node_neighbors(node_id);
    }

    /// Signal shutdown, wait for both tasks, persist state and tear down
    /// the node table.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.driver_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.poll_task.take() {
            let _ = task.await;
        }

        if self.inner.options.save_configuration {
            self.inner.save_config();
        }

        // Free queued messages.
        let _ = self.inner.queues.lock().unwrap().drain_all();

        // Delete the node records, telling the embedder about each.
        let drained = self.inner.nodes.write().unwrap().drain();
        for node in &drained {
            self.inner.queue_notification(NotificationKind::NodeRemoved {
                node_id: node.node_id(),
            });
        }

        self.inner.flush_notifications();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
