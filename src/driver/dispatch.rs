//! The Serial-API demultiplexer.
//!
//! Every verified inbound frame lands here and is dispatched on its
//! (type, function id) pair. Responses are terminal replies to requests we
//! sent; requests are asynchronous controller notifications, including the
//! callback-id-tagged progress frames of long-running network-management
//! commands and the Application Command Handler frames carrying device
//! payloads. After dispatch the generic matcher closes the transaction
//! once the expected callback and reply have both been seen.

use std::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::command_class::wake_up;
use crate::config;
use crate::controller::{ControllerCommand, ControllerState};
use crate::core::constants::*;
use crate::core::error::ConfigError;
use crate::message::Message;
use crate::node::query::QueryStage;
use crate::node::Node;
use crate::notification::NotificationKind;
use crate::queue::SendQueue;

use super::task::Session;

/// Command class id used by controller replication traffic.
const COMMAND_CLASS_CONTROLLER_REPLICATION: u8 = 0x21;

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    /// Dispatch one verified frame (`<type> <function id> <payload…>`).
    pub(crate) fn process_msg(&mut self, data: &[u8]) {
        if data.len() < 2 {
            warn!("runt frame dropped");
            return;
        }

        let mut handle_callback = true;

        if data[0] == RESPONSE {
            match data[1] {
                FUNC_ID_SERIAL_API_GET_INIT_DATA => self.on_init_data_response(data),
                FUNC_ID_ZW_GET_CONTROLLER_CAPABILITIES => {
                    self.on_controller_capabilities_response(data)
                }
                FUNC_ID_SERIAL_API_GET_CAPABILITIES => {
                    self.on_serial_api_capabilities_response(data)
                }
                FUNC_ID_ZW_SEND_DATA => {
                    self.on_send_data_response(data);
                    // A later ZW_SEND_DATA request carries the real outcome.
                    handle_callback = false;
                }
                FUNC_ID_ZW_GET_VERSION => self.on_get_version_response(data),
                FUNC_ID_ZW_MEMORY_GET_ID => self.on_memory_get_id_response(data),
                FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO => self.on_node_protocol_info_response(data),
                FUNC_ID_ZW_ASSIGN_RETURN_ROUTE => {
                    if !self.on_return_route_response(data, "ZW_ASSIGN_RETURN_ROUTE") {
                        self.force_transaction_complete();
                    }
                }
                FUNC_ID_ZW_DELETE_RETURN_ROUTE => {
                    if !self.on_return_route_response(data, "ZW_DELETE_RETURN_ROUTE") {
                        self.force_transaction_complete();
                    }
                }
                FUNC_ID_ZW_ENABLE_SUC => info!("received reply to ZW_ENABLE_SUC"),
                FUNC_ID_ZW_REQUEST_NETWORK_UPDATE => {
                    if !self.on_network_update_response(data) {
                        self.force_transaction_complete();
                    }
                }
                FUNC_ID_ZW_SET_SUC_NODE_ID => info!("received reply to ZW_SET_SUC_NODE_ID"),
                FUNC_ID_ZW_GET_SUC_NODE_ID => self.on_suc_node_id_response(data),
                FUNC_ID_ZW_REQUEST_NODE_INFO => {
                    if data.len() > 2 && data[2] != 0 {
                        debug!("ZW_REQUEST_NODE_INFO request successful");
                    } else {
                        info!("ZW_REQUEST_NODE_INFO request failed");
                    }
                }
                FUNC_ID_ZW_REMOVE_FAILED_NODE_ID => {
                    if !self.on_remove_failed_node_response(data) {
                        self.force_transaction_complete();
                    }
                }
                FUNC_ID_ZW_IS_FAILED_NODE_ID => self.on_is_failed_node_response(data),
                FUNC_ID_ZW_REPLACE_FAILED_NODE => {
                    if !self.on_replace_failed_node_response(data) {
                        self.force_transaction_complete();
                    }
                }
                FUNC_ID_ZW_GET_ROUTING_INFO => self.on_routing_info_response(data),
                FUNC_ID_ZW_R_F_POWER_LEVEL_SET => {
                    info!("received reply to ZW_R_F_POWER_LEVEL_SET")
                }
                FUNC_ID_ZW_READ_MEMORY => info!("received reply to ZW_READ_MEMORY"),
                FUNC_ID_SERIAL_API_SET_TIMEOUTS => {
                    info!("received reply to SERIAL_API_SET_TIMEOUTS")
                }
                FUNC_ID_MEMORY_GET_BYTE => info!("received reply to MEMORY_GET_BYTE"),
                FUNC_ID_ZW_GET_VIRTUAL_NODES => self.on_virtual_nodes_response(data),
                FUNC_ID_ZW_SET_SLAVE_LEARN_MODE => {
                    if !self.on_set_slave_learn_mode_response(data) {
                        self.force_transaction_complete();
                    }
                }
                FUNC_ID_ZW_SEND_SLAVE_NODE_INFO => {
                    if !self.on_send_slave_node_info_response(data) {
                        self.force_transaction_complete();
                    }
                }
                other => info!("unhandled response for function 0x{other:02x}"),
            }
        } else if data[0] == REQUEST {
            match data[1] {
                FUNC_ID_APPLICATION_COMMAND_HANDLER => self.on_application_command(data),
                FUNC_ID_ZW_SEND_DATA => self.on_send_data_request(data),
                FUNC_ID_ZW_ASSIGN_RETURN_ROUTE => {
                    self.on_return_route_request(data, "ZW_ASSIGN_RETURN_ROUTE")
                }
                FUNC_ID_ZW_DELETE_RETURN_ROUTE => {
                    self.on_return_route_request(data, "ZW_DELETE_RETURN_ROUTE")
                }
                FUNC_ID_ZW_REQUEST_NODE_NEIGHBOR_UPDATE => {
                    self.on_neighbor_update_request(data)
                }
                FUNC_ID_ZW_APPLICATION_UPDATE => {
                    handle_callback = !self.on_application_update_request(data);
                }
                FUNC_ID_ZW_ADD_NODE_TO_NETWORK => {
                    info!("ZW_ADD_NODE_TO_NETWORK:");
                    self.on_add_node_progress(FUNC_ID_ZW_ADD_NODE_TO_NETWORK, data);
                }
                FUNC_ID_ZW_REMOVE_NODE_FROM_NETWORK => {
                    info!("ZW_REMOVE_NODE_FROM_NETWORK:");
                    self.on_remove_node_progress(data);
                }
                FUNC_ID_ZW_CREATE_NEW_PRIMARY => {
                    info!("ZW_CREATE_NEW_PRIMARY:");
                    self.on_add_node_progress(FUNC_ID_ZW_CREATE_NEW_PRIMARY, data);
                }
                FUNC_ID_ZW_CONTROLLER_CHANGE => {
                    info!("ZW_CONTROLLER_CHANGE:");
                    self.on_add_node_progress(FUNC_ID_ZW_CONTROLLER_CHANGE, data);
                }
                FUNC_ID_ZW_SET_LEARN_MODE => self.on_set_learn_mode_request(data),
                FUNC_ID_ZW_REQUEST_NETWORK_UPDATE => self.on_network_update_request(data),
                FUNC_ID_ZW_REMOVE_FAILED_NODE_ID => self.on_remove_failed_node_request(data),
                FUNC_ID_ZW_REPLACE_FAILED_NODE => self.on_replace_failed_node_request(data),
                FUNC_ID_ZW_SET_SLAVE_LEARN_MODE => self.on_set_slave_learn_mode_request(data),
                FUNC_ID_ZW_SEND_SLAVE_NODE_INFO => self.on_send_slave_node_info_request(data),
                FUNC_ID_APPLICATION_SLAVE_COMMAND_HANDLER => {
                    self.on_application_slave_command(data)
                }
                FUNC_ID_PROMISCUOUS_APPLICATION_COMMAND_HANDLER => {
                    self.on_promiscuous_application_command(data)
                }
                _ => {}
            }
        }

        if handle_callback {
            self.match_transaction(data);
        }
    }

    /// The generic completion matcher: clear the expected callback id and
    /// expected reply as they arrive; when neither remains, the
    /// transaction is complete.
    fn match_transaction(&mut self, data: &[u8]) {
        if self.txn.expected_callback_id == 0 && self.txn.expected_reply == 0 {
            return;
        }

        if self.txn.expected_callback_id != 0
            && data.len() > 2
            && self.txn.expected_callback_id == data[2]
        {
            debug!("expected callback id was received");
            self.txn.expected_callback_id = 0;
        }

        if self.txn.expected_reply != 0 && self.txn.expected_reply == data[1] {
            if self.txn.expected_command_class_id != 0
                && self.txn.expected_reply == FUNC_ID_APPLICATION_COMMAND_HANDLER
            {
                if data.len() > 5
                    && self.txn.expected_command_class_id == data[5]
                    && self.txn.expected_node_id == data[3]
                {
                    debug!("expected reply and command class were received");
                    self.txn.expected_reply = 0;
                    self.txn.expected_command_class_id = 0;
                    self.txn.expected_node_id = 0;
                }
            } else {
                debug!("expected reply was received");
                self.txn.expected_reply = 0;
            }
        }

        if self.txn.expected_callback_id == 0 && self.txn.expected_reply == 0 {
            self.complete_transaction();
        }
    }

    /// A response just told us the callback for this request will never
    /// arrive; complete the transaction instead of timing it out.
    fn force_transaction_complete(&mut self) {
        debug!("forcing transaction completion, no callback will follow");
        self.complete_transaction();
    }

    // =========================================================================
    // RESPONSES
    // =========================================================================

    fn on_get_version_response(&mut self, data: &[u8]) {
        let tail = &data[2..];
        let nul = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let version = String::from_utf8_lossy(&tail[..nul]).into_owned();
        let library_type = tail.get(nul + 1).copied().unwrap_or(0);

        let mut identity = self.inner.identity.write().unwrap();
        identity.library_version = version;
        identity.library_type = library_type;
        info!(
            "received reply to ZW_GET_VERSION: {} library, version {}",
            identity.library_type_name(),
            identity.library_version
        );
    }

    fn on_controller_capabilities_response(&mut self, data: &[u8]) {
        if data.len() < 3 {
            return;
        }
        let caps = data[2];
        self.inner.identity.write().unwrap().controller_caps = caps;

        info!("received reply to ZW_GET_CONTROLLER_CAPABILITIES:");
        if caps & CONTROLLER_CAPS_SIS != 0 {
            info!("    there is a SUC id server (SIS) in this network");
        } else {
            info!(
                "    there is no SIS; we are a {} controller",
                if caps & CONTROLLER_CAPS_SECONDARY != 0 {
                    "secondary"
                } else {
                    "primary"
                }
            );
        }
        if caps & CONTROLLER_CAPS_SUC != 0 {
            info!("    we are a static update controller");
        }
        if caps & CONTROLLER_CAPS_ON_OTHER_NETWORK != 0 {
            info!("    using a home id from another network");
        }
    }

    fn on_serial_api_capabilities_response(&mut self, data: &[u8]) {
        if data.len() < 42 {
            warn!("short SERIAL_API_GET_CAPABILITIES reply");
            return;
        }

        info!("received reply to SERIAL_API_GET_CAPABILITIES:");
        info!("    application version: {}.{}", data[2], data[3]);

        let is_bridge = {
            let mut identity = self.inner.identity.write().unwrap();
            identity.manufacturer_id = u16::from_be_bytes([data[4], data[5]]);
            identity.product_type = u16::from_be_bytes([data[6], data[7]]);
            identity.product_id = u16::from_be_bytes([data[8], data[9]]);
            identity.api_mask.copy_from_slice(&data[10..42]);
            info!(
                "    manufacturer 0x{:04x}, product type 0x{:04x}, product 0x{:04x}",
                identity.manufacturer_id, identity.product_type, identity.product_id
            );
            identity.is_bridge_controller()
        };

        if is_bridge {
            self.inner.send_msg(
                Message::request(
                    "Get Virtual Nodes",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_GET_VIRTUAL_NODES,
                ),
                SendQueue::Command,
            );
        }
        self.inner.send_msg(
            Message::request(
                "Get Init Data",
                CONTROLLER_NODE_ID,
                FUNC_ID_SERIAL_API_GET_INIT_DATA,
            ),
            SendQueue::Command,
        );
    }

    fn on_memory_get_id_response(&mut self, data: &[u8]) {
        if data.len() < 7 {
            return;
        }
        let home_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let node_id = data[6];
        info!(
            "received reply to ZW_MEMORY_GET_ID: home id 0x{home_id:08x}, our node id {node_id}"
        );

        let mut identity = self.inner.identity.write().unwrap();
        identity.home_id = home_id;
        identity.node_id = node_id;
    }

    fn on_suc_node_id_response(&mut self, data: &[u8]) {
        if data.len() < 3 {
            return;
        }
        info!("received reply to ZW_GET_SUC_NODE_ID: node id {}", data[2]);
        if data[2] != 0 {
            return;
        }

        info!("    no SUC, so we become the SIS");
        let our_node_id = self.inner.identity.read().unwrap().node_id;

        let mut msg = Message::request("Enable SUC", our_node_id, FUNC_ID_ZW_ENABLE_SUC);
        msg.push(1);
        msg.push(SUC_FUNC_NODEID_SERVER);
        self.inner.send_msg(msg, SendQueue::Send);

        let mut msg = Message::request("Set SUC Node Id", our_node_id, FUNC_ID_ZW_SET_SUC_NODE_ID);
        msg.push(our_node_id);
        msg.push(1); // become SUC/SIS
        msg.push(0); // no low power
        msg.push(SUC_FUNC_NODEID_SERVER);
        self.inner.send_msg(msg, SendQueue::Send);
    }

    fn on_init_data_response(&mut self, data: &[u8]) {
        let first_init = !self.inner.init_done.load(Ordering::Relaxed);
        if first_init {
            // The driver is operational from this point; the embedder must
            // hear that before any node notifications.
            let (home_id, our_node_id) = {
                let identity = self.inner.identity.read().unwrap();
                (identity.home_id, identity.node_id)
            };
            self.inner
                .queue_notification(NotificationKind::DriverReady {
                    node_id: our_node_id,
                });
            self.load_persisted_config(home_id, our_node_id);
        }

        info!("received reply to SERIAL_API_GET_INIT_DATA:");
        {
            let mut identity = self.inner.identity.write().unwrap();
            if data.len() > 3 {
                identity.init_version = data[2];
                identity.init_caps = data[3];
            }
        }

        if data.len() >= 5 + NUM_NODE_BITFIELD_BYTES
            && data[4] as usize == NUM_NODE_BITFIELD_BYTES
        {
            let identity = self.inner.identity.read().unwrap().clone();
            let bitmap = &data[5..5 + NUM_NODE_BITFIELD_BYTES];

            for byte_index in 0..NUM_NODE_BITFIELD_BYTES {
                for bit in 0..8 {
                    let node_id = (byte_index * 8 + bit + 1) as u8;
                    let present = bitmap[byte_index] & (1 << bit) != 0;

                    if present {
                        if identity.is_virtual_node(node_id) {
                            info!("    node {node_id:03} - virtual (ignored)");
                            continue;
                        }
                        let known = self.inner.nodes.read().unwrap().contains(node_id);
                        if known {
                            info!("    node {node_id:03} - known");
                            if first_init {
                                // Restored from config: only its session and
                                // dynamic state needs refreshing.
                                let mut nodes = self.inner.nodes.write().unwrap();
                                if let Some(node) = nodes.get_mut(node_id) {
                                    node.set_query_stage(QueryStage::Associations);
                                }
                            }
                            self.inner.advance_node_queries(node_id);
                        } else {
                            info!("    node {node_id:03} - new");
                            self.inner
                                .queue_notification(NotificationKind::NodeNew { node_id });
                            self.inner.init_node(node_id);
                        }
                    } else {
                        let existed = self.inner.nodes.write().unwrap().remove(node_id).is_some();
                        if existed {
                            info!("    node {node_id:03} - removed");
                            self.inner
                                .queue_notification(NotificationKind::NodeRemoved { node_id });
                        }
                    }
                }
            }
        }

        self.inner.init_done.store(true, Ordering::Relaxed);
        self.inner.check_completed_node_queries();
    }

    fn load_persisted_config(&mut self, home_id: u32, our_node_id: u8) {
        let options = &self.inner.options;
        match config::load_config(&options.user_path, home_id, our_node_id) {
            Ok(persisted) => {
                info!(
                    "restored configuration for home 0x{home_id:08x} ({} nodes)",
                    persisted.nodes.len()
                );
                self.inner
                    .poll_interval_secs
                    .store(persisted.poll_interval_secs, Ordering::Relaxed);

                for record in &persisted.nodes {
                    let mut node =
                        Node::from_record(home_id, record, options.class_factory.as_ref());
                    self.inner.apply_persisted_buttons(&mut node);
                    self.inner.nodes.write().unwrap().insert(node);
                    self.inner.queue_notification(NotificationKind::NodeAdded {
                        node_id: record.node_id,
                    });
                }
            }
            Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no saved configuration for home 0x{home_id:08x}, starting fresh");
            }
            Err(err) => {
                warn!("refusing saved configuration: {err}");
            }
        }
    }

    fn on_node_protocol_info_response(&mut self, data: &[u8]) {
        // The reply does not name its node; it belongs to the most recent
        // request.
        let Some(node_id) = self.txn.current.as_ref().map(Message::target_node_id) else {
            warn!("unexpected ZW_GET_NODE_PROTOCOL_INFO reply - ignoring");
            return;
        };
        info!("received protocol info for node {node_id:03}");

        let updated = {
            let mut nodes = self.inner.nodes.write().unwrap();
            nodes
                .get_mut(node_id)
                .map(|node| node.update_protocol_info(&data[2..]))
        };
        if updated == Some(true) {
            self.inner
                .send_query_stage_complete(node_id, QueryStage::ProtocolInfo);
        }
    }

    fn on_send_data_response(&mut self, data: &[u8]) {
        if data.len() > 2 && data[2] != 0 {
            debug!("ZW_SEND_DATA delivered to Z-Wave stack");
        } else {
            warn!("ERROR: ZW_SEND_DATA could not be delivered to Z-Wave stack");
        }
    }

    fn on_return_route_response(&mut self, data: &[u8], name: &str) -> bool {
        if data.len() > 2 && data[2] != 0 {
            info!("received reply to {name} - command in progress");
            self.inner.controller_callback(ControllerState::InProgress);
            true
        } else {
            warn!("received reply to {name} - command failed");
            self.inner.controller_callback(ControllerState::Failed);
            self.inner.clear_controller_command();
            false
        }
    }

    fn on_network_update_response(&mut self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            info!("received reply to ZW_REQUEST_NETWORK_UPDATE - command in progress");
            self.inner.controller_callback(ControllerState::InProgress);
            true
        } else {
            warn!("received reply to ZW_REQUEST_NETWORK_UPDATE - command failed");
            self.inner.controller_callback(ControllerState::Failed);
            self.inner.clear_controller_command();
            false
        }
    }

    fn on_remove_failed_node_response(&mut self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            warn!("received reply to ZW_REMOVE_FAILED_NODE_ID - command failed");
            self.inner.controller_callback(ControllerState::Failed);
            self.inner.clear_controller_command();
            false
        } else {
            info!("received reply to ZW_REMOVE_FAILED_NODE_ID - command in progress");
            self.inner.controller_callback(ControllerState::InProgress);
            true
        }
    }

    fn on_is_failed_node_response(&mut self, data: &[u8]) {
        let node_id = self.inner.active_command.lock().unwrap().node_id;
        let failed = data.len() > 2 && data[2] != 0;
        info!(
            "received reply to ZW_IS_FAILED_NODE_ID - node {node_id} has {}",
            if failed { "failed" } else { "not failed" }
        );
        self.inner.controller_callback(if failed {
            ControllerState::NodeFailed
        } else {
            ControllerState::NodeOk
        });
        self.inner.clear_controller_command();
    }

    fn on_replace_failed_node_response(&mut self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            warn!("received reply to ZW_REPLACE_FAILED_NODE - command failed");
            self.inner.controller_callback(ControllerState::Failed);
            self.inner.clear_controller_command();
            false
        } else {
            info!("received reply to ZW_REPLACE_FAILED_NODE - command in progress");
            self.inner.controller_callback(ControllerState::InProgress);
            true
        }
    }

    fn on_routing_info_response(&mut self, data: &[u8]) {
        info!("received reply to ZW_GET_ROUTING_INFO");
        let node_id = self.inner.active_command.lock().unwrap().node_id;

        if data.len() >= 2 + NUM_NODE_BITFIELD_BYTES {
            let mut nodes = self.inner.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(node_id) {
                node.set_neighbors(&data[2..2 + NUM_NODE_BITFIELD_BYTES]);
                let neighbors = node.neighbor_ids();
                if neighbors.is_empty() {
                    info!("    (none reported)");
                } else {
                    for neighbor in neighbors {
                        info!("    node {neighbor}");
                    }
                }
            }
        }

        self.inner.controller_callback(ControllerState::Completed);
        self.inner.clear_controller_command();
    }

    fn on_virtual_nodes_response(&mut self, data: &[u8]) {
        if data.len() < 2 + NUM_NODE_BITFIELD_BYTES {
            return;
        }
        info!("received reply to ZW_GET_VIRTUAL_NODES");
        let mut identity = self.inner.identity.write().unwrap();
        identity
            .virtual_neighbors
            .copy_from_slice(&data[2..2 + NUM_NODE_BITFIELD_BYTES]);
        identity.virtual_neighbors_received = true;

        let ids = identity.virtual_node_ids();
        if ids.is_empty() {
            info!("    (none reported)");
        } else {
            for id in ids {
                info!("    node {id}");
            }
        }
    }

    fn on_set_slave_learn_mode_response(&mut self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            info!("received reply to ZW_SET_SLAVE_LEARN_MODE - command in progress");
            self.inner.controller_callback(ControllerState::InProgress);
            true
        } else {
            warn!("received reply to ZW_SET_SLAVE_LEARN_MODE - command failed");
            self.inner.controller_callback(ControllerState::Failed);
            self.inner.clear_controller_command();
            self.inner.send_slave_learn_mode_off();
            false
        }
    }

    fn on_send_slave_node_info_response(&mut self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            info!("received reply to ZW_SEND_SLAVE_NODE_INFO - command in progress");
            self.inner.controller_callback(ControllerState::InProgress);
            true
        } else {
            warn!("received reply to ZW_SEND_SLAVE_NODE_INFO - command failed");
            // Roll the button map back; the binding never reached the
            // handheld.
            let (node_id, button_id) = {
                let active = self.inner.active_command.lock().unwrap();
                (active.node_id, active.arg)
            };
            {
                let mut nodes = self.inner.nodes.write().unwrap();
                if let Some(node) = nodes.get_mut(node_id) {
                    node.unmap_button(button_id);
                }
            }
            self.inner.controller_callback(ControllerState::Failed);
            self.inner.clear_controller_command();
            false
        }
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    fn on_send_data_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        debug!(
            "ZW_SEND_DATA request with callback id 0x{:02x} (expected 0x{:02x})",
            data[2], self.txn.expected_callback_id
        );

        if data[2] != self.txn.expected_callback_id {
            warn!("callback id is invalid");
            return;
        }

        match data[3] {
            TRANSMIT_COMPLETE_NOROUTE => {
                warn!("ERROR: ZW_SEND_DATA failed, no route available - dropping message");
                self.txn.clear();
            }
            TRANSMIT_COMPLETE_NO_ACK => {
                warn!("ERROR: ZW_SEND_DATA failed, no ACK received - device may be asleep");
                if let Some(target) = self.txn.current.as_ref().map(Message::target_node_id) {
                    if self.move_messages_to_wake_up_queue(target) {
                        return;
                    }
                    warn!("device is not a sleeping node - retrying the send");
                }
            }
            TRANSMIT_COMPLETE_FAIL => {
                // Busy network; the retry timer will resend.
                warn!("ERROR: ZW_SEND_DATA failed, network is busy");
            }
            _ => {
                // Reception acknowledged by the target node.
                self.txn.expected_callback_id = 0;
            }
        }
    }

    fn on_application_command(&mut self, data: &[u8]) {
        if data.len() < 7 {
            warn!("runt application command frame dropped");
            return;
        }
        let node_id = data[3];
        let length = data[4] as usize;
        let class_id = data[5];
        if length < 2 || data.len() < 5 + length {
            warn!("truncated application command frame dropped");
            return;
        }
        let payload = &data[6..5 + length];

        // Replication traffic during a ReceiveConfiguration counts as
        // progress even though the payloads themselves are not consumed.
        if class_id == COMMAND_CLASS_CONTROLLER_REPLICATION {
            let receiving = self.inner.active_command.lock().unwrap().command
                == ControllerCommand::ReceiveConfiguration;
            if receiving {
                self.inner.controller_callback(ControllerState::InProgress);
            }
            return;
        }

        if class_id == COMMAND_CLASS_WAKE_UP {
            match payload.first() {
                Some(&WAKE_UP_NOTIFICATION) => self.process_wake_up_notification(node_id),
                Some(&WAKE_UP_INTERVAL_REPORT) => {
                    if let Some(secs) = wake_up::parse_interval_report(payload) {
                        info!("node {node_id:03}: wake-up interval is {secs} seconds");
                        let mut nodes = self.inner.nodes.write().unwrap();
                        if let Some(wake_up) =
                            nodes.get_mut(node_id).and_then(Node::wake_up_mut)
                        {
                            wake_up.set_interval_secs(secs);
                        }
                        drop(nodes);
                        self.inner
                            .send_query_stage_complete(node_id, QueryStage::WakeUp);
                    }
                }
                _ => debug!("node {node_id:03}: unhandled wake-up command"),
            }
            return;
        }

        let ctx = {
            let mut nodes = self.inner.nodes.write().unwrap();
            nodes
                .get_mut(node_id)
                .map(|node| node.handle_application_command(class_id, payload, 1))
        };
        match ctx {
            Some(ctx) => self.inner.apply_class_context(ctx),
            None => debug!("application command for unknown node {node_id:03} dropped"),
        }
    }

    fn on_promiscuous_application_command(&mut self, data: &[u8]) {
        match &self.inner.options.promiscuous_handler {
            Some(handler) => handler(data),
            None => debug!("promiscuous frame dropped: no handler registered"),
        }
    }

    fn on_application_slave_command(&mut self, data: &[u8]) {
        if data.len() < 6 {
            return;
        }
        debug!(
            "APPLICATION_SLAVE_COMMAND_HANDLER rx status 0x{:02x} dest {} source {} length {}",
            data[2], data[3], data[4], data[5]
        );

        // Only Basic Set presses are mapped onto buttons.
        if data.len() < 9 || data[5] != 3 || data[6] != COMMAND_CLASS_BASIC || data[7] != BASIC_SET
        {
            return;
        }

        let virtual_node_id = data[3];
        let source_node_id = data[4];
        let button_id = {
            let nodes = self.inner.nodes.read().unwrap();
            nodes
                .get(source_node_id)
                .and_then(|node| node.button_for_virtual_node(virtual_node_id))
        };

        if let Some(button_id) = button_id {
            let kind = if data[8] == 0 {
                NotificationKind::ButtonOff {
                    node_id: source_node_id,
                    button_id,
                }
            } else {
                NotificationKind::ButtonOn {
                    node_id: source_node_id,
                    button_id,
                }
            };
            self.inner.queue_notification(kind);
        }
    }

    fn on_application_update_request(&mut self, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let mut message_removed = false;
        let node_id = data[3];

        match data[2] {
            UPDATE_STATE_SUC_ID => {
                info!("UPDATE_STATE_SUC_ID from node {node_id}");
            }
            UPDATE_STATE_DELETE_DONE => {
                info!("** network change **: node {node_id} was removed");
                let existed = self.inner.nodes.write().unwrap().remove(node_id).is_some();
                if existed {
                    self.inner
                        .queue_notification(NotificationKind::NodeRemoved { node_id });
                }
            }
            UPDATE_STATE_NEW_ID_ASSIGNED => {
                info!("** network change **: id {node_id} was assigned to a new node");
                self.inner.init_node(node_id);
            }
            UPDATE_STATE_ROUTING_PENDING => {
                debug!("UPDATE_STATE_ROUTING_PENDING from node {node_id}");
            }
            UPDATE_STATE_NODE_INFO_REQ_FAILED => {
                warn!("UPDATE_STATE_NODE_INFO_REQ_FAILED received");
                // The node id is always zero here; the failure belongs to
                // the request we have in flight.
                if let Some(target) = self.txn.current.as_ref().map(Message::target_node_id) {
                    if self.handle_node_query_failure(target) {
                        message_removed = true;
                    }
                }
            }
            UPDATE_STATE_NODE_INFO_REQ_DONE => {
                debug!("UPDATE_STATE_NODE_INFO_REQ_DONE from node {node_id}");
            }
            UPDATE_STATE_NODE_INFO_RECEIVED => {
                info!("UPDATE_STATE_NODE_INFO_RECEIVED from node {node_id}");
                let length = data[4] as usize;
                if length >= 3 && data.len() >= 5 + length {
                    let class_ids = &data[8..5 + length];
                    {
                        let mut nodes = self.inner.nodes.write().unwrap();
                        if let Some(node) = nodes.get_mut(node_id) {
                            node.update_node_info(
                                class_ids,
                                self.inner.options.class_factory.as_ref(),
                            );
                        }
                    }
                    self.inner
                        .send_query_stage_complete(node_id, QueryStage::NodeInfo);
                }
            }
            other => {
                debug!("unhandled application update state 0x{other:02x}");
            }
        }

        if message_removed {
            self.txn.clear();
        }
        message_removed
    }

    /// Shared progress handler for the add-node-shaped commands
    /// (add node, create new primary, controller change).
    fn on_add_node_progress(&mut self, function_id: u8, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            ADD_NODE_STATUS_LEARN_READY => {
                info!("ADD_NODE_STATUS_LEARN_READY");
                self.inner.active_command.lock().unwrap().controller_added = false;
                self.inner.controller_callback(ControllerState::Waiting);
            }
            ADD_NODE_STATUS_NODE_FOUND => {
                info!("ADD_NODE_STATUS_NODE_FOUND");
                self.inner.controller_callback(ControllerState::InProgress);
            }
            ADD_NODE_STATUS_ADDING_SLAVE => {
                info!("ADD_NODE_STATUS_ADDING_SLAVE: node id {}", data[4]);
                let mut active = self.inner.active_command.lock().unwrap();
                active.controller_added = false;
                active.node_id = data[4];
            }
            ADD_NODE_STATUS_ADDING_CONTROLLER => {
                info!("ADD_NODE_STATUS_ADDING_CONTROLLER: node id {}", data[4]);
                let mut active = self.inner.active_command.lock().unwrap();
                active.controller_added = true;
                active.node_id = data[4];
            }
            ADD_NODE_STATUS_PROTOCOL_DONE => {
                info!("ADD_NODE_STATUS_PROTOCOL_DONE");
                // Replication to an added controller is not supported, so in
                // every case we leave add mode before anything else joins.
                let mut msg = Message::request(
                    "Add Node Mode Stop",
                    CONTROLLER_NODE_ID,
                    function_id,
                )
                .with_callback();
                msg.push(ADD_NODE_STOP);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            ADD_NODE_STATUS_DONE => {
                info!("ADD_NODE_STATUS_DONE");
                let node_id = self.inner.active_command.lock().unwrap().node_id;
                if node_id != 0 && node_id != CONTROLLER_NODE_ID {
                    self.inner.init_node(node_id);
                }
                self.inner.controller_callback(ControllerState::Completed);
                self.inner.clear_controller_command();
            }
            ADD_NODE_STATUS_FAILED => {
                warn!("ADD_NODE_STATUS_FAILED");
                self.inner.controller_callback(ControllerState::Failed);
                self.inner.clear_controller_command();

                // Drop the add-mode request and leave add mode so nothing
                // joins by accident.
                self.txn.clear();
                let mut msg = Message::request(
                    "Add Node Stop (Failed)",
                    CONTROLLER_NODE_ID,
                    function_id,
                )
                .with_callback();
                msg.push(ADD_NODE_STOP_FAILED);
                self.inner.send_msg(msg, SendQueue::Command);
            }
            _ => {}
        }
    }

    fn on_remove_node_progress(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            REMOVE_NODE_STATUS_LEARN_READY => {
                info!("REMOVE_NODE_STATUS_LEARN_READY");
                self.inner.active_command.lock().unwrap().node_id = 0;
                self.inner.controller_callback(ControllerState::Waiting);
            }
            REMOVE_NODE_STATUS_NODE_FOUND => {
                info!("REMOVE_NODE_STATUS_NODE_FOUND");
                self.inner.controller_callback(ControllerState::InProgress);
            }
            REMOVE_NODE_STATUS_REMOVING_SLAVE => {
                info!("REMOVE_NODE_STATUS_REMOVING_SLAVE: node id {}", data[4]);
                self.inner.active_command.lock().unwrap().node_id = data[4];
            }
            REMOVE_NODE_STATUS_REMOVING_CONTROLLER => {
                info!("REMOVE_NODE_STATUS_REMOVING_CONTROLLER");
                let mut target = data[4];
                if target == 0 {
                    // Some controllers do not report the node id; try to
                    // match the leaving controller by its device class.
                    if data.len() >= 9 && data[5] >= 3 {
                        let our_node_id = self.inner.identity.read().unwrap().node_id;
                        let nodes = self.inner.nodes.read().unwrap();
                        for node in nodes.iter() {
                            if node.node_id() == our_node_id {
                                continue;
                            }
                            if node.device_class() == (data[6], data[7], data[8]) {
                                if target != 0 {
                                    info!(
                                        "alternative controller lookup found more than one match, using the first"
                                    );
                                } else {
                                    target = node.node_id();
                                }
                            }
                        }
                    } else {
                        warn!("node id is 0 but not enough data for an alternative match");
                    }
                }
                self.inner.active_command.lock().unwrap().node_id = target;
                info!("removing controller id {target}");
            }
            REMOVE_NODE_STATUS_DONE => {
                info!("REMOVE_NODE_STATUS_DONE");
                let mut target = self.inner.active_command.lock().unwrap().node_id;
                if target == 0 && data[4] != 0 {
                    target = data[4];
                }

                if target != 0 && target != CONTROLLER_NODE_ID {
                    let existed = self.inner.nodes.write().unwrap().remove(target).is_some();
                    if existed {
                        self.inner
                            .queue_notification(NotificationKind::NodeRemoved { node_id: target });
                    }
                }
                self.inner.controller_callback(ControllerState::Completed);
                self.inner.clear_controller_command();
            }
            REMOVE_NODE_STATUS_FAILED => {
                warn!("REMOVE_NODE_STATUS_FAILED");
                self.inner.controller_callback(ControllerState::Failed);
                self.inner.clear_controller_command();
            }
            _ => {}
        }
    }

    fn on_set_learn_mode_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        info!("ZW_SET_LEARN_MODE:");
        match data[3] {
            LEARN_MODE_STARTED => {
                info!("LEARN_MODE_STARTED");
                self.inner.controller_callback(ControllerState::Waiting);
            }
            LEARN_MODE_DONE => {
                info!("LEARN_MODE_DONE");
                self.inner.controller_callback(ControllerState::Completed);
                self.inner.clear_controller_command();

                // Stop learn mode, then rebuild every node record; whatever
                // we received during replication applies as nodes are
                // rediscovered.
                let mut msg = Message::request(
                    "End Learn Mode",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_SET_LEARN_MODE,
                )
                .no_reply();
                msg.push(0);
                self.inner.send_msg(msg, SendQueue::Command);

                self.inner.init_all_nodes();
            }
            LEARN_MODE_FAILED => {
                warn!("LEARN_MODE_FAILED");
                self.inner.controller_callback(ControllerState::Failed);
                self.inner.clear_controller_command();

                let mut msg = Message::request(
                    "Controller Change Failed",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_CONTROLLER_CHANGE,
                )
                .with_callback();
                msg.push(CONTROLLER_CHANGE_STOP_FAILED);
                self.inner.send_msg(msg, SendQueue::Command);

                // The failed exchange may have half-updated us; rebuild.
                self.inner.init_all_nodes();
            }
            LEARN_MODE_DELETED => {
                info!("LEARN_MODE_DELETED");
            }
            _ => {}
        }
    }

    fn on_network_update_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let state = match data[3] {
            SUC_UPDATE_DONE => {
                info!("ZW_REQUEST_NETWORK_UPDATE: success");
                ControllerState::Completed
            }
            SUC_UPDATE_ABORT => {
                warn!("ZW_REQUEST_NETWORK_UPDATE failed: process aborted");
                ControllerState::Failed
            }
            SUC_UPDATE_WAIT => {
                warn!("ZW_REQUEST_NETWORK_UPDATE failed: SUC is busy");
                ControllerState::Failed
            }
            SUC_UPDATE_DISABLED => {
                warn!("ZW_REQUEST_NETWORK_UPDATE failed: SUC is disabled");
                ControllerState::Failed
            }
            SUC_UPDATE_OVERFLOW => {
                warn!("ZW_REQUEST_NETWORK_UPDATE failed: overflow, full replication required");
                ControllerState::Failed
            }
            _ => ControllerState::Failed,
        };

        self.inner.controller_callback(state);
        self.inner.clear_controller_command();
    }

    fn on_neighbor_update_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            REQUEST_NEIGHBOR_UPDATE_STARTED => {
                info!("REQUEST_NEIGHBOR_UPDATE_STARTED");
                self.inner.controller_callback(ControllerState::InProgress);
            }
            REQUEST_NEIGHBOR_UPDATE_DONE => {
                info!("REQUEST_NEIGHBOR_UPDATE_DONE");
                // Fetch the fresh neighbor list into the node record; its
                // arrival completes the command.
                let node_id = self.inner.active_command.lock().unwrap().node_id;
                self.inner.request_node_neighbors(node_id);
            }
            REQUEST_NEIGHBOR_UPDATE_FAILED => {
                warn!("REQUEST_NEIGHBOR_UPDATE_FAILED");
                self.inner.controller_callback(ControllerState::Failed);
                self.inner.clear_controller_command();
            }
            _ => {}
        }
    }

    fn on_remove_failed_node_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let node_id = self.inner.active_command.lock().unwrap().node_id;
        let state = match data[3] {
            FAILED_NODE_OK => {
                warn!("node {node_id} is OK, so command failed");
                ControllerState::NodeOk
            }
            FAILED_NODE_REMOVED => {
                info!("node {node_id} successfully moved to the failed nodes list");
                let existed = self.inner.nodes.write().unwrap().remove(node_id).is_some();
                if existed {
                    self.inner
                        .queue_notification(NotificationKind::NodeRemoved { node_id });
                }
                ControllerState::Completed
            }
            FAILED_NODE_NOT_REMOVED => {
                warn!("unable to move node {node_id} to the failed nodes list");
                ControllerState::Failed
            }
            _ => ControllerState::Failed,
        };

        self.inner.controller_callback(state);
        self.inner.clear_controller_command();
    }

    fn on_replace_failed_node_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let node_id = self.inner.active_command.lock().unwrap().node_id;
        match data[3] {
            FAILED_NODE_OK => {
                info!("node {node_id} is OK, so command failed");
                self.inner.controller_callback(ControllerState::NodeOk);
                self.inner.clear_controller_command();
            }
            FAILED_NODE_REPLACE_WAITING => {
                info!("waiting for the replacement of node {node_id}");
                self.inner.controller_callback(ControllerState::Waiting);
            }
            FAILED_NODE_REPLACE_DONE => {
                info!("node {node_id} successfully replaced");
                self.inner.controller_callback(ControllerState::Completed);
                self.inner.clear_controller_command();
                // Interrogate the replacement under the old id.
                self.inner.init_node(node_id);
            }
            FAILED_NODE_REPLACE_FAILED => {
                warn!("replacement of node {node_id} failed");
                self.inner.controller_callback(ControllerState::Failed);
                self.inner.clear_controller_command();
            }
            _ => {}
        }
    }

    fn on_set_slave_learn_mode_request(&mut self, data: &[u8]) {
        if data.len() < 6 {
            return;
        }
        self.inner.send_slave_learn_mode_off();

        let (command_node_id, button_id) = {
            let active = self.inner.active_command.lock().unwrap();
            (active.node_id, active.arg)
        };

        match data[3] {
            SLAVE_ASSIGN_COMPLETE | SLAVE_ASSIGN_NODEID_DONE => {
                if data[4] == 0 {
                    // Original id zero: a virtual node was created for us.
                    let virtual_node_id = data[5];
                    info!("adding virtual node id {virtual_node_id}");
                    {
                        let mut nodes = self.inner.nodes.write().unwrap();
                        if let Some(node) = nodes.get_mut(command_node_id) {
                            node.map_button(button_id, virtual_node_id);
                        }
                    }
                    self.inner
                        .send_virtual_node_info(virtual_node_id, command_node_id);
                } else if data[5] == 0 {
                    info!("removing virtual node id {}", data[4]);
                }
            }
            SLAVE_ASSIGN_RANGE_INFO_UPDATE => {
                info!("SLAVE_ASSIGN_RANGE_INFO_UPDATE");
            }
            _ => {}
        }

        self.inner.active_command.lock().unwrap().controller_added = false;
        self.inner.controller_callback(ControllerState::Waiting);
    }

    fn on_send_slave_node_info_request(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let (node_id, button_id) = {
            let active = self.inner.active_command.lock().unwrap();
            (active.node_id, active.arg)
        };

        if data[3] == TRANSMIT_COMPLETE_OK {
            info!("SEND_SLAVE_NODE_INFO_COMPLETE: transmit OK");

            self.inner.save_buttons();
            self.inner
                .queue_notification(NotificationKind::CreateButton { node_id, button_id });
            self.inner.controller_callback(ControllerState::Completed);
            self.inner.clear_controller_command();

            // The bitmap may have grown; refresh it.
            self.inner.send_msg(
                Message::request(
                    "Get Virtual Nodes",
                    CONTROLLER_NODE_ID,
                    FUNC_ID_ZW_GET_VIRTUAL_NODES,
                ),
                SendQueue::Send,
            );
        } else {
            warn!(
                "SEND_SLAVE_NODE_INFO_COMPLETE: transmit status 0x{:02x}, retrying",
                data[3]
            );
            let virtual_node_id = {
                let nodes = self.inner.nodes.read().unwrap();
                nodes
                    .get(node_id)
                    .and_then(|node| node.virtual_node_for_button(button_id))
            };
            if let Some(virtual_node_id) = virtual_node_id {
                self.inner.send_virtual_node_info(virtual_node_id, node_id);
            }
        }
    }

    fn on_return_route_request(&mut self, data: &[u8], name: &str) {
        if data.len() < 4 {
            return;
        }
        let node_id = self.inner.active_command.lock().unwrap().node_id;
        if data[3] == TRANSMIT_COMPLETE_OK {
            info!("{name} for node {node_id} - success");
            self.inner.controller_callback(ControllerState::Completed);
        } else {
            warn!("{name} for node {node_id} - failed (status 0x{:02x})", data[3]);
            self.inner.controller_callback(ControllerState::Failed);
        }
        self.inner.clear_controller_command();
    }
}
