//! Protocol constants of the Z-Wave Serial API.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

#![allow(missing_docs)]

use std::time::Duration;

// =============================================================================
// FRAMING TOKENS
// =============================================================================

/// Start of frame.
pub const SOF: u8 = 0x01;

/// Frame acknowledged.
pub const ACK: u8 = 0x06;

/// Frame rejected (bad checksum); sender should retransmit.
pub const NAK: u8 = 0x15;

/// Frame cancelled (collision); sender should retransmit.
pub const CAN: u8 = 0x18;

/// Frame type: host-initiated request, or unsolicited controller callback.
pub const REQUEST: u8 = 0x00;

/// Frame type: immediate reply to a request.
pub const RESPONSE: u8 = 0x01;

// =============================================================================
// TRANSACTION TIMING
// =============================================================================

/// Maximum transmission attempts before a message is dropped.
pub const MAX_TRIES: u8 = 3;

/// Resend the in-flight message if no completion arrives within this window.
pub const RETRY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Deadline for the length byte after a SOF has been seen.
pub const LENGTH_BYTE_TIMEOUT: Duration = Duration::from_millis(100);

/// Deadline for the remainder of a frame after its length byte.
pub const FRAME_BODY_TIMEOUT: Duration = Duration::from_millis(500);

/// Reconnect backoff for the first [`RECONNECT_FAST_ATTEMPTS`] attempts.
pub const RECONNECT_FAST_BACKOFF: Duration = Duration::from_secs(5);

/// Reconnect backoff once the fast attempts are exhausted.
pub const RECONNECT_SLOW_BACKOFF: Duration = Duration::from_secs(30);

/// Number of reconnect attempts made at the fast backoff.
pub const RECONNECT_FAST_ATTEMPTS: u32 = 25;

// =============================================================================
// NETWORK LIMITS
// =============================================================================

/// Bytes in a node bitmask (232 bits, one per addressable node).
pub const NUM_NODE_BITFIELD_BYTES: usize = 29;

/// Highest addressable node id.
pub const MAX_NODES: u8 = 232;

/// Slots reserved in the node table (ids 233..=255 are reserved by the
/// protocol but never populated).
pub const NODE_TABLE_SLOTS: usize = 256;

/// Target node id meaning "the controller itself".
pub const CONTROLLER_NODE_ID: u8 = 0xff;

// =============================================================================
// FUNCTION IDS
// =============================================================================

pub const FUNC_ID_SERIAL_API_GET_INIT_DATA: u8 = 0x02;
pub const FUNC_ID_APPLICATION_COMMAND_HANDLER: u8 = 0x04;
pub const FUNC_ID_ZW_GET_CONTROLLER_CAPABILITIES: u8 = 0x05;
pub const FUNC_ID_SERIAL_API_SET_TIMEOUTS: u8 = 0x06;
pub const FUNC_ID_SERIAL_API_GET_CAPABILITIES: u8 = 0x07;
pub const FUNC_ID_SERIAL_API_SOFT_RESET: u8 = 0x08;
pub const FUNC_ID_ZW_SEND_DATA: u8 = 0x13;
pub const FUNC_ID_ZW_GET_VERSION: u8 = 0x15;
pub const FUNC_ID_ZW_R_F_POWER_LEVEL_SET: u8 = 0x17;
pub const FUNC_ID_ZW_MEMORY_GET_ID: u8 = 0x20;
pub const FUNC_ID_MEMORY_GET_BYTE: u8 = 0x21;
pub const FUNC_ID_ZW_READ_MEMORY: u8 = 0x23;
pub const FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO: u8 = 0x41;
pub const FUNC_ID_ZW_SET_DEFAULT: u8 = 0x42;
pub const FUNC_ID_ZW_REQUEST_NODE_NEIGHBOR_UPDATE: u8 = 0x48;
pub const FUNC_ID_ZW_APPLICATION_UPDATE: u8 = 0x49;
pub const FUNC_ID_ZW_ADD_NODE_TO_NETWORK: u8 = 0x4a;
pub const FUNC_ID_ZW_REMOVE_NODE_FROM_NETWORK: u8 = 0x4b;
pub const FUNC_ID_ZW_CREATE_NEW_PRIMARY: u8 = 0x4c;
pub const FUNC_ID_ZW_CONTROLLER_CHANGE: u8 = 0x4d;
pub const FUNC_ID_ZW_SET_LEARN_MODE: u8 = 0x50;
pub const FUNC_ID_ZW_ASSIGN_RETURN_ROUTE: u8 = 0x51;
pub const FUNC_ID_ZW_DELETE_RETURN_ROUTE: u8 = 0x52;
pub const FUNC_ID_ZW_REQUEST_NETWORK_UPDATE: u8 = 0x53;
pub const FUNC_ID_ZW_SET_SUC_NODE_ID: u8 = 0x54;
pub const FUNC_ID_ZW_ENABLE_SUC: u8 = 0x55;
pub const FUNC_ID_ZW_GET_SUC_NODE_ID: u8 = 0x56;
pub const FUNC_ID_ZW_REQUEST_NODE_INFO: u8 = 0x60;
pub const FUNC_ID_ZW_REMOVE_FAILED_NODE_ID: u8 = 0x61;
pub const FUNC_ID_ZW_IS_FAILED_NODE_ID: u8 = 0x62;
pub const FUNC_ID_ZW_REPLACE_FAILED_NODE: u8 = 0x63;
pub const FUNC_ID_ZW_GET_ROUTING_INFO: u8 = 0x80;
pub const FUNC_ID_SERIAL_API_SLAVE_NODE_INFO: u8 = 0xa0;
pub const FUNC_ID_APPLICATION_SLAVE_COMMAND_HANDLER: u8 = 0xa1;
pub const FUNC_ID_ZW_SEND_SLAVE_NODE_INFO: u8 = 0xa2;
pub const FUNC_ID_ZW_SET_SLAVE_LEARN_MODE: u8 = 0xa4;
pub const FUNC_ID_ZW_GET_VIRTUAL_NODES: u8 = 0xa5;
pub const FUNC_ID_ZW_IS_VIRTUAL_NODE: u8 = 0xa6;
pub const FUNC_ID_PROMISCUOUS_APPLICATION_COMMAND_HANDLER: u8 = 0xd1;

// =============================================================================
// ADD / REMOVE NODE MODES
// =============================================================================

pub const ADD_NODE_ANY: u8 = 0x01;
pub const ADD_NODE_CONTROLLER: u8 = 0x02;
pub const ADD_NODE_SLAVE: u8 = 0x03;
pub const ADD_NODE_STOP: u8 = 0x05;
pub const ADD_NODE_STOP_FAILED: u8 = 0x06;

/// High-power inclusion flag, ORed into the mode byte.
pub const OPTION_HIGH_POWER: u8 = 0x80;

pub const REMOVE_NODE_ANY: u8 = 0x01;
pub const REMOVE_NODE_STOP: u8 = 0x05;

pub const CREATE_PRIMARY_START: u8 = 0x02;
pub const CREATE_PRIMARY_STOP: u8 = 0x05;

pub const CONTROLLER_CHANGE_START: u8 = 0x02;
pub const CONTROLLER_CHANGE_STOP: u8 = 0x05;
pub const CONTROLLER_CHANGE_STOP_FAILED: u8 = 0x06;

// =============================================================================
// ADD / REMOVE NODE PROGRESS STATUS
// =============================================================================

pub const ADD_NODE_STATUS_LEARN_READY: u8 = 0x01;
pub const ADD_NODE_STATUS_NODE_FOUND: u8 = 0x02;
pub const ADD_NODE_STATUS_ADDING_SLAVE: u8 = 0x03;
pub const ADD_NODE_STATUS_ADDING_CONTROLLER: u8 = 0x04;
pub const ADD_NODE_STATUS_PROTOCOL_DONE: u8 = 0x05;
pub const ADD_NODE_STATUS_DONE: u8 = 0x06;
pub const ADD_NODE_STATUS_FAILED: u8 = 0x07;

pub const REMOVE_NODE_STATUS_LEARN_READY: u8 = 0x01;
pub const REMOVE_NODE_STATUS_NODE_FOUND: u8 = 0x02;
pub const REMOVE_NODE_STATUS_REMOVING_SLAVE: u8 = 0x03;
pub const REMOVE_NODE_STATUS_REMOVING_CONTROLLER: u8 = 0x04;
pub const REMOVE_NODE_STATUS_DONE: u8 = 0x06;
pub const REMOVE_NODE_STATUS_FAILED: u8 = 0x07;

// =============================================================================
// LEARN MODE
// =============================================================================

pub const LEARN_MODE_STARTED: u8 = 0x01;
pub const LEARN_MODE_DONE: u8 = 0x06;
pub const LEARN_MODE_FAILED: u8 = 0x07;
pub const LEARN_MODE_DELETED: u8 = 0x80;

/// Argument to `ZW_SET_LEARN_MODE` enabling classic learn mode.
pub const LEARN_MODE_ENABLE: u8 = 0xff;

// =============================================================================
// FAILED NODE HANDLING
// =============================================================================

pub const FAILED_NODE_OK: u8 = 0x00;
pub const FAILED_NODE_REMOVED: u8 = 0x01;
pub const FAILED_NODE_NOT_REMOVED: u8 = 0x02;
pub const FAILED_NODE_REPLACE_WAITING: u8 = 0x03;
pub const FAILED_NODE_REPLACE_DONE: u8 = 0x04;
pub const FAILED_NODE_REPLACE_FAILED: u8 = 0x05;

// =============================================================================
// SUC / NETWORK UPDATE
// =============================================================================

pub const SUC_UPDATE_DONE: u8 = 0x00;
pub const SUC_UPDATE_ABORT: u8 = 0x01;
pub const SUC_UPDATE_WAIT: u8 = 0x02;
pub const SUC_UPDATE_DISABLED: u8 = 0x03;
pub const SUC_UPDATE_OVERFLOW: u8 = 0x04;

/// Capability bit requested when enabling ourselves as SUC: node-id server (SIS).
pub const SUC_FUNC_NODEID_SERVER: u8 = 0x01;

// =============================================================================
// NEIGHBOR UPDATE
// =============================================================================

pub const REQUEST_NEIGHBOR_UPDATE_STARTED: u8 = 0x21;
pub const REQUEST_NEIGHBOR_UPDATE_DONE: u8 = 0x22;
pub const REQUEST_NEIGHBOR_UPDATE_FAILED: u8 = 0x23;

// =============================================================================
// APPLICATION UPDATE STATE
// =============================================================================

pub const UPDATE_STATE_SUC_ID: u8 = 0x10;
pub const UPDATE_STATE_DELETE_DONE: u8 = 0x20;
pub const UPDATE_STATE_NEW_ID_ASSIGNED: u8 = 0x40;
pub const UPDATE_STATE_ROUTING_PENDING: u8 = 0x80;
pub const UPDATE_STATE_NODE_INFO_REQ_FAILED: u8 = 0x81;
pub const UPDATE_STATE_NODE_INFO_REQ_DONE: u8 = 0x82;
pub const UPDATE_STATE_NODE_INFO_RECEIVED: u8 = 0x84;

// =============================================================================
// SLAVE (VIRTUAL NODE) HANDLING
// =============================================================================

pub const SLAVE_LEARN_MODE_DISABLE: u8 = 0x00;
pub const SLAVE_LEARN_MODE_ENABLE: u8 = 0x01;
pub const SLAVE_LEARN_MODE_ADD: u8 = 0x02;

pub const SLAVE_ASSIGN_COMPLETE: u8 = 0x00;
pub const SLAVE_ASSIGN_NODEID_DONE: u8 = 0x01;
pub const SLAVE_ASSIGN_RANGE_INFO_UPDATE: u8 = 0x02;

/// Generic device type advertised for freshly created virtual nodes
/// (window covering, which handheld controllers expect to pair with).
pub const VIRTUAL_NODE_GENERIC_TYPE: u8 = 0x09;

// =============================================================================
// TRANSMIT OPTIONS AND STATUS
// =============================================================================

pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;

pub const TRANSMIT_COMPLETE_OK: u8 = 0x00;
pub const TRANSMIT_COMPLETE_NO_ACK: u8 = 0x01;
pub const TRANSMIT_COMPLETE_FAIL: u8 = 0x02;
pub const TRANSMIT_COMPLETE_NOROUTE: u8 = 0x04;

// =============================================================================
// COMMAND CLASSES THE CORE KNOWS ABOUT
// =============================================================================

/// Basic command class (virtual-node button presses arrive as Basic Set).
pub const COMMAND_CLASS_BASIC: u8 = 0x20;

/// Wake Up command class; its handler owns each sleeping node's deferred queue.
pub const COMMAND_CLASS_WAKE_UP: u8 = 0x84;

/// Marker separating supported from controlled classes in a node info frame.
pub const COMMAND_CLASS_MARK: u8 = 0xef;

pub const BASIC_SET: u8 = 0x01;

pub const WAKE_UP_INTERVAL_GET: u8 = 0x05;
pub const WAKE_UP_INTERVAL_REPORT: u8 = 0x06;
pub const WAKE_UP_NOTIFICATION: u8 = 0x07;
pub const WAKE_UP_NO_MORE_INFORMATION: u8 = 0x08;

// =============================================================================
// CONTROLLER CAPABILITY BITS
// =============================================================================

/// We are a secondary controller.
pub const CONTROLLER_CAPS_SECONDARY: u8 = 0x01;
/// Our home id was learned from another network.
pub const CONTROLLER_CAPS_ON_OTHER_NETWORK: u8 = 0x02;
/// A SUC id server (SIS) is present in the network.
pub const CONTROLLER_CAPS_SIS: u8 = 0x04;
/// We were the original primary before a SIS took over.
pub const CONTROLLER_CAPS_REAL_PRIMARY: u8 = 0x08;
/// We are a static update controller.
pub const CONTROLLER_CAPS_SUC: u8 = 0x10;

/// Serial API init-data capability: controller api (vs. slave api).
pub const INIT_CAPS_SLAVE: u8 = 0x01;
/// Serial API init-data capability: timer functions supported.
pub const INIT_CAPS_TIMER: u8 = 0x02;
/// Serial API init-data capability: we are a secondary controller.
pub const INIT_CAPS_SECONDARY: u8 = 0x04;
/// Serial API init-data capability: SUC functions supported.
pub const INIT_CAPS_SUC: u8 = 0x08;

// =============================================================================
// BASIC DEVICE TYPES
// =============================================================================

pub const BASIC_TYPE_CONTROLLER: u8 = 0x01;
pub const BASIC_TYPE_STATIC_CONTROLLER: u8 = 0x02;

/// Library type reported by bridge controllers in the `ZW_GET_VERSION` reply.
pub const LIBRARY_TYPE_BRIDGE_CONTROLLER: u8 = 0x07;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Version stamped into `zwcfg_*.xml`; bumped whenever the on-disk format
/// changes. Files carrying a different version are refused, not migrated.
pub const CONFIG_VERSION: u32 = 1;

/// Version stamped into `zwbutton.xml`.
pub const BUTTON_CONFIG_VERSION: u32 = 1;

/// Default interval over which the whole poll list is swept, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u32 = 30;
