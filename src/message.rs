//! Outbound frame descriptors.
//!
//! A [`Message`] records everything the transaction engine needs to drive a
//! request to completion: the wire bytes, the callback id correlating
//! asynchronous progress frames, the expected terminal reply, and the
//! attempt counter bounding retransmissions.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::core::constants::{
    COMMAND_CLASS_WAKE_UP, FUNC_ID_ZW_SEND_DATA, REQUEST, TRANSMIT_OPTION_ACK,
    TRANSMIT_OPTION_AUTO_ROUTE, WAKE_UP_NO_MORE_INFORMATION,
};
use crate::frame;

/// An outbound Serial API request.
#[derive(Debug, Clone)]
pub struct Message {
    label: String,
    target_node_id: u8,
    function_id: u8,
    payload: Vec<u8>,
    callback_required: bool,
    callback_id: u8,
    expected_reply: u8,
    expected_command_class_id: u8,
    send_attempts: u8,
    wake_up_no_more_information: bool,
    buffer: Vec<u8>,
}

impl Message {
    /// Create a request frame. By default the transaction is held open until
    /// a reply carrying the same function id arrives.
    pub fn request(label: impl Into<String>, target_node_id: u8, function_id: u8) -> Self {
        Self {
            label: label.into(),
            target_node_id,
            function_id,
            payload: Vec::new(),
            callback_required: false,
            callback_id: 0,
            expected_reply: function_id,
            expected_command_class_id: 0,
            send_attempts: 0,
            wake_up_no_more_information: false,
            buffer: Vec::new(),
        }
    }

    /// Build a `ZW_SEND_DATA` request carrying a command-class payload.
    pub fn send_data(label: impl Into<String>, target_node_id: u8, data: &[u8]) -> Self {
        let mut msg = Self::request(label, target_node_id, FUNC_ID_ZW_SEND_DATA).with_callback();
        msg.push(target_node_id);
        msg.push(data.len() as u8);
        msg.extend(data);
        msg.push(TRANSMIT_OPTION_ACK | TRANSMIT_OPTION_AUTO_ROUTE);
        msg
    }

    /// Build the "Wake-Up No More Information" command that lets a battery
    /// node go back to sleep once its deferred queue has drained.
    pub(crate) fn wake_up_no_more_information(target_node_id: u8) -> Self {
        let mut msg = Self::send_data(
            "Wake-up No More Information",
            target_node_id,
            &[COMMAND_CLASS_WAKE_UP, WAKE_UP_NO_MORE_INFORMATION],
        );
        msg.wake_up_no_more_information = true;
        msg
    }

    /// Request a callback id; the controller echoes it in asynchronous
    /// progress frames for this request.
    pub fn with_callback(mut self) -> Self {
        self.callback_required = true;
        self
    }

    /// Complete the transaction on ACK alone; no reply frame is expected.
    pub fn no_reply(mut self) -> Self {
        self.expected_reply = 0;
        self
    }

    /// Override the function id whose arrival completes the transaction.
    pub fn expect_reply(mut self, function_id: u8) -> Self {
        self.expected_reply = function_id;
        self
    }

    /// For replies arriving inside an Application Command Handler frame,
    /// additionally require this command class (and the target node) to match.
    pub fn expect_command_class(mut self, class_id: u8) -> Self {
        self.expected_command_class_id = class_id;
        self
    }

    /// Append one payload byte.
    pub fn push(&mut self, byte: u8) {
        self.payload.push(byte);
    }

    /// Append payload bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    pub(crate) fn callback_required(&self) -> bool {
        self.callback_required
    }

    /// Fix the wire representation. Called once, when the message is queued;
    /// `callback_id` is consumed only if a callback was requested.
    pub(crate) fn finalize(&mut self, callback_id: u8) {
        if !self.buffer.is_empty() {
            return;
        }
        if self.callback_required {
            self.callback_id = callback_id;
            self.payload.push(callback_id);
        }
        self.buffer = frame::encode(REQUEST, self.function_id, &self.payload);
    }

    /// Wire bytes; empty until [`finalize`](Message::finalize) has run.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Node this request is aimed at (0xff for the controller itself).
    pub fn target_node_id(&self) -> u8 {
        self.target_node_id
    }

    /// Serial API function id.
    pub fn function_id(&self) -> u8 {
        self.function_id
    }

    /// Callback id allocated at finalisation, or 0.
    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    /// Function id whose arrival completes the transaction, or 0.
    pub fn expected_reply(&self) -> u8 {
        self.expected_reply
    }

    /// Command class required inside an Application Command Handler reply, or 0.
    pub fn expected_command_class_id(&self) -> u8 {
        self.expected_command_class_id
    }

    /// Transmissions performed so far.
    pub fn send_attempts(&self) -> u8 {
        self.send_attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.send_attempts += 1;
    }

    /// Whether this is the command releasing a wake-up node back to sleep.
    pub fn is_wake_up_no_more_information(&self) -> bool {
        self.wake_up_no_more_information
    }

    /// Human-readable description for the log.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Allocator for the 1-byte callback nonces. Zero is reserved for "no
/// callback", so the counter wraps 1..=255.
#[derive(Debug)]
pub(crate) struct CallbackIds(AtomicU8);

impl CallbackIds {
    pub fn new() -> Self {
        Self(AtomicU8::new(1))
    }

    pub fn next(&self) -> u8 {
        let id = self.0.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.0.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{FUNC_ID_ZW_ADD_NODE_TO_NETWORK, SOF};

    #[test]
    fn test_request_defaults() {
        let msg = Message::request("Get Version", 0xff, 0x15);
        assert_eq!(msg.target_node_id(), 0xff);
        assert_eq!(msg.function_id(), 0x15);
        assert_eq!(msg.expected_reply(), 0x15);
        assert_eq!(msg.callback_id(), 0);
        assert_eq!(msg.send_attempts(), 0);
        assert!(msg.buffer().is_empty());
    }

    #[test]
    fn test_finalize_without_callback() {
        let mut msg = Message::request("Get Version", 0xff, 0x15);
        msg.finalize(0x42);

        // No callback requested, so the nonce must not leak into the frame.
        assert_eq!(msg.callback_id(), 0);
        assert_eq!(msg.buffer(), &[0x01, 0x03, 0x00, 0x15, 0xe9]);
    }

    #[test]
    fn test_finalize_appends_callback_and_checksum() {
        let mut msg =
            Message::request("AddDevice", 0xff, FUNC_ID_ZW_ADD_NODE_TO_NETWORK).with_callback();
        msg.push(0x03);
        msg.finalize(0x17);

        let buf = msg.buffer();
        assert_eq!(msg.callback_id(), 0x17);
        assert_eq!(buf[0], SOF);
        assert_eq!(buf[1] as usize, buf.len() - 2);
        assert_eq!(buf[3], FUNC_ID_ZW_ADD_NODE_TO_NETWORK);
        assert_eq!(buf[4], 0x03);
        assert_eq!(buf[5], 0x17);
        assert_eq!(
            *buf.last().unwrap(),
            frame::checksum(&buf[1..buf.len() - 1])
        );
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut msg = Message::request("Get Version", 0xff, 0x15);
        msg.finalize(1);
        let first = msg.buffer().to_vec();
        msg.finalize(2);
        assert_eq!(msg.buffer(), &first[..]);
    }

    #[test]
    fn test_send_data_layout() {
        let mut msg = Message::send_data("Basic Get", 0x07, &[0x20, 0x02]);
        msg = msg.expect_reply(0x04).expect_command_class(0x20);
        msg.finalize(0x2a);

        let buf = msg.buffer();
        // SOF len type func node datalen cc cmd txopts callback chk
        assert_eq!(buf[3], FUNC_ID_ZW_SEND_DATA);
        assert_eq!(buf[4], 0x07);
        assert_eq!(buf[5], 2);
        assert_eq!(&buf[6..8], &[0x20, 0x02]);
        assert_eq!(buf[8], TRANSMIT_OPTION_ACK | TRANSMIT_OPTION_AUTO_ROUTE);
        assert_eq!(buf[9], 0x2a);
        assert_eq!(msg.expected_reply(), 0x04);
        assert_eq!(msg.expected_command_class_id(), 0x20);
    }

    #[test]
    fn test_wake_up_no_more_information_flag() {
        let msg = Message::wake_up_no_more_information(0x09);
        assert!(msg.is_wake_up_no_more_information());
        assert_eq!(msg.target_node_id(), 0x09);
    }

    #[test]
    fn test_callback_ids_skip_zero() {
        let ids = CallbackIds::new();
        let mut seen = ids.next();
        assert_eq!(seen, 1);
        // Exhaust the range: the counter must wrap without ever handing out 0.
        for _ in 0..300 {
            seen = ids.next();
            assert_ne!(seen, 0);
        }
    }
}
