//! The driver task: connection management, the event loop and the
//! transaction engine.
//!
//! All transport writes happen here. The loop multiplexes over the
//! shutdown signal, inbound bytes, queue readiness and the retry timer;
//! while a transaction is in flight only shutdown, inbound data and the
//! retry timer are honoured, so queued work never overtakes an open
//! transaction.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::constants::*;
use crate::core::error::FrameError;
use crate::frame::{FrameReader, Token};
use crate::message::Message;
use crate::node::query::QueryStage;
use crate::notification::NotificationKind;
use crate::queue::{QueueItem, SendQueue};
use crate::transport::Transport;

use super::DriverInner;

/// Outcome of one serial session.
enum SessionEnd {
    /// Shutdown was requested; the task must exit.
    Shutdown,
    /// The transport failed; reconnect with backoff.
    ConnectionLost,
}

/// The in-flight transaction. Only the driver task touches this.
pub(crate) struct Transaction {
    pub current: Option<Message>,
    pub waiting_for_ack: bool,
    pub expected_callback_id: u8,
    pub expected_reply: u8,
    pub expected_command_class_id: u8,
    pub expected_node_id: u8,
    pub retry_at: Instant,
}

impl Transaction {
    fn new() -> Self {
        Self {
            current: None,
            waiting_for_ack: false,
            expected_callback_id: 0,
            expected_reply: 0,
            expected_command_class_id: 0,
            expected_node_id: 0,
            retry_at: Instant::now(),
        }
    }

    /// Whether a transaction is open: an ACK, callback or reply is still
    /// outstanding.
    pub fn in_flight(&self) -> bool {
        self.waiting_for_ack || self.expected_callback_id != 0 || self.expected_reply != 0
    }

    /// Drop the current message and every expectation, together.
    pub fn clear(&mut self) {
        self.current = None;
        self.expected_callback_id = 0;
        self.expected_reply = 0;
        self.expected_command_class_id = 0;
        self.expected_node_id = 0;
        self.waiting_for_ack = false;
    }
}

/// Entry point of the driver task.
pub(crate) async fn run<T: Transport>(
    inner: Arc<DriverInner>,
    mut transport: T,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match transport.open() {
            Ok(stream) => {
                info!("opened controller {}", transport.describe());
                attempts = 0;

                let (read_half, write_half) = tokio::io::split(stream);
                let mut session = Session {
                    inner: inner.clone(),
                    reader: FrameReader::new(read_half),
                    writer: write_half,
                    txn: Transaction::new(),
                    shutdown: shutdown.clone(),
                };
                match session.run().await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::ConnectionLost => {}
                }
            }
            Err(err) => {
                warn!(
                    "failed to open controller {} (attempt {}): {err}",
                    transport.describe(),
                    attempts + 1
                );
            }
        }

        attempts += 1;
        let max_attempts = inner.options.driver_max_attempts;
        if max_attempts != 0 && attempts >= max_attempts {
            error!("giving up on the controller after {attempts} attempts");
            inner.queue_notification(NotificationKind::DriverFailed);
            inner.flush_notifications();
            return;
        }

        let backoff = if attempts < RECONNECT_FAST_ATTEMPTS {
            RECONNECT_FAST_BACKOFF
        } else {
            RECONNECT_SLOW_BACKOFF
        };
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One connection's worth of driver state.
pub(crate) struct Session<S> {
    pub(crate) inner: Arc<DriverInner>,
    pub(crate) reader: FrameReader<ReadHalf<S>>,
    pub(crate) writer: WriteHalf<S>,
    pub(crate) txn: Transaction,
    shutdown: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    async fn run(&mut self) -> SessionEnd {
        match self.run_inner().await {
            Ok(end) => end,
            Err(err) => {
                warn!("controller connection lost: {err}");
                SessionEnd::ConnectionLost
            }
        }
    }

    async fn run_inner(&mut self) -> io::Result<SessionEnd> {
        // A NAK flushes any partial frame the controller may be holding
        // from before we attached.
        self.writer.write_all(&[NAK]).await?;
        self.play_init_sequence();

        loop {
            self.inner.flush_notifications();

            if *self.shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }

            if !self.txn.in_flight() {
                let next = self.inner.queues.lock().unwrap().pop_next();
                if let Some((queue, item)) = next {
                    self.process_queue_item(queue, item).await?;
                    continue;
                }
            }

            tokio::select! {
                _ = self.shutdown.changed() => {
                    return Ok(SessionEnd::Shutdown);
                }
                token = self.reader.next_token() => {
                    self.handle_token(token?).await?;
                }
                _ = tokio::time::sleep_until(self.txn.retry_at), if self.txn.in_flight() => {
                    debug!("transaction timed out, resending");
                    self.write_current_msg().await?;
                }
                _ = self.inner.queue_ready.notified(), if !self.txn.in_flight() => {
                    // Loop around and pop at the top.
                }
            }
        }
    }

    /// Queue the controller identification handshake.
    fn play_init_sequence(&self) {
        let inner = &self.inner;
        inner.send_msg(
            Message::request("Get Version", CONTROLLER_NODE_ID, FUNC_ID_ZW_GET_VERSION),
            SendQueue::Command,
        );
        inner.send_msg(
            Message::request("Get Memory Id", CONTROLLER_NODE_ID, FUNC_ID_ZW_MEMORY_GET_ID),
            SendQueue::Command,
        );
        inner.send_msg(
            Message::request(
                "Get Controller Capabilities",
                CONTROLLER_NODE_ID,
                FUNC_ID_ZW_GET_CONTROLLER_CAPABILITIES,
            ),
            SendQueue::Command,
        );
        inner.send_msg(
            Message::request(
                "Get Serial API Capabilities",
                CONTROLLER_NODE_ID,
                FUNC_ID_SERIAL_API_GET_CAPABILITIES,
            ),
            SendQueue::Command,
        );
        inner.send_msg(
            Message::request(
                "Get SUC Node Id",
                CONTROLLER_NODE_ID,
                FUNC_ID_ZW_GET_SUC_NODE_ID,
            ),
            SendQueue::Command,
        );
    }

    async fn process_queue_item(&mut self, queue: SendQueue, item: QueueItem) -> io::Result<()> {
        match item {
            QueueItem::Send(msg) => {
                // The target may have fallen asleep while the item was
                // queued; divert rather than burn retries against it.
                if let Some(msg) = self.park_send_if_sleeping(msg) {
                    self.txn.current = Some(msg);
                    self.write_current_msg().await?;
                }
            }
            QueueItem::QueryStageComplete { node_id, stage } => {
                debug!(
                    "node {:03}: query stage complete ({}) via {:?} queue",
                    node_id,
                    stage.name(),
                    queue
                );
                {
                    let mut nodes = self.inner.nodes.write().unwrap();
                    match nodes.get_mut(node_id) {
                        Some(node) => node.query_stage_complete(stage),
                        None => return Ok(()),
                    }
                }
                self.inner.advance_node_queries(node_id);
            }
        }
        Ok(())
    }

    /// Divert a popped message to its target's wake-up queue if the target
    /// sleeps. Returns the message when it should be transmitted.
    fn park_send_if_sleeping(&self, msg: Message) -> Option<Message> {
        let mut nodes = self.inner.nodes.write().unwrap();
        let Some(node) = nodes.get_mut(msg.target_node_id()) else {
            // Controller-directed or unknown target: transmit as-is.
            return Some(msg);
        };

        if !node.should_defer_messages() {
            return Some(msg);
        }
        if msg.is_wake_up_no_more_information() {
            debug!(
                "node {:03}: discarding no-more-information for sleeping node",
                msg.target_node_id()
            );
            return None;
        }
        debug!(
            "node {:03}: target asleep, moving message to wake-up queue: {}",
            msg.target_node_id(),
            msg.label()
        );
        node.wake_up_mut()
            .expect("deferring node always has wake-up state")
            .queue_item(QueueItem::Send(msg));
        None
    }

    /// Transmit (or retransmit) the current message, arming the retry
    /// timer. Returns `false` when the message was dropped instead because
    /// its retries were exhausted.
    pub(crate) async fn write_current_msg(&mut self) -> io::Result<bool> {
        enum Action {
            Drop { target: u8, attempts: u8 },
            Write {
                buffer: Vec<u8>,
                target: u8,
                callback_id: u8,
                reply: u8,
                class_id: u8,
                attempts: u8,
                label: String,
            },
        }

        let action = match self.txn.current.as_mut() {
            None => {
                warn!("no current message to transmit");
                return Ok(false);
            }
            Some(msg) => {
                if msg.send_attempts() >= MAX_TRIES {
                    Action::Drop {
                        target: msg.target_node_id(),
                        attempts: msg.send_attempts(),
                    }
                } else {
                    msg.record_attempt();
                    Action::Write {
                        buffer: msg.buffer().to_vec(),
                        target: msg.target_node_id(),
                        callback_id: msg.callback_id(),
                        reply: msg.expected_reply(),
                        class_id: msg.expected_command_class_id(),
                        attempts: msg.send_attempts(),
                        label: msg.label().to_string(),
                    }
                }
            }
        };

        match action {
            Action::Drop { target, attempts } => {
                error!(
                    "node {target:03}: ERROR: dropping command, expected response not received after {attempts} attempt(s)"
                );
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.txn.clear();
                Ok(false)
            }
            Action::Write {
                buffer,
                target,
                callback_id,
                reply,
                class_id,
                attempts,
                label,
            } => {
                self.txn.expected_callback_id = callback_id;
                self.txn.expected_reply = reply;
                self.txn.expected_command_class_id = class_id;
                self.txn.expected_node_id = target;
                self.txn.waiting_for_ack = true;
                self.txn.retry_at = Instant::now() + RETRY_TIMEOUT;

                info!(
                    "node {target:03}: sending (attempt {attempts}, callback id 0x{callback_id:02x}, expected reply 0x{reply:02x}) - {label}"
                );
                self.writer.write_all(&buffer).await?;

                let stats = &self.inner.stats;
                stats.writes.fetch_add(1, Ordering::Relaxed);
                if attempts > 1 {
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                }
                if target == CONTROLLER_NODE_ID {
                    stats.controller_writes.fetch_add(1, Ordering::Relaxed);
                } else if let Some(node) =
                    self.inner.nodes.write().unwrap().get_mut(target)
                {
                    node.record_write();
                }
                Ok(true)
            }
        }
    }

    /// Finish the transaction: the expected completions all arrived.
    pub(crate) fn complete_transaction(&mut self) {
        debug!("message transaction complete");
        self.txn.clear();
        if self.inner.options.notify_transactions {
            self.inner.queue_notification(NotificationKind::MsgComplete);
        }
    }

    async fn handle_token(&mut self, token: Token) -> io::Result<()> {
        let stats = &self.inner.stats;
        match token {
            Token::Sof => {
                stats.sof_count.fetch_add(1, Ordering::Relaxed);
                if self.txn.waiting_for_ack {
                    warn!("unsolicited message received while waiting for ACK");
                    stats.ack_waiting.fetch_add(1, Ordering::Relaxed);
                }

                match self.reader.read_frame().await {
                    Ok(data) => {
                        self.writer.write_all(&[ACK]).await?;
                        stats.reads.fetch_add(1, Ordering::Relaxed);
                        if data.first() == Some(&RESPONSE) {
                            stats.controller_reads.fetch_add(1, Ordering::Relaxed);
                        }
                        self.process_msg(&data);
                    }
                    Err(FrameError::ChecksumMismatch { computed, received }) => {
                        warn!(
                            "checksum incorrect (computed 0x{computed:02x}, received 0x{received:02x}) - sending NAK"
                        );
                        stats.bad_checksums.fetch_add(1, Ordering::Relaxed);
                        self.writer.write_all(&[NAK]).await?;
                    }
                    Err(FrameError::LengthTimeout) => {
                        warn!("100ms passed without finding the length byte - aborting frame read");
                        stats.read_aborts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(FrameError::BodyTimeout { expected }) => {
                        warn!(
                            "500ms passed without reading the remaining {expected} frame bytes - aborting frame read"
                        );
                        stats.read_aborts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(FrameError::InvalidLength(length)) => {
                        warn!("impossible frame length {length} - sending NAK");
                        stats.read_aborts.fetch_add(1, Ordering::Relaxed);
                        self.writer.write_all(&[NAK]).await?;
                    }
                    Err(FrameError::Io(err)) => return Err(err),
                }
            }
            Token::Can => {
                warn!("CAN received - triggering resend");
                stats.can_count.fetch_add(1, Ordering::Relaxed);
                self.write_current_msg().await?;
            }
            Token::Nak => {
                warn!("NAK received - triggering resend");
                stats.nak_count.fetch_add(1, Ordering::Relaxed);
                self.write_current_msg().await?;
            }
            Token::Ack => {
                stats.ack_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "ACK received (callback id 0x{:02x}, reply 0x{:02x})",
                    self.txn.expected_callback_id, self.txn.expected_reply
                );
                self.txn.waiting_for_ack = false;
                if self.txn.expected_callback_id == 0 && self.txn.expected_reply == 0 {
                    // Nothing else outstanding: the transaction is done.
                    if self.txn.current.is_some() {
                        debug!("transaction complete on ACK");
                    }
                    self.txn.clear();
                }
            }
            Token::OutOfFrame(byte) => {
                warn!("out of frame flow (0x{byte:02x}) - sending NAK");
                stats.oof_count.fetch_add(1, Ordering::Relaxed);
                self.writer.write_all(&[NAK]).await?;
            }
        }
        Ok(())
    }

    /// Mark a node asleep and migrate everything addressed to it - the
    /// in-flight message and matching items on every queue - onto its
    /// wake-up queue. Returns `false` if the node is not a sleeping-capable
    /// target.
    pub(crate) fn move_messages_to_wake_up_queue(&mut self, target_node_id: u8) -> bool {
        {
            let mut nodes = self.inner.nodes.write().unwrap();
            let Some(node) = nodes.get_mut(target_node_id) else {
                return false;
            };
            if node.is_listening() || node.is_frequent_listening() || node.is_controller() {
                return false;
            }
            let Some(wake_up) = node.wake_up_mut() else {
                return false;
            };
            wake_up.set_awake(false);
        }

        // The in-flight message first.
        if self
            .txn
            .current
            .as_ref()
            .is_some_and(|msg| msg.target_node_id() == target_node_id)
        {
            let msg = self.txn.current.take().expect("checked above");
            if msg.is_wake_up_no_more_information() {
                debug!(
                    "node {target_node_id:03}: dropping in-flight no-more-information command"
                );
            } else {
                info!(
                    "node {target_node_id:03}: node not responding - moving message to wake-up queue: {}",
                    msg.label()
                );
                let mut nodes = self.inner.nodes.write().unwrap();
                if let Some(wake_up) = nodes
                    .get_mut(target_node_id)
                    .and_then(|node| node.wake_up_mut())
                {
                    wake_up.queue_item(QueueItem::Send(msg));
                }
            }
            self.txn.clear();
        }

        // Then every queued item for the node.
        let taken = self
            .inner
            .queues
            .lock()
            .unwrap()
            .take_for_node(target_node_id);
        if !taken.is_empty() {
            let mut nodes = self.inner.nodes.write().unwrap();
            if let Some(wake_up) = nodes
                .get_mut(target_node_id)
                .and_then(|node| node.wake_up_mut())
            {
                for item in taken {
                    let discard = matches!(
                        &item,
                        QueueItem::Send(msg) if msg.is_wake_up_no_more_information()
                    );
                    if discard {
                        debug!(
                            "node {target_node_id:03}: dropping queued no-more-information command"
                        );
                    } else {
                        info!(
                            "node {target_node_id:03}: node not responding - moving queued item to wake-up queue"
                        );
                        wake_up.queue_item(item);
                    }
                }
            }
        }

        true
    }

    /// A wake-up notification arrived: release the node's deferred work
    /// onto the WakeUp queue and let it go back to sleep afterwards.
    pub(crate) fn process_wake_up_notification(&mut self, node_id: u8) {
        info!("node {node_id:03}: received wake-up notification");

        let (pending, poll_required) = {
            let mut nodes = self.inner.nodes.write().unwrap();
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            match node.wake_up_mut() {
                Some(wake_up) => {
                    wake_up.set_awake(true);
                    (wake_up.take_pending(), wake_up.take_poll_required())
                }
                None => return,
            }
        };

        if !pending.is_empty() {
            info!(
                "node {node_id:03}: moving {} deferred item(s) to the wake-up send queue",
                pending.len()
            );
            let mut queues = self.inner.queues.lock().unwrap();
            for item in pending {
                queues.push(SendQueue::WakeUp, item);
            }
            drop(queues);
            self.inner.queue_ready.notify_one();
        }

        if poll_required {
            self.poll_node_values(node_id);
        }

        // Let the node drop back to sleep once the queue drains.
        self.inner.send_msg(
            Message::wake_up_no_more_information(node_id),
            SendQueue::WakeUp,
        );
    }

    /// Queue refreshes of every polled value on one node (used when a node
    /// that missed polls wakes up).
    fn poll_node_values(&self, node_id: u8) {
        // A full rotation visits every entry exactly once.
        let poll_values: Vec<_> = {
            let mut poll_list = self.inner.poll_list.lock().unwrap();
            let mut values = Vec::new();
            for _ in 0..poll_list.len() {
                if let Some(value_id) = poll_list.rotate() {
                    if value_id.node_id == node_id {
                        values.push(value_id);
                    }
                }
            }
            values
        };

        let mut contexts = Vec::new();
        {
            let mut nodes = self.inner.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(node_id) {
                for value_id in poll_values {
                    contexts.push(node.request_value(value_id));
                }
            }
        }
        for ctx in contexts {
            self.inner.apply_class_context(ctx);
        }
    }

    /// React to a query-stage failure reported by the controller.
    pub(crate) fn handle_node_query_failure(&mut self, node_id: u8) -> bool {
        {
            let mut nodes = self.inner.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(node_id) {
                node.query_stage_retry(QueryStage::NodeInfo, MAX_TRIES);
            }
        }

        // The failure may simply mean the node fell asleep; park its
        // traffic if so.
        self.move_messages_to_wake_up_queue(node_id)
    }
}
