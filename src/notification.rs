//! Notifications surfacing network activity to the embedding application.
//!
//! The driver buffers notifications in an in-memory FIFO and flushes it at
//! the end of every event-loop iteration, outside any lock; the embedder
//! consumes them through [`Notifications`].

use tokio::sync::mpsc;

use crate::poll::ValueId;

/// A single observable state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Network the event belongs to.
    pub home_id: u32,
    /// What happened.
    pub kind: NotificationKind,
}

/// The kinds of events the driver reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// A node id was seen for the first time.
    NodeNew {
        /// The new node.
        node_id: u8,
    },
    /// A node record was created.
    NodeAdded {
        /// The added node.
        node_id: u8,
    },
    /// A node record was destroyed.
    NodeRemoved {
        /// The removed node.
        node_id: u8,
    },
    /// The controller identified itself and the driver is operational.
    DriverReady {
        /// Our own node id on the network.
        node_id: u8,
    },
    /// The driver gave up connecting to the controller.
    DriverFailed,
    /// All node records were discarded and are being rebuilt.
    DriverReset,
    /// Every known node finished its interrogation.
    AllNodesQueried,
    /// Every listening node finished its interrogation; only sleeping
    /// nodes remain outstanding.
    AwakeNodesQueried,
    /// A send transaction completed (gated by the `notify_transactions`
    /// option).
    MsgComplete,
    /// A handheld-controller button was bound to a virtual node.
    CreateButton {
        /// Node owning the button map.
        node_id: u8,
        /// Button that was bound.
        button_id: u8,
    },
    /// A button binding was removed.
    DeleteButton {
        /// Node owning the button map.
        node_id: u8,
        /// Button that was unbound.
        button_id: u8,
    },
    /// A mapped button was pressed.
    ButtonOn {
        /// Node owning the button map.
        node_id: u8,
        /// Button that was pressed.
        button_id: u8,
    },
    /// A mapped button was released.
    ButtonOff {
        /// Node owning the button map.
        node_id: u8,
        /// Button that was released.
        button_id: u8,
    },
    /// A command-class handler refreshed a value.
    Value {
        /// The refreshed value.
        value_id: ValueId,
    },
}

/// Receiving end of the driver's notification stream.
#[derive(Debug)]
pub struct Notifications {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Notifications {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self { rx }
    }

    /// Wait for the next notification. Returns `None` once the driver has
    /// shut down and the FIFO is drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take a notification without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}
