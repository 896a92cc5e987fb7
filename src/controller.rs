//! Network-management commands and their progress reporting.
//!
//! At most one controller command is active at a time. Progress is
//! surfaced through a caller-supplied callback as [`ControllerState`]
//! transitions while the driver task walks the command through its wire
//! protocol.

use std::sync::Arc;

/// The network-management operations the controller can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// No command active.
    None,
    /// Include another controller into the network.
    AddController,
    /// Include a device into the network.
    AddDevice,
    /// Create a new primary controller (after the original was lost).
    CreateNewPrimary,
    /// Receive network configuration from another controller (learn mode).
    ReceiveConfiguration,
    /// Exclude a controller from the network.
    RemoveController,
    /// Exclude a device from the network.
    RemoveDevice,
    /// Ask whether a node is on the failed-node list.
    HasNodeFailed,
    /// Move a dead node to the failed-node list and delete it.
    RemoveFailedNode,
    /// Replace a dead node with a new device under the same id.
    ReplaceFailedNode,
    /// Hand the primary role to another controller.
    TransferPrimaryRole,
    /// Request a network topology update from the SUC.
    RequestNetworkUpdate,
    /// Ask a node to rediscover its neighbors.
    RequestNodeNeighborUpdate,
    /// Assign a return route from a node to the controller.
    AssignReturnRoute,
    /// Delete all return routes from a node.
    DeleteAllReturnRoutes,
    /// Bind a handheld-controller button to a virtual node (bridge only).
    CreateButton,
    /// Remove a handheld-controller button binding (bridge only).
    DeleteButton,
}

impl ControllerCommand {
    /// Whether [`cancel`](crate::driver::Driver::cancel_controller_command)
    /// can abort the command once started.
    pub fn is_cancellable(self) -> bool {
        !matches!(
            self,
            ControllerCommand::None
                | ControllerCommand::HasNodeFailed
                | ControllerCommand::RemoveFailedNode
                | ControllerCommand::ReplaceFailedNode
        )
    }

    /// Name for the log.
    pub fn name(self) -> &'static str {
        match self {
            ControllerCommand::None => "None",
            ControllerCommand::AddController => "AddController",
            ControllerCommand::AddDevice => "AddDevice",
            ControllerCommand::CreateNewPrimary => "CreateNewPrimary",
            ControllerCommand::ReceiveConfiguration => "ReceiveConfiguration",
            ControllerCommand::RemoveController => "RemoveController",
            ControllerCommand::RemoveDevice => "RemoveDevice",
            ControllerCommand::HasNodeFailed => "HasNodeFailed",
            ControllerCommand::RemoveFailedNode => "RemoveFailedNode",
            ControllerCommand::ReplaceFailedNode => "ReplaceFailedNode",
            ControllerCommand::TransferPrimaryRole => "TransferPrimaryRole",
            ControllerCommand::RequestNetworkUpdate => "RequestNetworkUpdate",
            ControllerCommand::RequestNodeNeighborUpdate => "RequestNodeNeighborUpdate",
            ControllerCommand::AssignReturnRoute => "AssignReturnRoute",
            ControllerCommand::DeleteAllReturnRoutes => "DeleteAllReturnRoutes",
            ControllerCommand::CreateButton => "CreateButton",
            ControllerCommand::DeleteButton => "DeleteButton",
        }
    }
}

/// Progress of the active controller command, as reported to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No command in progress.
    Normal,
    /// The controller is waiting for a user action (e.g. a button press on
    /// the device being included).
    Waiting,
    /// The command is running.
    InProgress,
    /// The command finished successfully.
    Completed,
    /// The command failed.
    Failed,
    /// `HasNodeFailed` verdict: the node is responding.
    NodeOk,
    /// `HasNodeFailed` verdict: the node is on the failed list.
    NodeFailed,
}

/// Progress callback invoked from the driver task.
pub type ControllerCallback = Arc<dyn Fn(ControllerState) + Send + Sync>;

/// The single active command and its working state.
pub(crate) struct ActiveCommand {
    pub command: ControllerCommand,
    /// Node the command targets or discovered.
    pub node_id: u8,
    /// Auxiliary argument (button id for the button commands).
    pub arg: u8,
    /// Whether the device being added announced itself as a controller.
    pub controller_added: bool,
    pub callback: Option<ControllerCallback>,
}

impl ActiveCommand {
    pub fn idle() -> Self {
        Self {
            command: ControllerCommand::None,
            node_id: 0,
            arg: 0,
            controller_added: false,
            callback: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.command != ControllerCommand::None
    }

    /// Forget the active command but keep the callback slot clean.
    pub fn clear(&mut self) {
        *self = Self::idle();
    }
}

impl std::fmt::Debug for ActiveCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCommand")
            .field("command", &self.command)
            .field("node_id", &self.node_id)
            .field("arg", &self.arg)
            .field("controller_added", &self.controller_added)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_rules() {
        assert!(ControllerCommand::AddDevice.is_cancellable());
        assert!(ControllerCommand::RemoveController.is_cancellable());
        assert!(ControllerCommand::CreateButton.is_cancellable());
        assert!(ControllerCommand::ReceiveConfiguration.is_cancellable());

        assert!(!ControllerCommand::HasNodeFailed.is_cancellable());
        assert!(!ControllerCommand::RemoveFailedNode.is_cancellable());
        assert!(!ControllerCommand::ReplaceFailedNode.is_cancellable());
        assert!(!ControllerCommand::None.is_cancellable());
    }

    #[test]
    fn test_active_command_lifecycle() {
        let mut active = ActiveCommand::idle();
        assert!(!active.is_active());

        active.command = ControllerCommand::AddDevice;
        active.callback = Some(Arc::new(|_| {}));
        assert!(active.is_active());

        active.clear();
        assert!(!active.is_active());
        assert!(active.callback.is_none());
    }
}
