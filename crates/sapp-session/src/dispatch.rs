//! Routing of hardware actions to the robot

use sapp_protocol::HardwareAction;
use serde::Serialize;
use std::sync::Arc;

/// Motion primitives of the host robot.
///
/// Calls are fire-and-forget; implementations must not block the caller for
/// the duration of the motion.
pub trait RobotControl: Send + Sync {
    /// Start moving toward the operator
    fn follow_operator(&self);

    /// Halt any ongoing movement
    fn stop_movement(&self);
}

/// Actions this client knows how to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotCommand {
    FollowMe,
    StopMoving,
}

impl RobotCommand {
    /// Look up the command for an action name from the backend
    pub fn from_action(name: &str) -> Option<Self> {
        match name {
            "follow_me" => Some(RobotCommand::FollowMe),
            "stop_moving" => Some(RobotCommand::StopMoving),
            _ => None,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            RobotCommand::FollowMe => "follow_me",
            RobotCommand::StopMoving => "stop_moving",
        }
    }
}

/// Maps [`HardwareAction`]s onto [`RobotControl`] calls
#[derive(Clone)]
pub struct ActionDispatcher {
    robot: Arc<dyn RobotControl>,
}

impl ActionDispatcher {
    pub fn new(robot: Arc<dyn RobotControl>) -> Self {
        Self { robot }
    }

    /// Perform the action, returning the command that ran.
    ///
    /// Unknown action names are ignored so newer backends can introduce
    /// actions this client does not support.
    pub fn dispatch(&self, action: &HardwareAction) -> Option<RobotCommand> {
        let Some(command) = RobotCommand::from_action(&action.action) else {
            tracing::debug!("Ignoring unsupported action '{}'", action.action);
            return None;
        };

        tracing::info!("Dispatching robot command {:?}", command);
        match command {
            RobotCommand::FollowMe => self.robot.follow_operator(),
            RobotCommand::StopMoving => self.robot.stop_movement(),
        }
        Some(command)
    }
}
