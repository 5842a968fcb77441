//! Robot stand-in that only reports motion requests

use sapp_session::RobotControl;

/// Logs motion requests instead of moving anything
#[derive(Debug, Default)]
pub struct LoggingRobot;

impl RobotControl for LoggingRobot {
    fn follow_operator(&self) {
        tracing::info!("Robot: following operator");
    }

    fn stop_movement(&self) {
        tracing::info!("Robot: stopping");
    }
}
