use async_trait::async_trait;
use tracing::{info, warn};

use thermolink_common::{commands::STATUS_INTERNAL_ERROR, CommandReply, RemoteCommand};

use crate::{control::ControlHandle, uplink::transport::CommandHandler};

/// Routes named remote procedures to the shared configuration accessor.
#[derive(Clone)]
pub struct CommandDispatcher {
    handle: ControlHandle,
}

impl CommandDispatcher {
    pub fn new(handle: ControlHandle) -> Self {
        Self { handle }
    }

    pub async fn dispatch(&self, command: &RemoteCommand) -> CommandReply {
        let outcome = match self.handle.execute(command).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(command = command.name(), "command rejected: {err}");
                return CommandReply::from_error(&err);
            }
        };

        if command.is_mutating() {
            info!(command = command.name(), "command applied");
        }

        let payload = if command.replies_with_program() {
            serde_json::to_value(&outcome.program)
        } else {
            serde_json::to_value(&outcome.telemetry)
        };
        match payload {
            Ok(payload) => CommandReply::ok(payload),
            Err(err) => {
                warn!(command = command.name(), "reply serialization failed: {err}");
                CommandReply::error(STATUS_INTERNAL_ERROR, "reply serialization failed")
            }
        }
    }
}

#[async_trait]
impl CommandHandler for CommandDispatcher {
    async fn handle(&self, name: &str, payload: &[u8]) -> CommandReply {
        match RemoteCommand::parse(name, payload) {
            Ok(command) => self.dispatch(&command).await,
            Err(err) => {
                warn!(command = name, "command rejected: {err}");
                CommandReply::from_error(&err)
            }
        }
    }
}
