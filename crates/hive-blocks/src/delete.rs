//! Deferred message deletion, owned by the scheduler queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use hive_core::{HiveError, Result};
use hive_queue::{TaskEnvelope, TaskHandler};

use crate::registry::BotRegistry;

pub const DELETE_MESSAGE_TASK: &str = "delete-message";

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    bot_id: i64,
    chat_id: i64,
    message_id: i32,
}

pub struct DeleteMessageHandler {
    registry: Arc<BotRegistry>,
}

impl DeleteMessageHandler {
    pub fn new(registry: Arc<BotRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TaskHandler for DeleteMessageHandler {
    fn name(&self) -> &'static str {
        DELETE_MESSAGE_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: DeleteArgs = serde_json::from_value(task.args.clone())?;
        let client = self.registry.client_for(args.bot_id)?;
        match client.delete_message(args.chat_id, args.message_id).await {
            Ok(()) => {
                debug!(bot_id = args.bot_id, chat_id = args.chat_id,
                       message_id = args.message_id, "auto-delete done");
                Ok(())
            }
            // The user may have deleted it first; that is fine.
            Err(HiveError::PermanentExternal { reason, .. })
                if reason.to_lowercase().contains("message to delete not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
