use async_trait::async_trait;

use crate::error::Result;
use crate::function_loop::ToolCallRecord;
use crate::llm::ModelCompletion;
use crate::message::ConversationMessage;

/// Observer for a function-call loop run. Returning an error aborts the run.
#[async_trait]
pub trait LoopHook: Send + Sync {
    async fn before_model(&self, _iteration: usize, _messages: &[ConversationMessage]) -> Result<()> {
        Ok(())
    }

    /// Called once for every model completion, including the final one.
    async fn after_model(&self, _iteration: usize, _completion: &ModelCompletion) -> Result<()> {
        Ok(())
    }

    async fn after_tool_batch(&self, _iteration: usize, _records: &[ToolCallRecord]) -> Result<()> {
        Ok(())
    }
}
