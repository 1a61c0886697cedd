//! The model/tool exchange.
//!
//! One run alternates between asking the model for its next move and
//! executing the tool-call batch it requested:
//!
//! ```text
//! AwaitingModel --calls--> ExecutingTools --results--> AwaitingModel
//!       |                                                   |
//!       +--text--> Terminated(Success)    budget spent --> Terminated(Exhausted)
//!       +--neither--> Terminated(Malformed)
//! ```
//!
//! Each batch runs concurrently and is appended to the history as exactly
//! two messages: the model turn holding every call, then one user turn
//! holding every result in request order.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{PipelineError, Result};
use crate::hooks::LoopHook;
use crate::invoker::ToolInvoker;
use crate::llm::{LanguageModel, ModelCompletion};
use crate::message::{ConversationMessage, ToolCall, ToolInvocationResult};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// One executed call, kept for the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub result: ToolInvocationResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Success(String),
    Exhausted,
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Terminated(Termination),
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iterations: usize,
    pub transcript: Vec<ConversationMessage>,
}

impl LoopOutcome {
    /// Distinct tool names in first-use order.
    pub fn tools_used(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for record in &self.tool_calls {
            if !names.contains(&record.name) {
                names.push(record.name.clone());
            }
        }
        names
    }
}

pub struct FunctionCallLoop {
    model: Arc<dyn LanguageModel>,
    invoker: ToolInvoker,
    max_iterations: usize,
    hooks: Vec<Arc<dyn LoopHook>>,
}

impl FunctionCallLoop {
    pub fn new(model: Arc<dyn LanguageModel>, invoker: ToolInvoker) -> Self {
        Self {
            model,
            invoker,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            hooks: Vec::new(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn LoopHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = Arc<dyn LoopHook>>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub async fn run(&self, history: Vec<ConversationMessage>) -> Result<LoopOutcome> {
        self.run_until(history, None).await
    }

    /// Runs to termination. Past `deadline` the loop stops waiting on the
    /// model or on in-flight tools and fails with `DeadlineExceeded`.
    pub async fn run_until(
        &self,
        mut history: Vec<ConversationMessage>,
        deadline: Option<Instant>,
    ) -> Result<LoopOutcome> {
        let started = Instant::now();
        let catalog = self.invoker.registry().catalog().to_vec();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut iterations = 0usize;
        let mut state = LoopState::AwaitingModel;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    if iterations >= self.max_iterations {
                        LoopState::Terminated(Termination::Exhausted)
                    } else {
                        iterations += 1;
                        for hook in &self.hooks {
                            hook.before_model(iterations, &history).await?;
                        }
                        let completion = bounded(
                            deadline,
                            started,
                            self.model.complete_chat(&history, &catalog),
                        )
                        .await??;
                        for hook in &self.hooks {
                            hook.after_model(iterations, &completion).await?;
                        }
                        tracing::debug!(
                            iteration = iterations,
                            calls = completion.tool_calls.len(),
                            has_text = completion.content.is_some(),
                            "model turn complete"
                        );
                        next_state(completion)
                    }
                }
                LoopState::ExecutingTools(batch) => {
                    let results = bounded(
                        deadline,
                        started,
                        join_all(
                            batch
                                .iter()
                                .map(|call| self.invoker.invoke(&call.name, call.arguments.clone())),
                        ),
                    )
                    .await?;

                    history.push(ConversationMessage::tool_calls(&batch));
                    history.push(ConversationMessage::tool_results(&results));

                    let batch_records: Vec<ToolCallRecord> = batch
                        .into_iter()
                        .zip(results)
                        .map(|(call, result)| ToolCallRecord {
                            name: call.name,
                            arguments: call.arguments,
                            result,
                        })
                        .collect();
                    for hook in &self.hooks {
                        hook.after_tool_batch(iterations, &batch_records).await?;
                    }
                    records.extend(batch_records);
                    LoopState::AwaitingModel
                }
                LoopState::Terminated(Termination::Success(answer)) => {
                    history.push(ConversationMessage::model_text(&answer));
                    return Ok(LoopOutcome {
                        answer,
                        tool_calls: records,
                        iterations,
                        transcript: history,
                    });
                }
                LoopState::Terminated(Termination::Exhausted) => {
                    tracing::warn!(max = self.max_iterations, "iteration budget exhausted");
                    return Err(PipelineError::IterationBudgetExceeded {
                        max: self.max_iterations,
                    });
                }
                LoopState::Terminated(Termination::Malformed(detail)) => {
                    return Err(PipelineError::MalformedResponse(detail));
                }
            };
        }
    }
}

/// Tool calls take precedence over accompanying text.
fn next_state(completion: ModelCompletion) -> LoopState {
    if !completion.tool_calls.is_empty() {
        return LoopState::ExecutingTools(completion.tool_calls);
    }
    match completion.content {
        Some(text) if !text.trim().is_empty() => LoopState::Terminated(Termination::Success(text)),
        Some(_) => LoopState::Terminated(Termination::Malformed("blank text answer".into())),
        None => LoopState::Terminated(Termination::Malformed(
            "completion carried no content".into(),
        )),
    }
}

async fn bounded<F: std::future::Future>(
    deadline: Option<Instant>,
    started: Instant,
    future: F,
) -> Result<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future)
            .await
            .map_err(|_| PipelineError::DeadlineExceeded {
                elapsed: started.elapsed(),
            }),
        None => Ok(future.await),
    }
}
