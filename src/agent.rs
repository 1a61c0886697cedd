use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::AgentConfig;
use crate::cost::{CostAccountant, CostSummary, PricingTable, TokenUsage};
use crate::error::{PipelineError, Result};
use crate::function_loop::{FunctionCallLoop, LoopOutcome, DEFAULT_MAX_ITERATIONS};
use crate::hooks::LoopHook;
use crate::invoker::{ToolInvoker, DEFAULT_TOOL_TIMEOUT};
use crate::llm::{LanguageModel, ModelCompletion};
use crate::mcp::ToolServer;
use crate::prompt::PromptBuilder;
use crate::protocol::{AgentRequest, AgentResponse};
use crate::tool::ToolRegistry;
use crate::workflow::AgentEndpoint;

/// Serves agent requests: one prompt, one function-call loop, one response.
pub struct AgentRuntime {
    name: String,
    role_prompt: String,
    model: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    tool_server: Option<Arc<dyn ToolServer>>,
    max_iterations: usize,
    tool_timeout: Duration,
    deadline: Option<Duration>,
    accountant: CostAccountant,
    hooks: Vec<Arc<dyn LoopHook>>,
}

impl AgentRuntime {
    pub fn new(name: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        let accountant = CostAccountant::new(model.model_id());
        Self {
            name: name.into(),
            role_prompt: "You are a helpful agent.".to_string(),
            model,
            tools: ToolRegistry::new(),
            tool_server: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            deadline: None,
            accountant,
            hooks: Vec::new(),
        }
    }

    pub fn from_config(cfg: &AgentConfig, model: Arc<dyn LanguageModel>) -> Self {
        let mut runtime = Self::new(cfg.name.clone(), model)
            .with_role_prompt(cfg.role_prompt.clone())
            .with_max_iterations(cfg.max_iterations)
            .with_tool_timeout(cfg.tool_timeout());
        runtime.deadline = cfg.deadline();
        runtime
    }

    pub fn with_role_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.role_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_server(mut self, server: Arc<dyn ToolServer>) -> Self {
        self.tool_server = Some(server);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Default budget applied by [`process`](Self::process).
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Replaces the accountant; totals gathered so far are dropped.
    pub fn with_pricing(mut self, table: &PricingTable) -> Self {
        self.accountant = CostAccountant::with_pricing(self.model.model_id(), table);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn LoopHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn cost_summary(&self) -> CostSummary {
        self.accountant.summary()
    }

    pub fn reset_costs(&self) {
        self.accountant.reset();
    }

    pub async fn process(&self, request: AgentRequest) -> Result<AgentResponse> {
        let deadline = self.deadline.map(|budget| Instant::now() + budget);
        self.run(request, deadline).await
    }

    pub async fn process_with_deadline(
        &self,
        request: AgentRequest,
        deadline: Instant,
    ) -> Result<AgentResponse> {
        self.run(request, Some(deadline)).await
    }

    async fn run(&self, mut request: AgentRequest, deadline: Option<Instant>) -> Result<AgentResponse> {
        request.normalize();
        let correlation_id = request.correlation_id.clone();
        let span = tracing::info_span!(
            "agent",
            agent = %self.name,
            correlation_id = %correlation_id
        );

        async move {
            let started = Instant::now();
            let usage = Arc::new(UsageHook::new(self.accountant.clone()));
            match self.execute(&request, deadline, usage.clone()).await {
                Ok(outcome) => {
                    let token_usage = usage.total();
                    let execution_time = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        iterations = outcome.iterations,
                        tool_calls = outcome.tool_calls.len(),
                        total_tokens = token_usage.total_tokens,
                        execution_time_ms = execution_time,
                        "request complete"
                    );
                    Ok(AgentResponse {
                        correlation_id,
                        agent: self.name.clone(),
                        tools_used: outcome.tools_used(),
                        result: outcome.answer,
                        execution_time,
                        token_usage,
                        iteration_count: outcome.iterations,
                    })
                }
                Err(err) => {
                    let elapsed = started.elapsed();
                    tracing::error!(error = %err, elapsed_ms = elapsed.as_millis() as u64, "request failed");
                    Err(PipelineError::Agent {
                        correlation_id: correlation_id.to_string(),
                        elapsed,
                        token_usage: usage.total(),
                        source: Box::new(err),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        deadline: Option<Instant>,
        usage: Arc<UsageHook>,
    ) -> Result<LoopOutcome> {
        request.validate()?;
        let started = Instant::now();

        let mut registry = self.tools.clone();
        let mut invoker_server = None;
        if let Some(server) = &self.tool_server {
            let listed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, server.list_tools())
                    .await
                    .map_err(|_| PipelineError::DeadlineExceeded {
                        elapsed: started.elapsed(),
                    })??,
                None => server.list_tools().await?,
            };
            let offered = listed.len();
            registry.merge_remote(listed);
            tracing::debug!(
                offered,
                remote_tools = registry.remote_count(),
                "merged remote tool catalog"
            );
            invoker_server = Some(server.clone());
        }

        let mut invoker = ToolInvoker::new(Arc::new(registry)).with_remote_timeout(self.tool_timeout);
        if let Some(server) = invoker_server {
            invoker = invoker.with_server(server);
        }

        let function_loop = FunctionCallLoop::new(self.model.clone(), invoker)
            .with_max_iterations(self.max_iterations)
            .with_hooks(self.hooks.iter().cloned())
            .with_hook(usage);

        let prompt = PromptBuilder::build(&self.role_prompt, request);
        function_loop.run_until(vec![prompt], deadline).await
    }
}

#[async_trait]
impl AgentEndpoint for AgentRuntime {
    async fn call(&self, request: AgentRequest, deadline: Option<Instant>) -> Result<AgentResponse> {
        match deadline {
            Some(deadline) => self.process_with_deadline(request, deadline).await,
            None => self.process(request).await,
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Prices every completion as it arrives, so failed runs still report what
/// they spent.
struct UsageHook {
    accountant: CostAccountant,
    run_total: Mutex<TokenUsage>,
}

impl UsageHook {
    fn new(accountant: CostAccountant) -> Self {
        Self {
            accountant,
            run_total: Mutex::new(TokenUsage::default()),
        }
    }

    fn total(&self) -> TokenUsage {
        *self.run_total.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LoopHook for UsageHook {
    async fn after_model(&self, _iteration: usize, completion: &ModelCompletion) -> Result<()> {
        let usage = self
            .accountant
            .track(completion.usage.input_tokens, completion.usage.output_tokens);
        *self.run_total.lock().unwrap_or_else(PoisonError::into_inner) += usage;
        Ok(())
    }
}
