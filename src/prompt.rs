use std::collections::BTreeMap;

use serde_json::Value;

use crate::message::ConversationMessage;
use crate::protocol::AgentRequest;

pub const PREVIOUS_RESULTS_HEADER: &str = "PREVIOUS AGENT RESULTS:";
pub const CONTEXT_HEADER: &str = "ADDITIONAL CONTEXT:";
pub const QUERY_HEADER: &str = "QUERY:";

/// Assembles the opening user turn for an agent.
pub struct PromptBuilder;

impl PromptBuilder {
    /// Role instructions, then one block per prior stage in order, then the
    /// context as JSON with sorted keys, then the query. Empty sections are left out.
    pub fn build(role_prompt: &str, request: &AgentRequest) -> ConversationMessage {
        ConversationMessage::user_text(Self::render(role_prompt, request))
    }

    pub fn render(role_prompt: &str, request: &AgentRequest) -> String {
        let mut sections: Vec<String> = Vec::new();

        let role_prompt = role_prompt.trim();
        if !role_prompt.is_empty() {
            sections.push(role_prompt.to_string());
        }

        if !request.previous_results.is_empty() {
            let mut block = String::from(PREVIOUS_RESULTS_HEADER);
            for prior in &request.previous_results {
                block.push_str(&format!("\n\n[{}]\n{}", prior.stage, prior.result.trim()));
            }
            sections.push(block);
        }

        if let Some(context) = request.context.as_ref().filter(|ctx| !ctx.is_empty()) {
            sections.push(format!("{CONTEXT_HEADER}\n{}", stable_json(context)));
        }

        sections.push(format!("{QUERY_HEADER}\n{}", request.query));
        sections.join("\n\n")
    }
}

/// `BTreeMap` already iterates in key order; nested objects are re-sorted so
/// the output does not depend on how the caller built them.
fn stable_json(context: &BTreeMap<String, Value>) -> String {
    let sorted: BTreeMap<&String, Value> = context
        .iter()
        .map(|(key, value)| (key, sort_value(value)))
        .collect();
    serde_json::to_string(&sorted).unwrap_or_else(|_| "{}".to_string())
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(key, inner)| (key.clone(), sort_value(inner)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}
