use std::fmt::Write;

use cryptoflow_core::types::{ChatMessage, ToolDefinition};

use crate::history::History;

pub const DEFAULT_PREAMBLE: &str =
    "You are a cryptocurrency analysis assistant with access to various tools.";

const FORMAT: &str = "Use the following format:

Thought: you should always think about what to do
Action: the action to take, should be one of [{tool_names}]
Action Input: the input to the action (JSON format)
Observation: the result of the action
... (this Thought/Action/Action Input/Observation can repeat N times)
Thought: I now know the final answer
Final Answer: the final answer to the original question";

fn render_tools(tools: &[ToolDefinition]) -> String {
    let mut out = String::new();
    for t in tools {
        let _ = writeln!(out, "- {}: {}", t.name, t.description);
        let _ = writeln!(out, "  Input schema: {}", t.input_schema);
        if t.side_effects {
            let _ = writeln!(out, "  Side effects: yes, call it at most once per answer");
        }
    }
    out
}

/// The turns so far in ReAct text form.
pub fn render_scratchpad(history: &History) -> String {
    let mut out = String::new();
    for turn in history.turns() {
        let _ = writeln!(out, "Thought: {}", turn.thought);
        if let Some(action) = &turn.action {
            let _ = writeln!(out, "Action: {}", action.name);
            let _ = writeln!(out, "Action Input: {}", action.input());
        }
        if let Some(obs) = &turn.observation {
            let _ = writeln!(out, "Observation: {}", obs.content);
        }
    }
    out
}

/// Full ReAct prompt for the next model call.
pub fn build_prompt(preamble: Option<&str>, tools: &[ToolDefinition], history: &History) -> String {
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    format!(
        "{preamble}\n\nAvailable Tools:\n{tools}\n{format}\n\nBegin!\n\nQuestion: {question}\n{scratchpad}Thought:",
        preamble = preamble.unwrap_or(DEFAULT_PREAMBLE),
        tools = render_tools(tools),
        format = FORMAT.replace("{tool_names}", &names.join(", ")),
        question = history.query(),
        scratchpad = render_scratchpad(history),
    )
}

/// Messages for one loop iteration: the whole prompt as a single user turn.
pub fn messages(preamble: Option<&str>, tools: &[ToolDefinition], history: &History) -> Vec<ChatMessage> {
    vec![ChatMessage::user(build_prompt(preamble, tools, history))]
}

/// Cut a tool observation down to `max_chars`, preferring a line boundary.
pub fn compact_observation(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut = content
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    let truncated = &content[..cut];
    match truncated.rfind('\n') {
        Some(nl) if nl > 0 => format!("{}\n[truncated]", &content[..nl]),
        _ => format!("{truncated}\n[truncated]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Observation, ToolInvocation, Turn};
    use serde_json::json;

    fn defs() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "get_crypto_price".into(),
                description: "Get current price".into(),
                input_schema: json!({"type": "object"}),
                side_effects: false,
            },
            ToolDefinition {
                name: "search".into(),
                description: "Search the web".into(),
                input_schema: json!({"type": "object"}),
                side_effects: false,
            },
            ToolDefinition {
                name: "send_notification".into(),
                description: "Send a message".into(),
                input_schema: json!({"type": "object"}),
                side_effects: true,
            },
        ]
    }

    #[test]
    fn test_prompt_layout() {
        let p = build_prompt(None, &defs(), &History::new("What is BTC at?"));
        assert!(p.starts_with(DEFAULT_PREAMBLE));
        assert!(p.contains("- get_crypto_price: Get current price"));
        assert!(p.contains("should be one of [get_crypto_price, search, send_notification]"));
        assert!(p.contains(
            "- send_notification: Send a message\n  Input schema: {\"type\":\"object\"}\n  Side effects: yes"
        ));
        assert_eq!(p.matches("Side effects:").count(), 1);
        assert!(p.contains("Question: What is BTC at?\nThought:"));
        assert!(p.ends_with("Thought:"));
    }

    #[test]
    fn test_scratchpad_carries_observations() {
        let args = json!({"symbol": "BTC"}).as_object().cloned().unwrap();
        let history = History::new("q").push(
            Turn::thinking("need price")
                .act(ToolInvocation::new("get_crypto_price", args))
                .observe(Observation::success("{\"current_price\":50000}")),
        );
        let p = build_prompt(Some("Custom preamble."), &defs(), &history);
        assert!(p.starts_with("Custom preamble."));
        assert!(p.contains(
            "Thought: need price\nAction: get_crypto_price\nAction Input: {\"symbol\":\"BTC\"}\nObservation: {\"current_price\":50000}\nThought:"
        ));
    }

    #[test]
    fn test_compact_observation() {
        assert_eq!(compact_observation("short", 100), "short");

        let long = "line one\nline two\nline three";
        assert_eq!(compact_observation(long, 12), "line one\n[truncated]");

        let wide = "ééééé";
        assert_eq!(compact_observation(wide, 2), "éé\n[truncated]");
    }
}
