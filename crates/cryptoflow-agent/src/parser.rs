use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::history::ToolInvocation;

/// A model response split into its ReAct parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub thought: String,
    pub action: Option<ToolInvocation>,
    pub final_answer: Option<String>,
}

impl ParsedResponse {
    /// A requested action always makes the turn non-final.
    pub fn is_final(&self) -> bool {
        self.action.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Marker {
    Thought,
    Action,
    ActionInput,
    Observation,
    FinalAnswer,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*(?P<line>Thought|Action Input|Action|Observation)[ \t]*:|(?P<fin>Final Answer)[ \t]*:",
        )
        .expect("marker pattern is valid")
    })
}

/// Split `text` into `(marker, body)` sections. Text before the first
/// marker belongs to the thought, since prompts end with `Thought:`.
fn sections(text: &str) -> Vec<(Marker, &str)> {
    let mut out = Vec::new();
    let mut current = Marker::Thought;
    let mut start = 0;

    for caps in marker_regex().captures_iter(text) {
        let (Some(whole), Some(label)) = (caps.get(0), caps.name("line").or(caps.name("fin")))
        else {
            continue;
        };
        out.push((current, &text[start..whole.start()]));
        current = match label.as_str() {
            "Thought" => Marker::Thought,
            "Action" => Marker::Action,
            "Action Input" => Marker::ActionInput,
            "Observation" => Marker::Observation,
            _ => Marker::FinalAnswer,
        };
        start = whole.end();
    }
    out.push((current, &text[start..]));
    out
}

/// Parse one model response.
///
/// Anything after an `Observation:` the model wrote for itself is ignored.
/// A response with neither an action nor `Final Answer:` is taken as the
/// answer itself.
pub fn parse(text: &str) -> ParsedResponse {
    let mut thought = Vec::new();
    let mut action: Option<String> = None;
    let mut action_input: Option<&str> = None;
    let mut final_answer: Option<String> = None;

    for (marker, body) in sections(text) {
        let trimmed = body.trim();
        match marker {
            Marker::Observation => break,
            Marker::Thought if !trimmed.is_empty() => thought.push(trimmed),
            Marker::Thought => {}
            Marker::Action if action.is_none() => {
                let name = clean_tool_name(trimmed.lines().next().unwrap_or(""));
                if !name.is_empty() {
                    action = Some(name);
                }
            }
            Marker::ActionInput if action.is_some() && action_input.is_none() => {
                action_input = Some(trimmed);
            }
            Marker::FinalAnswer if final_answer.is_none() => {
                final_answer = Some(trimmed.to_string());
            }
            _ => {}
        }
    }

    let thought = thought.join("\n");
    let action = action.map(|name| {
        ToolInvocation::new(name, parse_arguments(action_input.unwrap_or("")))
    });
    let final_answer = match (&action, final_answer) {
        (_, Some(answer)) => Some(answer),
        (None, None) => Some(if thought.is_empty() {
            text.trim().to_string()
        } else {
            thought.clone()
        }),
        (Some(_), None) => None,
    };

    ParsedResponse {
        thought,
        action,
        final_answer,
    }
}

fn clean_tool_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '[' | ']' | '*'))
        .trim()
        .to_string()
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(inner) = raw.strip_prefix("```") else {
        return raw;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Parse an `Action Input:` body. JSON objects are used as-is; anything
/// else is passed as `{"query": <text>}`.
pub fn parse_arguments(raw: &str) -> Map<String, Value> {
    let raw = strip_code_fence(raw.trim());
    if raw.is_empty() {
        return Map::new();
    }

    let parsed = serde_json::from_str::<Value>(raw).ok().or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str::<Value>(&raw[start..=end]).ok()
    });

    let query = match parsed {
        Some(Value::Object(map)) => return map,
        Some(Value::String(s)) => s,
        _ => raw.to_string(),
    };
    let mut map = Map::new();
    map.insert("query".into(), Value::String(query));
    map
}
