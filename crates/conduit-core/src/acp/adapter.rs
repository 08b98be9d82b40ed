//! ACP session updates to normalized events.
//!
//! ACP nests everything a turn produces under `session/update`, keyed by
//! `sessionUpdate`:
//!
//! | Update | Normalized |
//! |--------|------------|
//! | `agent_message_chunk` | partial `Text` |
//! | `agent_thought_chunk` | partial `Text` with `reasoning` |
//! | `tool_call`, `tool_call_update` | `ToolUse` |
//! | `plan` | `System` with a rendered plan |
//! | `available_commands_update` | `Init` with slash commands |
//! | `user_message_chunk`, `current_mode_update` | nothing |
//! | anything else | `System` carrying the raw update |
//!
//! Stateless: the same update always maps to the same event. Deduplicating
//! cumulative chunks is the process wrapper's job.

use serde::Deserialize;
use serde_json::Value;

use crate::agents::event::{NormalizedEvent, ToolState, ToolStatus};

/// Loosely typed view of one update.
///
/// Agents disagree on a few field names, so the accessors check each known
/// spelling.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionUpdate {
    session_update: Option<String>,
    #[serde(rename = "type")]
    update_type: Option<String>,
    content: Option<Value>,
    tool_call_id: Option<String>,
    title: Option<String>,
    kind: Option<String>,
    status: Option<String>,
    raw_input: Option<Value>,
    input: Option<Value>,
    raw_output: Option<Value>,
    output: Option<Value>,
    #[serde(alias = "steps")]
    entries: Vec<PlanEntry>,
    available_commands: Vec<AvailableCommand>,
}

impl SessionUpdate {
    fn get_type(&self) -> Option<&str> {
        self.session_update
            .as_deref()
            .or(self.update_type.as_deref())
    }

    fn get_input(&self) -> Option<&Value> {
        self.raw_input.as_ref().or(self.input.as_ref())
    }

    fn get_output(&self) -> Option<&Value> {
        self.raw_output.as_ref().or(self.output.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PlanEntry {
    #[serde(alias = "description")]
    content: String,
    status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AvailableCommand {
    name: String,
}

/// Map one `session/update` payload (the `update` object) to a normalized event.
pub fn to_normalized(update: &Value) -> Option<NormalizedEvent> {
    let parsed: SessionUpdate = match serde_json::from_value(update.clone()) {
        Ok(u) => u,
        Err(e) => {
            log::debug!("Unparseable session update ({}): {}", e, update);
            return Some(NormalizedEvent::system(update.clone()));
        }
    };

    let Some(kind) = parsed.get_type() else {
        return Some(NormalizedEvent::system(update.clone()));
    };

    match kind {
        "agent_message_chunk" => {
            let text = parsed.content.as_ref().and_then(content_text)?;
            Some(NormalizedEvent::text(text, true))
        }
        "agent_thought_chunk" => {
            let text = parsed.content.as_ref().and_then(content_text)?;
            Some(NormalizedEvent::reasoning(text, true))
        }
        "tool_call" | "tool_call_update" => Some(tool_event(&parsed)),
        "plan" => Some(NormalizedEvent::System {
            raw: update.clone(),
            message: render_plan(&parsed.entries),
        }),
        "available_commands_update" => Some(NormalizedEvent::Init {
            session_id: None,
            slash_commands: Some(
                parsed
                    .available_commands
                    .iter()
                    .map(|c| c.name.clone())
                    .filter(|n| !n.is_empty())
                    .collect(),
            ),
        }),
        "user_message_chunk" | "current_mode_update" => None,
        _ => Some(NormalizedEvent::system(update.clone())),
    }
}

fn tool_event(update: &SessionUpdate) -> NormalizedEvent {
    let tool_name = match (update.kind.as_deref(), update.title.as_deref()) {
        (None, None) => None,
        (kind, title) => Some(kind_to_tool_name(
            kind.unwrap_or("other"),
            title.unwrap_or("Tool"),
        )),
    };

    let output = update.get_output().cloned().or_else(|| {
        update
            .content
            .as_ref()
            .and_then(content_text)
            .map(Value::String)
    });

    NormalizedEvent::ToolUse {
        tool_name,
        tool_state: ToolState::new(map_tool_status(update.status.as_deref()))
            .with_id(update.tool_call_id.clone())
            .with_input(update.get_input().cloned())
            .with_output(output),
    }
}

/// ACP tool status to ours. Unknown or absent means not started yet.
pub fn map_tool_status(status: Option<&str>) -> ToolStatus {
    match status {
        Some("in_progress") => ToolStatus::Running,
        Some("completed") => ToolStatus::Completed,
        Some("failed") => ToolStatus::Error,
        _ => ToolStatus::Pending,
    }
}

/// ACP tool kind to a familiar tool name; unknown kinds use the title.
pub fn kind_to_tool_name(kind: &str, title: &str) -> String {
    match kind {
        "execute" => "Bash".to_string(),
        "edit" => "Edit".to_string(),
        "read" => "Read".to_string(),
        "search" => "Grep".to_string(),
        "fetch" => "WebFetch".to_string(),
        "think" => "Think".to_string(),
        "delete" => "Delete".to_string(),
        "move" => "Move".to_string(),
        _ => title.to_string(),
    }
}

fn render_plan(entries: &[PlanEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let lines = entries
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. [{}] {}", i + 1, e.status, e.content))
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("Plan:\n{lines}"))
}

/// Text of a content block, a tool-call content item, or an array of either.
///
/// Non-text blocks render as bracketed placeholders so they still show up
/// in a transcript.
pub fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(content_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        Value::Object(map) => match map.get("type").and_then(Value::as_str) {
            Some("text") => map.get("text").and_then(content_text),
            Some("image") => Some(match map.get("mimeType").and_then(Value::as_str) {
                Some(mime) => format!("[image: {mime}]"),
                None => "[image]".to_string(),
            }),
            Some("audio") => Some("[audio]".to_string()),
            Some("resource") => {
                let uri = map
                    .get("resource")
                    .and_then(|r| r.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Some(format!("[resource: {uri}]"))
            }
            Some("resource_link") => {
                let name = map
                    .get("name")
                    .or_else(|| map.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Some(format!("[resource: {name}]"))
            }
            Some("content") => map.get("content").and_then(content_text),
            Some("diff") => {
                let path = map.get("path").and_then(Value::as_str).unwrap_or("file");
                Some(format!("[diff: {path}]"))
            }
            Some("terminal") => {
                let id = map
                    .get("terminalId")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Some(format!("[terminal: {id}]"))
            }
            // `{text: {text}}` and `{text}` without a type tag.
            _ => map.get("text").and_then(content_text),
        },
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
