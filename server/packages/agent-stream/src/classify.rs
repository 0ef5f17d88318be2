use serde_json::Value;

use crate::text::classify_text;
use crate::ClassifiedEvent;

/// Longest shell command shown in a tool notice before it is cut with `...`.
pub const COMMAND_PREVIEW_CHARS: usize = 100;

/// Wrapper types used by backends that relay raw process output instead of structured events.
const RAW_OUTPUT_TYPES: &[&str] = &["stdout", "stderr", "output", "raw"];

/// Classifies one reassembled stream payload.
///
/// Payloads wrapping raw process output go through the plain-text path, everything else
/// through [`classify_value`].
pub fn classify_payload(payload: &Value) -> ClassifiedEvent {
    let event_type = payload.get("type").and_then(Value::as_str).unwrap_or("");
    if RAW_OUTPUT_TYPES.contains(&event_type) {
        let text = payload
            .get("data")
            .or_else(|| payload.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("");
        return classify_text(text);
    }
    classify_value(payload)
}

/// Structured path. Unknown tags and missing fields classify as `Skip`.
pub fn classify_value(event: &Value) -> ClassifiedEvent {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "system" => ClassifiedEvent::Skip,
        "assistant" => assistant_event(event),
        "tool_use" => tool_notice(event),
        "user" | "tool_result" => ClassifiedEvent::Skip,
        "result" => result_event(event),
        "error" => error_event(event),
        _ => ClassifiedEvent::Skip,
    }
}

fn assistant_event(event: &Value) -> ClassifiedEvent {
    let content = event
        .get("message")
        .and_then(|msg| msg.get("content"))
        .or_else(|| event.get("content"));

    let blocks = match content {
        Some(Value::String(text)) => return ClassifiedEvent::message(text.trim()),
        Some(Value::Array(blocks)) => blocks,
        _ => return ClassifiedEvent::Skip,
    };

    // The first significant block decides the event kind.
    for block in blocks {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => return joined_text(blocks),
            "thinking" => {
                let text = block
                    .get("thinking")
                    .or_else(|| block.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if text.trim().is_empty() {
                    continue;
                }
                return ClassifiedEvent::Thinking {
                    content: text.to_string(),
                };
            }
            "tool_use" => return tool_notice(block),
            _ => {}
        }
    }
    ClassifiedEvent::Skip
}

fn joined_text(blocks: &[Value]) -> ClassifiedEvent {
    let text = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        ClassifiedEvent::Skip
    } else {
        ClassifiedEvent::message(text)
    }
}

fn tool_notice(block: &Value) -> ClassifiedEvent {
    let Some(name) = block.get("name").and_then(Value::as_str) else {
        return ClassifiedEvent::Skip;
    };
    let input = block.get("input").unwrap_or(&Value::Null);
    let file_path = input
        .get("file_path")
        .or_else(|| input.get("path"))
        .or_else(|| input.get("notebook_path"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let (content, command) = match (name, file_path.as_deref()) {
        ("Bash", _) => match input.get("command").and_then(Value::as_str) {
            Some(command) => {
                let preview = command_preview(command);
                (format!("Running: {preview}"), Some(preview))
            }
            None => (format!("Using tool: {name}"), None),
        },
        ("Write", Some(path)) => (format!("Writing {path}"), None),
        ("Edit" | "MultiEdit" | "NotebookEdit", Some(path)) => (format!("Editing {path}"), None),
        ("Read", Some(path)) => (format!("Reading {path}"), None),
        _ => (format!("Using tool: {name}"), None),
    };

    ClassifiedEvent::Tool {
        content,
        tool: name.to_string(),
        file_path,
        command,
    }
}

fn command_preview(command: &str) -> String {
    let command = command.trim();
    if command.chars().count() <= COMMAND_PREVIEW_CHARS {
        return command.to_string();
    }
    let mut preview: String = command.chars().take(COMMAND_PREVIEW_CHARS).collect();
    preview.push_str("...");
    preview
}

fn result_event(event: &Value) -> ClassifiedEvent {
    if event.get("is_error").and_then(Value::as_bool) == Some(true) {
        let message = event
            .get("result")
            .or_else(|| event.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("agent run failed");
        return ClassifiedEvent::error(message);
    }
    match event.get("duration_ms").and_then(Value::as_u64) {
        Some(ms) => ClassifiedEvent::status(format!("Completed in {:.1}s", ms as f64 / 1000.0)),
        None => ClassifiedEvent::status("Completed"),
    }
}

fn error_event(event: &Value) -> ClassifiedEvent {
    let message = match event.get("error") {
        Some(Value::String(message)) => Some(message.as_str()),
        Some(Value::Object(obj)) => obj.get("message").and_then(Value::as_str),
        _ => None,
    }
    .or_else(|| event.get("message").and_then(Value::as_str))
    .unwrap_or("unknown agent error");
    ClassifiedEvent::error(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_init_is_skipped() {
        let event = json!({"type": "system", "subtype": "init", "session_id": "abc"});
        assert_eq!(classify_value(&event), ClassifiedEvent::Skip);
    }

    #[test]
    fn bash_tool_use_becomes_running_notice() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "npm run build"}}
            ]}
        });
        insta::assert_json_snapshot!(classify_value(&event), @r###"
        {
          "type": "tool",
          "content": "Running: npm run build",
          "tool": "Bash",
          "command": "npm run build"
        }
        "###);
    }

    #[test]
    fn long_commands_are_truncated_with_ellipsis() {
        let command = "x".repeat(150);
        let event = json!({"type": "tool_use", "name": "Bash", "input": {"command": command}});
        let ClassifiedEvent::Tool { content, command, .. } = classify_value(&event) else {
            panic!("expected tool event");
        };
        let preview = command.expect("command preview");
        assert_eq!(preview.chars().count(), COMMAND_PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(content, format!("Running: {preview}"));
    }

    #[test]
    fn thinking_block_content_is_preserved() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "The header needs a sticky nav."},
                {"type": "text", "text": "ignored"}
            ]}
        });
        assert_eq!(
            classify_value(&event),
            ClassifiedEvent::Thinking {
                content: "The header needs a sticky nav.".to_string()
            }
        );
    }

    #[test]
    fn text_blocks_are_newline_joined() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Updated the hero section."},
                {"type": "text", "text": "Next I will wire the footer."}
            ]}
        });
        assert_eq!(
            classify_value(&event),
            ClassifiedEvent::message("Updated the hero section.\nNext I will wire the footer.")
        );
    }

    #[test]
    fn file_tools_name_their_target() {
        let write = json!({"type": "tool_use", "name": "Write", "input": {"file_path": "src/App.tsx", "content": "..."}});
        let edit = json!({"type": "tool_use", "name": "Edit", "input": {"file_path": "src/index.css"}});
        let read = json!({"type": "tool_use", "name": "Read", "input": {"file_path": "package.json"}});
        let other = json!({"type": "tool_use", "name": "WebFetch", "input": {"url": "https://example.com"}});
        assert_eq!(classify_value(&write).content(), Some("Writing src/App.tsx"));
        assert_eq!(classify_value(&edit).content(), Some("Editing src/index.css"));
        assert_eq!(classify_value(&read).content(), Some("Reading package.json"));
        assert_eq!(classify_value(&other).content(), Some("Using tool: WebFetch"));
    }

    #[test]
    fn tool_results_and_unknown_types_skip() {
        let result = json!({"type": "user", "message": {"content": [{"type": "tool_result", "content": "ok"}]}});
        assert_eq!(classify_value(&result), ClassifiedEvent::Skip);
        assert_eq!(classify_value(&json!({"type": "mystery"})), ClassifiedEvent::Skip);
        assert_eq!(classify_value(&json!({"no_type": true})), ClassifiedEvent::Skip);
        assert_eq!(
            classify_value(&json!({"type": "assistant", "message": {"content": 7}})),
            ClassifiedEvent::Skip
        );
    }

    #[test]
    fn error_objects_use_their_message() {
        let nested = json!({"type": "error", "error": {"message": "rate limited"}});
        let flat = json!({"type": "error", "message": "sandbox lost"});
        assert_eq!(classify_value(&nested), ClassifiedEvent::error("rate limited"));
        assert_eq!(classify_value(&flat), ClassifiedEvent::error("sandbox lost"));
    }

    #[test]
    fn raw_output_payloads_use_text_path() {
        let payload = json!({"type": "stdout", "data": "Error: build failed"});
        assert_eq!(classify_payload(&payload), ClassifiedEvent::error("Error: build failed"));
    }
}
