//! Plain-text path of the classifier, for agents that only produce terminal output.

use serde_json::Value;

use crate::frames::balanced_object;
use crate::ClassifiedEvent;

const ERROR_MARKERS: &[&str] = &["error", "failed", "exception"];

const PROGRESS_VERBS: &[&str] = &[
    "reading",
    "writing",
    "running",
    "creating",
    "editing",
    "updating",
    "installing",
    "searching",
    "building",
];

const PROGRESS_GLYPHS: &[char] = &[
    '✓', '✔', '✗', '✘', '●', '⏺', '◆', '▶', '→', '⚡', '⏳', '🔧', '📝', '📄', '🚀',
];

const PROMPT_MARKERS: &[&str] = &[">", "$", "#", "%", "❯", "›", "»"];

const AGENT_COMMANDS: &[&str] = &["claude", "codex", "gemini", "cursor-agent", "opencode", "amp"];

pub fn classify_text(raw: &str) -> ClassifiedEvent {
    let cleaned = strip_ansi(raw);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return ClassifiedEvent::Skip;
    }

    if trimmed.starts_with('{') || trimmed.starts_with("\"type\":") {
        return json_fragment(trimmed);
    }

    let body = strip_noise_lines(trimmed);
    if body.is_empty() {
        return ClassifiedEvent::Skip;
    }

    let lower = body.to_lowercase();
    if ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ClassifiedEvent::error(body);
    }
    if is_progress_line(&body, &lower) {
        return ClassifiedEvent::status(body);
    }
    ClassifiedEvent::message(body)
}

/// Removes ANSI escape sequences, carriage returns and other control characters.
///
/// Newlines and tabs are kept.
pub fn strip_ansi(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\x1b' => match chars.peek() {
                // CSI: ESC [ params final
                Some('[') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: ESC ] ... BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\n' | '\t' => result.push(ch),
            c if c.is_control() => {}
            c => result.push(c),
        }
    }
    result
}

/// Only a complete object whose top-level `type` is `assistant` yields text. System/init
/// records and anything truncated are skipped.
fn json_fragment(text: &str) -> ClassifiedEvent {
    let candidate = if text.starts_with('{') {
        text.to_string()
    } else {
        format!("{{{text}")
    };
    let Some(object) = balanced_object(&candidate) else {
        return ClassifiedEvent::Skip;
    };
    let Ok(value) = serde_json::from_str::<Value>(object) else {
        return ClassifiedEvent::Skip;
    };
    if value.get("type").and_then(Value::as_str) != Some("assistant") {
        return ClassifiedEvent::Skip;
    }

    let content = value
        .get("message")
        .and_then(|msg| msg.get("content"))
        .or_else(|| value.get("content"));
    let text = match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    if text.trim().is_empty() {
        ClassifiedEvent::Skip
    } else {
        ClassifiedEvent::message(text.trim())
    }
}

fn strip_noise_lines(text: &str) -> String {
    text.lines()
        .filter_map(|line| {
            let line = strip_line_number(line.trim_end());
            let bare = line.trim();
            if bare.is_empty() || PROMPT_MARKERS.contains(&bare) || is_agent_echo(bare) {
                None
            } else {
                Some(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Drops editor-style prefixes such as `  12 | ` or `12→`.
fn strip_line_number(line: &str) -> &str {
    let rest = line.trim_start();
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return line;
    }
    let after = rest[digits..].trim_start();
    for separator in ['|', '│', '→', ':'] {
        if let Some(stripped) = after.strip_prefix(separator) {
            return stripped.strip_prefix(' ').unwrap_or(stripped);
        }
    }
    line
}

fn is_agent_echo(line: &str) -> bool {
    let command = PROMPT_MARKERS
        .iter()
        .find_map(|marker| line.strip_prefix(marker))
        .map(str::trim_start)
        .unwrap_or(line);
    AGENT_COMMANDS.iter().any(|agent| {
        command == *agent
            || command
                .strip_prefix(agent)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

fn is_progress_line(body: &str, lower: &str) -> bool {
    if body
        .chars()
        .next()
        .is_some_and(|c| PROGRESS_GLYPHS.contains(&c) || ('\u{2800}'..='\u{28ff}').contains(&c))
    {
        return true;
    }
    PROGRESS_VERBS.iter().any(|verb| lower.starts_with(verb))
}
