//! Reassembly of `data:` frames from an event stream delivered in arbitrary chunks.
//!
//! The reassembler is pull-based: callers feed chunks through [`FrameReassembler::push_bytes`]
//! or [`FrameReassembler::add_chunk`] and must call [`FrameReassembler::flush`] once the
//! transport ends so that a final unterminated frame is not lost.

use serde_json::Value;

const DATA_PREFIX: &str = "data:";
const MAX_PARTIAL_BYTES: usize = 1024 * 1024;

/// Output of one `add_chunk`/`flush` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameBatch {
    /// Complete JSON objects in stream order.
    pub payloads: Vec<Value>,
    /// Non-data lines (`event:`, `id:`, `: comment`, stray text) kept verbatim.
    pub passthrough: Vec<String>,
}

impl FrameBatch {
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty() && self.passthrough.is_empty()
    }

    pub fn extend(&mut self, other: FrameBatch) {
        self.payloads.extend(other.payloads);
        self.passthrough.extend(other.passthrough);
    }
}

#[derive(Debug, Default)]
pub struct FrameReassembler {
    /// Trailing text of the stream that has not seen its newline yet.
    carry: String,
    /// Tail of a multi-byte UTF-8 sequence split across chunks.
    pending_bytes: Vec<u8>,
    /// Data payload text that did not parse yet and waits for the next data line.
    partial: Option<String>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw transport bytes. Split UTF-8 sequences are held until completed.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> FrameBatch {
        let text = self.decode(chunk);
        self.add_chunk(&text)
    }

    pub fn add_chunk(&mut self, chunk: &str) -> FrameBatch {
        let mut batch = FrameBatch::default();
        self.carry.push_str(chunk);
        let Some(last_newline) = self.carry.rfind('\n') else {
            return batch;
        };

        let complete: String = self.carry.drain(..=last_newline).collect();
        for line in complete.split_terminator('\n') {
            self.consume_line(line.trim_end_matches('\r'), &mut batch);
        }
        batch
    }

    /// Parses whatever is still buffered and resets the reassembler, even if nothing parsed.
    pub fn flush(&mut self) -> FrameBatch {
        let mut batch = FrameBatch::default();
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_bytes.clear();
            self.carry.push_str(&tail);
        }

        let last = std::mem::take(&mut self.carry);
        if !last.is_empty() {
            self.consume_line(last.trim_end_matches('\r'), &mut batch);
        }

        if let Some(partial) = self.partial.take() {
            match parse_object(&partial).or_else(|| recover_object(&partial)) {
                Some(value) => batch.payloads.push(value),
                None => {
                    tracing::debug!(
                        bytes = partial.len(),
                        "frames: dropping unparseable partial payload at flush"
                    );
                }
            }
        }
        batch
    }

    /// True when a partial payload or unterminated line is still buffered.
    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty() || self.partial.is_some() || !self.pending_bytes.is_empty()
    }

    fn consume_line(&mut self, line: &str, batch: &mut FrameBatch) {
        if line.is_empty() {
            return;
        }
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            batch.passthrough.push(line.to_string());
            return;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.trim().is_empty() {
            return;
        }
        if self.partial.is_none() && !data.trim_start().starts_with('{') {
            // Sentinels such as `[DONE]` are not payloads.
            batch.passthrough.push(line.to_string());
            return;
        }

        let candidate = match self.partial.take() {
            Some(mut partial) => {
                partial.push_str(data);
                partial
            }
            None => data.to_string(),
        };

        if let Some(value) = parse_object(&candidate).or_else(|| recover_object(&candidate)) {
            batch.payloads.push(value);
            return;
        }

        if candidate.len() != data.len() {
            if let Some(value) = parse_object(data).or_else(|| recover_object(data)) {
                tracing::debug!(
                    dropped_bytes = candidate.len() - data.len(),
                    "frames: discarding stale partial payload"
                );
                batch.payloads.push(value);
                return;
            }
        }

        if candidate.len() > MAX_PARTIAL_BYTES {
            tracing::warn!(
                bytes = candidate.len(),
                "frames: partial payload exceeded limit, dropping"
            );
            return;
        }
        self.partial = Some(candidate);
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            let (valid, invalid_len) = match std::str::from_utf8(&self.pending_bytes) {
                Ok(_) => (self.pending_bytes.len(), None),
                Err(err) => (err.valid_up_to(), Some(err.error_len())),
            };
            out.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
            match invalid_len {
                None => {
                    self.pending_bytes.clear();
                    break;
                }
                // incomplete sequence at the end, keep it for the next chunk
                Some(None) => {
                    self.pending_bytes.drain(..valid);
                    break;
                }
                Some(Some(len)) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.pending_bytes.drain(..valid + len);
                }
            }
        }
        out
    }
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

fn recover_object(text: &str) -> Option<Value> {
    balanced_object(text).and_then(parse_object)
}

/// Returns the first balanced `{...}` span starting at the first opening brace.
///
/// Braces inside JSON string literals are ignored.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
