//! Splits a streamed tutor reply into spoken text and trailing metadata.
//!
//! The model writes what the tutor says out loud, then a delimiter, then a
//! JSON object with the structured parts of the turn:
//!
//! ```text
//! ¡Hola! ¿Qué desea tomar?|||{"translation":"Hi! What would you like?"}
//! ```
//!
//! [`TextSegmenter`] reports the spoken part as a growing prefix while the
//! reply streams in. [`SentenceChunker`] cuts that prefix into sentences so
//! synthesis can start before the reply is complete.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// Characters stripped from both ends of the spoken text.
fn is_wrapping(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '\'' | '“' | '”' | '`')
}

/// Incremental spoken/metadata splitter for one reply.
#[derive(Debug)]
pub struct TextSegmenter {
    delimiter: String,
    buffer: String,
    /// Byte offset of the delimiter in `buffer`, once seen.
    delimiter_at: Option<usize>,
    /// Length of the spoken text already reported.
    reported: usize,
}

/// The completed split of one reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segmented {
    pub spoken: String,
    pub metadata: Map<String, Value>,
    /// Whether the delimiter appeared at all.
    pub delimited: bool,
}

impl TextSegmenter {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            buffer: String::new(),
            delimiter_at: None,
            reported: 0,
        }
    }

    /// Append a delta. Returns the newly available spoken text, if any.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }

        let search_from = self.buffer.len().saturating_sub(self.delimiter.len());
        self.buffer.push_str(delta);

        if self.delimiter_at.is_none() && !self.delimiter.is_empty() {
            let start = floor_char_boundary(&self.buffer, search_from);
            if let Some(pos) = self.buffer[start..].find(&self.delimiter) {
                self.delimiter_at = Some(start + pos);
            }
        }

        let visible = self.visible();
        if visible.len() <= self.reported {
            return None;
        }
        let fragment = visible[self.reported..].to_string();
        self.reported = visible.len();
        Some(fragment)
    }

    /// Spoken text reported so far.
    pub fn spoken(&self) -> &str {
        &self.visible()[..self.reported]
    }

    /// Spoken text that is safe to show: everything before the delimiter, or
    /// before a trailing partial delimiter, without wrapping quotes or spaces.
    fn visible(&self) -> &str {
        let end = match self.delimiter_at {
            Some(pos) => pos,
            None => self.buffer.len() - self.partial_delimiter_len(),
        };
        self.buffer[..end].trim_start_matches(is_wrapping).trim_end_matches(is_wrapping)
    }

    /// Length of the longest buffer suffix that could still grow into the delimiter.
    fn partial_delimiter_len(&self) -> usize {
        let max = self.delimiter.len().saturating_sub(1).min(self.buffer.len());
        (1..=max)
            .rev()
            .find(|&n| {
                let start = self.buffer.len() - n;
                self.buffer.is_char_boundary(start) && self.delimiter.starts_with(&self.buffer[start..])
            })
            .unwrap_or(0)
    }

    /// Finish the reply and parse whatever followed the delimiter.
    pub fn finish(self) -> Segmented {
        match self.delimiter_at {
            Some(pos) => {
                let spoken = self.buffer[..pos]
                    .trim_matches(is_wrapping)
                    .to_string();
                let tail = &self.buffer[pos + self.delimiter.len()..];
                Segmented {
                    spoken,
                    metadata: parse_metadata(tail),
                    delimited: true,
                }
            }
            None => {
                // No metadata section: the whole reply is speech
                debug!(len = self.buffer.len(), "Reply had no delimiter; treating it as plain speech");
                Segmented {
                    spoken: self.buffer.trim_matches(is_wrapping).to_string(),
                    metadata: Map::new(),
                    delimited: false,
                }
            }
        }
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Parse the metadata section as a JSON object, falling back to field
/// extraction when the model produced something that is not quite JSON.
pub fn parse_metadata(raw: &str) -> Map<String, Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Map::new();
    }

    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            let map = extract_fields(trimmed);
            debug!(recovered = map.len(), "Metadata was not valid JSON; extracted fields");
            map
        }
    }
}

fn string_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""(translation|correction|explanation)"\s*:\s*"((?:[^"\\]|\\.)*)""#)
            .expect("valid regex")
    })
}

fn suggestions_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""(?:suggestions|suggestedReplies)"\s*:\s*\[([^\]]*)"#).expect("valid regex")
    })
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("valid regex"))
}

/// Best-effort key lookup over malformed metadata.
fn extract_fields(raw: &str) -> Map<String, Value> {
    let mut map = Map::new();

    for caps in string_field_re().captures_iter(raw) {
        let key = caps[1].to_string();
        if !map.contains_key(&key) {
            map.insert(key, Value::String(unescape(&caps[2])));
        }
    }

    if let Some(caps) = suggestions_re().captures(raw) {
        let items: Vec<Value> = quoted_re()
            .captures_iter(&caps[1])
            .map(|c| Value::String(unescape(&c[1])))
            .collect();
        if !items.is_empty() {
            map.insert("suggestions".into(), Value::Array(items));
        }
    }

    map
}

fn unescape(inner: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{inner}\"")).unwrap_or_else(|_| inner.to_string())
}

/// Cuts spoken text into sentence-sized synthesis segments.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    pending: String,
}

const TERMINATORS: &[char] = &['.', '!', '?', '…', ';'];
const CLOSERS: &[char] = &['"', '\'', '”', '»', ')'];

impl SentenceChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more spoken text and take every sentence it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.pending.push_str(fragment);

        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let sentence: String = self.pending.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Take whatever is left once the reply is complete.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first complete sentence. A sentence ends at
    /// terminal punctuation (plus any closing quotes) followed by whitespace,
    /// or at a newline.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.pending.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\n' {
                if self.pending[..i].trim().is_empty() {
                    continue;
                }
                return Some(i + 1);
            }
            if !TERMINATORS.contains(&c) {
                continue;
            }
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            match chars.peek() {
                Some(&(_, next)) if next.is_whitespace() => return Some(end),
                _ => {}
            }
        }
        None
    }
}
