//! Markup scrubbing for event payloads.
//!
//! Every string inside `data` (at any depth) has script blocks, stray
//! `<script>` tags, `on*=` handler attributes and executable URI schemes
//! removed. Object keys are left alone. Patterns are applied until the
//! string stops changing, so nested tricks like `<scr<script>ipt>` don't
//! survive a single pass.
//!
//! Sanitization never fails: if the pattern set can't be built every string
//! degrades to `""`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::event::RealtimeEvent;

const MAX_PASSES: usize = 8;

struct Patterns {
    script_block: Regex,
    script_tag: Regex,
    open_tag: Regex,
    handler_attr: Regex,
    unsafe_uri: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            script_block: Regex::new(r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>")?,
            script_tag: Regex::new(r"(?i)<\s*/?\s*script\b[^>]*>")?,
            // Quoted values may contain `>`; an unterminated quote falls back to `[^>]`.
            open_tag: Regex::new(r#"(?s)<[a-zA-Z](?:"[^"]*"|'[^']*'|[^>])*>"#)?,
            // Browsers split attributes on `/` and after a closing quote too.
            handler_attr: Regex::new(
                r#"(?i)(?:[\s/]+|(["']))on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
            )?,
            unsafe_uri: Regex::new(r"(?i)(?:javascript|vbscript)\s*:|data\s*:\s*text/html")?,
        })
    }

    fn build() -> Option<Self> {
        match Self::compile() {
            Ok(patterns) => Some(patterns),
            Err(e) => {
                log::error!("sanitizer patterns failed to compile: {}", e);
                None
            }
        }
    }

    fn scrub_once(&self, input: &str) -> String {
        let out = self.script_block.replace_all(input, "");
        let out = self.script_tag.replace_all(&out, "");
        let out = self
            .open_tag
            .replace_all(&out, |caps: &Captures| {
                self.handler_attr.replace_all(&caps[0], "${1}").into_owned()
            });
        self.unsafe_uri.replace_all(&out, "").into_owned()
    }
}

static PATTERNS: Lazy<Option<Patterns>> = Lazy::new(Patterns::build);

/// Scrub a single string.
pub fn sanitize_str(input: &str) -> String {
    let Some(patterns) = PATTERNS.as_ref() else {
        return String::new();
    };
    let mut current = input.to_string();
    for _ in 0..MAX_PASSES {
        let next = patterns.scrub_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
    // Still changing after MAX_PASSES: one more pass, then give up.
    let last = patterns.scrub_once(&current);
    if last == current {
        last
    } else {
        String::new()
    }
}

/// Scrub every string leaf of a JSON value, returning a new value.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Copy of `event` with its `data` scrubbed.
pub fn sanitize(event: &RealtimeEvent) -> RealtimeEvent {
    RealtimeEvent {
        data: sanitize_value(&event.data),
        ..event.clone()
    }
}
