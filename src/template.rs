//! fallbranch/src/template.rs
//! Placeholder substitution for `server-not-found-message` and
//! `dial-timeout-message`. Unknown `{placeholder}` tokens pass through
//! literally rather than being treated as an error, so an operator typo
//! degrades gracefully instead of breaking the disconnect message.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct TemplateContext {
    values: HashMap<&'static str, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        TemplateContext {
            values: HashMap::new(),
        }
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces every `{key}` in `template` with its bound value. A `{key}` with
/// no binding in `ctx` is left untouched, braces and all.
pub fn render(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let key = &template[i + 1..i + end];
                if let Some(value) = ctx.values.get(key) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// The `currentTime` placeholder value: milliseconds since the Unix epoch,
/// formatted as a decimal string. No wall-clock/timezone library is pulled in
/// just for a disconnect message.
pub fn current_time() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let ctx = TemplateContext::new()
            .set("username", "Notch")
            .set("requestedAddress", "play.example.com");
        let rendered = render("Hello {username}, {requestedAddress} is offline.", &ctx);
        assert_eq!(rendered, "Hello Notch, play.example.com is offline.");
    }

    #[test]
    fn leaves_unknown_placeholders_literal() {
        let ctx = TemplateContext::new().set("username", "Notch");
        let rendered = render("Hi {username}, code {errorCode}", &ctx);
        assert_eq!(rendered, "Hi Notch, code {errorCode}");
    }

    #[test]
    fn passes_through_plain_text() {
        let ctx = TemplateContext::new();
        assert_eq!(render("no placeholders here", &ctx), "no placeholders here");
    }

    #[test]
    fn handles_unclosed_brace() {
        let ctx = TemplateContext::new().set("username", "Notch");
        assert_eq!(render("broken {username", &ctx), "broken {username");
    }

    #[test]
    fn current_time_is_a_positive_integer() {
        let millis: u128 = current_time().parse().unwrap();
        assert!(millis > 0);
    }
}
