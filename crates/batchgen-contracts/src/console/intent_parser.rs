use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{CommandSpec, COMMANDS};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }

    /// Positional argument as a trimmed, non-empty string.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn find_spec(command: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.command == command)
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

/// Peels `count` whitespace-separated words off the front and returns the rest verbatim.
fn split_leading_words(arg: &str, count: usize) -> (Vec<String>, String) {
    let mut words = Vec::new();
    let mut rest = arg.trim_start();
    while words.len() < count && !rest.is_empty() {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        words.push(rest[..end].to_string());
        rest = rest[end..].trim_start();
    }
    (words, rest.trim_end().to_string())
}

fn bind_args(intent: &mut Intent, spec: &CommandSpec, arg: &str) {
    if spec.args.is_empty() {
        return;
    }
    let values = if spec.rest {
        let (mut words, rest) = split_leading_words(arg, spec.args.len() - 1);
        if !rest.is_empty() {
            words.push(rest);
        }
        words
    } else {
        let mut parts = split_args(arg);
        if parts.len() > spec.args.len() {
            let tail = parts.split_off(spec.args.len() - 1).join(" ");
            parts.push(tail);
        }
        parts
    };
    for (key, value) in spec.args.iter().zip(values) {
        intent
            .command_args
            .insert((*key).to_string(), Value::String(value));
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command) {
                let mut intent = Intent::new(spec.action, text);
                bind_args(&mut intent, spec, arg);
                if spec.action == "regenerate" {
                    intent.prompt = intent.arg("prompt").map(str::to_string);
                }
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("regenerate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
