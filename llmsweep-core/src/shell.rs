//! Shell command rendering.
//!
//! Every command reaches a target as a single `sh -c` string, whether it runs
//! locally or through SSH, so arguments are quoted here once.

use crate::config::Secret;

/// A program invocation with environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, Secret)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `--flag value`.
    pub fn flag(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    /// Append `--flag value` when a value is present.
    pub fn flag_opt<T: ToString>(self, flag: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.flag(flag, v),
            None => self,
        }
    }

    /// Append a bare `--flag` when `enabled`.
    pub fn switch(self, flag: &str, enabled: bool) -> Self {
        if enabled { self.arg(flag) } else { self }
    }

    pub fn env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.env.push((key.into(), value));
        self
    }

    /// Append pass-through options. Keys become `--kebab-case` flags; `true`
    /// adds a bare flag, `false` and `null` add nothing.
    pub fn extra_args<'a, I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a serde_json::Value)>,
    {
        for (key, value) in extra {
            let flag = format!("--{}", key.trim_start_matches('-').replace('_', "-"));
            match value {
                serde_json::Value::Bool(true) => self = self.arg(flag),
                serde_json::Value::Bool(false) | serde_json::Value::Null => {}
                serde_json::Value::String(s) => self = self.arg(flag).arg(s.clone()),
                other => self = self.arg(flag).arg(other.to_string()),
            }
        }
        self
    }

    /// Render as a shell string. Environment overrides go through `env` so
    /// the result also works after `exec`, `nohup` or `setsid`.
    pub fn to_shell(&self) -> String {
        self.render(|secret| quote(secret.expose()))
    }

    /// Render for logs with environment values masked.
    pub fn redacted(&self) -> String {
        self.render(|_| "***".to_string())
    }

    fn render(&self, env_value: impl Fn(&Secret) -> String) -> String {
        let mut parts = Vec::with_capacity(self.env.len() + self.args.len() + 2);
        if !self.env.is_empty() {
            parts.push("env".to_string());
        }
        for (key, value) in &self.env {
            parts.push(format!("{key}={}", env_value(value)));
        }
        parts.push(quote(&self.program));
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Environment variable names whose values never reach logs.
const SECRET_NAME_SUFFIXES: [&str; 5] = ["TOKEN", "KEY", "SECRET", "PASSWORD", "SSHPASS"];

/// Mask the values of `NAME=value` assignments whose name looks like a
/// credential (`HF_TOKEN`, `RUNPOD_API_KEY`, ...). Quoted values are masked
/// whole.
pub fn redact_secrets(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut rest = command;
    while let Some(eq) = rest.find('=') {
        let (head, tail) = rest.split_at(eq);
        let name_len: usize = head
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .map(char::len_utf8)
            .sum();
        let name = &head[head.len() - name_len..];
        out.push_str(head);
        out.push('=');
        let value = &tail[1..];
        if is_secret_name(name) {
            out.push_str("***");
            rest = &value[assignment_value_len(value)..];
        } else {
            rest = value;
        }
    }
    out.push_str(rest);
    out
}

fn is_secret_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    !upper.is_empty() && SECRET_NAME_SUFFIXES.iter().any(|s| upper.ends_with(s))
}

/// Byte length of a shell word starting at `value`, honouring single quotes
/// and backslash escapes.
fn assignment_value_len(value: &str) -> usize {
    let mut in_quote = false;
    let mut escaped = false;
    for (idx, c) in value.char_indices() {
        if escaped {
            escaped = false;
        } else if in_quote {
            in_quote = c != '\'';
        } else if c == '\'' {
            in_quote = true;
        } else if c == '\\' {
            escaped = true;
        } else if c.is_whitespace() || ";&|)".contains(c) {
            return idx;
        }
    }
    value.len()
}

/// Quote a word for POSIX `sh`. Plain words are left untouched; a leading
/// `~/` is kept outside the quotes so the remote shell still expands it.
pub fn quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    if word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        return word.to_string();
    }
    if let Some(rest) = word.strip_prefix("~/") {
        return format!("~/{}", quote(rest));
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn test_quote() {
        assert_eq!(quote("vllm"), "vllm");
        assert_eq!(quote("/models/Qwen2.5-7B"), "/models/Qwen2.5-7B");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("~/.venv dir"), "~/'.venv dir'");
    }

    #[test]
    fn test_render_and_redact() {
        let cmd = CommandSpec::new("vllm")
            .arg("serve")
            .flag("--port", 8000)
            .switch("--enforce-eager", true)
            .switch("--trust-remote-code", false)
            .flag_opt::<u32>("--max-num-seqs", None)
            .env("HF_TOKEN", Secret::new("hf_abc"));
        assert_eq!(
            cmd.to_shell(),
            "env HF_TOKEN=hf_abc vllm serve --port 8000 --enforce-eager"
        );
        assert_eq!(cmd.redacted(), "env HF_TOKEN=*** vllm serve --port 8000 --enforce-eager");
        assert!(!format!("{cmd}").contains("hf_abc"));
    }

    #[test]
    fn test_redact_secrets_in_rendered_commands() {
        let cmd = CommandSpec::new("vllm")
            .arg("serve")
            .env("HF_TOKEN", Secret::new("hf_SUPERSECRET123"))
            .env("RUNPOD_API_KEY", Secret::new("it's secret"));
        let script = format!("cd /tmp && nohup setsid {} > server.log 2>&1 &", cmd.to_shell());
        let redacted = redact_secrets(&script);
        assert_eq!(
            redacted,
            "cd /tmp && nohup setsid env HF_TOKEN=*** RUNPOD_API_KEY=*** vllm serve > server.log 2>&1 &"
        );
    }

    #[test]
    fn test_redact_secrets_keeps_other_assignments() {
        assert_eq!(
            redact_secrets("env CUDA_VISIBLE_DEVICES=0,1 --max-model-len=8192 true"),
            "env CUDA_VISIBLE_DEVICES=0,1 --max-model-len=8192 true"
        );
        assert_eq!(redact_secrets("export SSHPASS=pw; ssh host"), "export SSHPASS=***; ssh host");
        assert_eq!(redact_secrets("a = b"), "a = b");
    }

    #[test]
    fn test_extra_args() {
        let mut extra = BTreeMap::new();
        extra.insert("enable_prefix_caching".to_string(), serde_json::json!(true));
        extra.insert("enforce-eager".to_string(), serde_json::json!(false));
        extra.insert("kv_cache_dtype".to_string(), serde_json::json!("fp8"));
        extra.insert("swap_space".to_string(), serde_json::json!(4));
        let cmd = CommandSpec::new("x").extra_args(&extra);
        assert_eq!(
            cmd.args,
            vec![
                "--enable-prefix-caching",
                "--kv-cache-dtype",
                "fp8",
                "--swap-space",
                "4"
            ]
        );
    }
}
