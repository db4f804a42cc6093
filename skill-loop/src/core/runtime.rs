//! Closed set of supported agent CLIs and their command templates.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A program plus its argument vector, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Agent CLI used to execute a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Runtime {
    #[default]
    Claude,
    Codex,
    Opencode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported agent runtime {0:?} (supported: claude, codex, opencode)")]
pub struct UnknownRuntime(pub String);

impl Runtime {
    pub const ALL: [Runtime; 3] = [Runtime::Claude, Runtime::Codex, Runtime::Opencode];

    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::Claude => "claude",
            Runtime::Codex => "codex",
            Runtime::Opencode => "opencode",
        }
    }

    /// Build the invocation: program, prompt-bearing args, optional model,
    /// then pass-through extra args.
    pub fn command(self, model: Option<&str>, extra_args: &[String], prompt: &str) -> CommandSpec {
        let mut args = match self {
            Runtime::Claude => vec!["-p".to_string(), prompt.to_string()],
            Runtime::Codex => vec!["exec".to_string(), prompt.to_string()],
            Runtime::Opencode => vec!["run".to_string(), prompt.to_string()],
        };
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.extend(extra_args.iter().cloned());
        CommandSpec {
            program: self.as_str().to_string(),
            args,
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = UnknownRuntime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Runtime::ALL
            .into_iter()
            .find(|runtime| runtime.as_str() == s)
            .ok_or_else(|| UnknownRuntime(s.to_string()))
    }
}
