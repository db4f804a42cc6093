//! Routing configuration stored in `skill-loop.toml`.
//!
//! The raw TOML shape is deserialized with serde, then validated once into a
//! [`RoutingGraph`]. Nothing downstream re-parses the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::runtime::{Runtime, UnknownRuntime};
use crate::core::types::{Route, RouteTarget, RoutingGraph, Skill, TERMINAL_MARKER};

/// Config file looked up in the current directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "skill-loop.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("skill {skill:?} has an invalid agent runtime")]
    Runtime {
        skill: String,
        #[source]
        source: UnknownRuntime,
    },
}

/// Raw routing rule as written in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Substring to match in the previous summary. Omitted means "always".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Judgment criteria rendered into the agent prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    /// Target skill name or `<DONE>`.
    pub skill: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// `claude`, `codex` or `opencode`. Defaults to `claude`.
    pub runtime: Option<String>,
    pub model: Option<String>,
    /// Extra CLI arguments passed through to the agent.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    /// Routes evaluated top-to-bottom.
    #[serde(default)]
    pub next: Vec<RouteConfig>,
}

/// Top-level `skill-loop.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopConfig {
    pub default_entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub skills: BTreeMap<String, SkillConfig>,
}

impl LoopConfig {
    /// Validate and convert into the read-only routing graph.
    pub fn into_graph(self) -> Result<RoutingGraph, ConfigError> {
        if self.default_entrypoint.trim().is_empty() {
            return Err(ConfigError::Invalid("default_entrypoint is required".into()));
        }
        if self.skills.is_empty() {
            return Err(ConfigError::Invalid("at least one skill is required".into()));
        }
        if !self.skills.contains_key(&self.default_entrypoint) {
            return Err(ConfigError::Invalid(format!(
                "entrypoint {:?} not found in skills",
                self.default_entrypoint
            )));
        }
        if self.max_iterations == Some(0) {
            return Err(ConfigError::Invalid("max_iterations must be > 0".into()));
        }
        if self.idle_timeout_seconds == Some(0) {
            return Err(ConfigError::Invalid("idle_timeout_seconds must be > 0".into()));
        }

        let mut skills = BTreeMap::new();
        for (name, skill) in &self.skills {
            let runtime = match skill.agent.runtime.as_deref() {
                None | Some("") => Runtime::default(),
                Some(raw) => raw.parse().map_err(|source| ConfigError::Runtime {
                    skill: name.clone(),
                    source,
                })?,
            };

            let mut next = Vec::with_capacity(skill.next.len());
            for (i, route) in skill.next.iter().enumerate() {
                if route.skill.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "skill {name:?}: route[{i}] has empty skill target"
                    )));
                }
                if route.skill != TERMINAL_MARKER && !self.skills.contains_key(&route.skill) {
                    return Err(ConfigError::Invalid(format!(
                        "skill {name:?}: route[{i}] references unknown skill {:?}",
                        route.skill
                    )));
                }
                next.push(Route {
                    when: route.when.clone().filter(|w| !w.is_empty()),
                    criteria: route.criteria.clone().filter(|c| !c.is_empty()),
                    target: RouteTarget::parse(&route.skill),
                });
            }

            skills.insert(
                name.clone(),
                Skill {
                    runtime,
                    model: skill.agent.model.clone().filter(|m| !m.is_empty()),
                    args: skill.agent.args.clone(),
                    next,
                },
            );
        }

        Ok(RoutingGraph {
            entrypoint: self.default_entrypoint,
            max_iterations: self.max_iterations,
            idle_timeout: self.idle_timeout_seconds.map(Duration::from_secs),
            max_restarts: self.max_restarts,
            skills,
        })
    }
}

/// Parse and validate a routing graph from TOML text.
pub fn parse_graph(path: &Path, contents: &str) -> Result<RoutingGraph, ConfigError> {
    let cfg: LoopConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.into_graph()
}

/// Load and validate a routing graph from a TOML file.
pub fn load_graph(path: &Path) -> Result<RoutingGraph, ConfigError> {
    debug!(path = %path.display(), "loading routing config");
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let graph = parse_graph(path, &contents)?;
    debug!(
        entrypoint = %graph.entrypoint,
        skills = graph.skills.len(),
        "routing config loaded"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
default_entrypoint = "impl"

[skills.impl]
agent = { runtime = "claude", model = "sonnet" }
next = [
  { when = "<CONTINUE>", criteria = "more work is needed", skill = "impl" },
  { when = "<IMPL_DONE>", criteria = "implementation finished", skill = "review" },
]

[skills.review]
next = [
  { when = "<REVIEW_OK>", criteria = "quality bar met", skill = "<DONE>" },
  { criteria = "needs improvement", skill = "impl" },
]
"#;

    fn parse(contents: &str) -> Result<RoutingGraph, ConfigError> {
        parse_graph(Path::new("skill-loop.toml"), contents)
    }

    #[test]
    fn parses_valid_config() {
        let graph = parse(VALID).expect("parse");
        assert_eq!(graph.entrypoint, "impl");
        assert_eq!(graph.skills.len(), 2);
        assert_eq!(graph.max_iterations, None);
        assert_eq!(graph.idle_timeout, None);

        let implement = graph.skill("impl").expect("impl");
        assert_eq!(implement.runtime, Runtime::Claude);
        assert_eq!(implement.model.as_deref(), Some("sonnet"));
        assert_eq!(implement.next[1].when.as_deref(), Some("<IMPL_DONE>"));
        assert_eq!(
            implement.next[1].target,
            RouteTarget::Skill("review".to_string())
        );

        let review = graph.skill("review").expect("review");
        assert_eq!(review.runtime, Runtime::Claude);
        assert_eq!(review.model, None);
        assert_eq!(review.next[0].target, RouteTarget::Done);
        assert_eq!(review.next[1].when, None);
        assert_eq!(review.next[1].criteria.as_deref(), Some("needs improvement"));
    }

    #[test]
    fn reads_limits() {
        let contents = format!(
            "max_iterations = 7\nidle_timeout_seconds = 30\nmax_restarts = 0\n{VALID}"
        );
        let graph = parse(&contents).expect("parse");
        assert_eq!(graph.max_iterations, Some(7));
        assert_eq!(graph.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(graph.max_restarts, Some(0));
    }

    #[test]
    fn rejects_negative_max_restarts() {
        let contents = format!("max_restarts = -1\n{VALID}");
        let err = parse(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_unknown_runtime() {
        let contents = r#"
default_entrypoint = "a"
[skills.a]
agent = { runtime = "unknown" }
next = [{ skill = "<DONE>" }]
"#;
        let err = parse(contents).unwrap_err();
        assert!(err.to_string().contains("\"a\""));
        match err {
            ConfigError::Runtime { skill, source } => {
                assert_eq!(skill, "a");
                assert!(source.to_string().contains("unsupported agent runtime"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_route_target() {
        let contents = r#"
default_entrypoint = "a"
[skills.a]
next = [{ skill = "missing" }]
"#;
        let err = parse(contents).unwrap_err();
        assert!(err.to_string().contains("unknown skill \"missing\""));
    }

    #[test]
    fn rejects_missing_entrypoint_skill() {
        let contents = r#"
default_entrypoint = "ghost"
[skills.a]
next = [{ skill = "<DONE>" }]
"#;
        let err = parse(contents).unwrap_err();
        assert!(err.to_string().contains("entrypoint \"ghost\" not found"));
    }

    #[test]
    fn rejects_empty_skills_and_zero_limits() {
        let err = parse("default_entrypoint = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("at least one skill"));

        let contents = format!("max_iterations = 0\n{VALID}");
        let err = parse(&contents).unwrap_err();
        assert!(err.to_string().contains("max_iterations must be > 0"));
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_graph(&temp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, VALID).expect("write");
        let graph = load_graph(&path).expect("load");
        assert!(graph.contains("review"));
    }
}
