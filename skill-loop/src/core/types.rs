//! Shared deterministic types for the routing graph.
//!
//! A [`RoutingGraph`] is produced once by the configuration loader and is
//! read-only afterwards. Everything downstream (prompt construction, route
//! resolution, the loop controller) borrows from it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::core::runtime::Runtime;

/// Sentinel route target that ends the loop successfully.
pub const TERMINAL_MARKER: &str = "<DONE>";

/// Where a route leads: another skill, or the end of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Done,
    Skill(String),
}

impl RouteTarget {
    /// Interpret a configured target, mapping [`TERMINAL_MARKER`] to `Done`.
    pub fn parse(raw: &str) -> Self {
        if raw == TERMINAL_MARKER {
            Self::Done
        } else {
            Self::Skill(raw.to_string())
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str(TERMINAL_MARKER),
            Self::Skill(name) => f.write_str(name),
        }
    }
}

/// One ordered routing rule of a skill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Substring searched for in the step summary. `None` always matches.
    pub when: Option<String>,
    /// Guidance for the agent, rendered into the prompt only.
    pub criteria: Option<String>,
    pub target: RouteTarget,
}

impl Route {
    /// Case-sensitive containment; an absent or empty trigger matches anything.
    pub fn matches(&self, summary: &str) -> bool {
        match self.when.as_deref() {
            None | Some("") => true,
            Some(trigger) => summary.contains(trigger),
        }
    }
}

/// A named unit of work: one agent invocation plus outgoing routes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Skill {
    pub runtime: Runtime,
    pub model: Option<String>,
    pub args: Vec<String>,
    pub next: Vec<Route>,
}

/// Validated, read-only routing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingGraph {
    pub entrypoint: String,
    pub max_iterations: Option<u32>,
    pub idle_timeout: Option<Duration>,
    pub max_restarts: Option<u32>,
    pub skills: BTreeMap<String, Skill>,
}

impl RoutingGraph {
    pub fn skill(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_marker_parses_to_done() {
        assert_eq!(RouteTarget::parse("<DONE>"), RouteTarget::Done);
        assert_eq!(
            RouteTarget::parse("review"),
            RouteTarget::Skill("review".to_string())
        );
        assert_eq!(RouteTarget::Done.to_string(), TERMINAL_MARKER);
    }

    #[test]
    fn empty_trigger_matches_everything() {
        let route = Route {
            when: Some(String::new()),
            criteria: None,
            target: RouteTarget::Done,
        };
        assert!(route.matches("anything"));
        assert!(route.matches(""));
    }

    #[test]
    fn trigger_match_is_case_sensitive() {
        let route = Route {
            when: Some("<REVIEW_OK>".to_string()),
            criteria: None,
            target: RouteTarget::Done,
        };
        assert!(route.matches("all good <REVIEW_OK> ship it"));
        assert!(!route.matches("all good <review_ok>"));
    }
}
