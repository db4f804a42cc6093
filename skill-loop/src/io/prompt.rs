//! Prompt construction for a single skill invocation.
//!
//! The prompt body is a minijinja template; the routing instruction fragment is
//! assembled here so its exact shape stays under test.

use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::Route;

const SKILL_TEMPLATE: &str = include_str!("prompts/skill.md");

/// Render the status-marker lines for `routes`.
///
/// Returns an empty list when no route carries a trigger or guidance. Triggers
/// are quoted verbatim in declaration order; a route without a trigger is
/// rendered as `Otherwise: <guidance>`; a route with neither contributes nothing.
pub fn route_instruction_lines(routes: &[Route]) -> Vec<String> {
    let has_criteria = routes
        .iter()
        .any(|r| r.when.is_some() || r.criteria.is_some());
    if !has_criteria {
        return Vec::new();
    }

    routes
        .iter()
        .filter_map(|route| match (route.when.as_deref(), route.criteria.as_deref()) {
            (Some(when), Some(criteria)) => Some(format!("{when:?}: {criteria}")),
            (Some(when), None) => Some(format!("{when:?}")),
            (None, Some(criteria)) => Some(format!("Otherwise: {criteria}")),
            (None, None) => None,
        })
        .collect()
}

/// Render the full prompt for `skill`.
pub fn render_skill_prompt(
    skill: &str,
    previous_summary: &str,
    routes: &[Route],
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);

    let previous = previous_summary.trim();
    let lines = route_instruction_lines(routes);
    let rendered = env.render_str(
        SKILL_TEMPLATE,
        context! {
            skill => skill,
            previous => (!previous.is_empty()).then_some(previous),
            routes => lines,
        },
    )?;
    debug!(skill, bytes = rendered.len(), "rendered skill prompt");
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RouteTarget;

    fn route(when: Option<&str>, criteria: Option<&str>, target: &str) -> Route {
        Route {
            when: when.map(str::to_string),
            criteria: criteria.map(str::to_string),
            target: RouteTarget::parse(target),
        }
    }

    #[test]
    fn no_instruction_without_triggers_or_guidance() {
        let routes = vec![route(None, None, "impl")];
        assert!(route_instruction_lines(&routes).is_empty());
        assert!(route_instruction_lines(&[]).is_empty());
    }

    #[test]
    fn instruction_lines_follow_declaration_order() {
        let routes = vec![
            route(Some("<REVIEW_OK>"), Some("quality bar met"), "<DONE>"),
            route(Some("<BLOCKED>"), None, "triage"),
            route(None, None, "ignored"),
            route(None, Some("needs improvement"), "impl"),
        ];
        assert_eq!(
            route_instruction_lines(&routes),
            vec![
                "\"<REVIEW_OK>\": quality bar met".to_string(),
                "\"<BLOCKED>\"".to_string(),
                "Otherwise: needs improvement".to_string(),
            ]
        );
    }

    #[test]
    fn prompt_includes_invocation_and_previous_output() {
        let prompt = render_skill_prompt("impl", "  last summary \n", &[]).expect("render");
        assert!(prompt.starts_with("/impl\n"));
        assert!(prompt.contains("Do not output your reasoning in stdout."));
        assert!(prompt.contains("Previous skill output:\nlast summary"));
        assert!(!prompt.contains("status marker"));
    }

    #[test]
    fn prompt_omits_empty_previous_output() {
        let prompt = render_skill_prompt("review", "", &[]).expect("render");
        assert!(!prompt.contains("Previous skill output"));
    }

    #[test]
    fn prompt_renders_markers_unescaped() {
        let routes = vec![
            route(Some("<REVIEW_OK>"), Some("ship it"), "<DONE>"),
            route(None, Some("keep going"), "impl"),
        ];
        let prompt = render_skill_prompt("review", "done impl", &routes).expect("render");
        let marker = prompt
            .find("- \"<REVIEW_OK>\": ship it")
            .expect("trigger line");
        let otherwise = prompt.find("- Otherwise: keep going").expect("default line");
        assert!(marker < otherwise);
        assert!(prompt.contains("appropriate status marker on the first line"));
    }
}
