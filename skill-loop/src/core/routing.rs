//! Route resolution: first match wins.

use crate::core::types::{Route, RouteTarget};

/// Pick the next target for `summary`.
///
/// Routes are evaluated top-to-bottom; the first route whose trigger is empty
/// or contained in `summary` wins. An empty or fully non-matching route list
/// resolves to [`RouteTarget::Done`] so a misconfigured graph terminates.
pub fn resolve_next(routes: &[Route], summary: &str) -> RouteTarget {
    routes
        .iter()
        .find(|route| route.matches(summary))
        .map(|route| route.target.clone())
        .unwrap_or(RouteTarget::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(when: Option<&str>, target: &str) -> Route {
        Route {
            when: when.map(str::to_string),
            criteria: None,
            target: RouteTarget::parse(target),
        }
    }

    #[test]
    fn first_matching_trigger_wins() {
        let routes = vec![route(Some("<REVIEW_OK>"), "<DONE>"), route(None, "impl")];

        assert_eq!(
            resolve_next(&routes, "all good <REVIEW_OK>"),
            RouteTarget::Done
        );
        assert_eq!(
            resolve_next(&routes, "needs work"),
            RouteTarget::Skill("impl".to_string())
        );
    }

    #[test]
    fn default_route_shadows_later_routes() {
        let routes = vec![route(None, "impl"), route(Some("<REVIEW_OK>"), "<DONE>")];
        assert_eq!(
            resolve_next(&routes, "<REVIEW_OK>"),
            RouteTarget::Skill("impl".to_string())
        );
    }

    #[test]
    fn empty_routes_terminate() {
        assert_eq!(resolve_next(&[], "anything"), RouteTarget::Done);
    }

    #[test]
    fn non_matching_routes_terminate() {
        let routes = vec![route(Some("<A>"), "a"), route(Some("<B>"), "b")];
        assert_eq!(resolve_next(&routes, "neither marker"), RouteTarget::Done);
    }

    #[test]
    fn trigger_found_anywhere_in_summary() {
        let routes = vec![route(Some("<B>"), "b"), route(Some("<A>"), "a")];
        assert_eq!(
            resolve_next(&routes, "line one\n<A> and later <B>"),
            RouteTarget::Skill("b".to_string())
        );
    }
}
