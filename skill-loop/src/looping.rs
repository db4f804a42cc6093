//! Loop controller: drives the routing state machine for `skill-loop run`.
//!
//! Each iteration executes the current skill, then resolves the next skill from
//! the first route whose trigger is contained in the step's summary. The loop
//! ends successfully on the terminal marker and fails on any executor error or
//! when the iteration budget runs out.

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::routing::resolve_next;
use crate::core::types::{RouteTarget, RoutingGraph};
use crate::io::executor::{ExecError, ExecutionOptions, ExecutionRequest, SkillExecutor};

/// Iteration cap used when neither the caller nor the graph sets one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Caller overrides for one loop run.
#[derive(Debug, Clone, Default)]
pub struct LoopConfig {
    /// Starting skill; falls back to the graph's entrypoint.
    pub entrypoint: Option<String>,
    /// Iteration cap; falls back to the graph value, then [`DEFAULT_MAX_ITERATIONS`].
    pub max_iterations: Option<u32>,
    /// Seed prompt handed to the first step in place of a previous summary.
    pub prompt: String,
}

/// Progress notifications emitted to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    StepStarted {
        iteration: u32,
        skill: String,
    },
    StepFinished {
        iteration: u32,
        skill: String,
        summary: String,
        restarts: u32,
        next: RouteTarget,
    },
}

/// Summary of a successful loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub steps_executed: u32,
    pub last_skill: String,
    pub last_summary: String,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("entrypoint {0:?} is not a configured skill")]
    UnknownEntrypoint(String),
    #[error("skill {from:?} routed to unknown skill {next:?}")]
    UnknownSkill { from: String, next: String },
    #[error("skill {skill:?} failed at iteration {iteration}")]
    Step {
        skill: String,
        iteration: u32,
        #[source]
        source: ExecError,
    },
    #[error("reached max iterations ({max_iterations}) without a terminal route")]
    IterationBudgetExceeded { max_iterations: u32 },
}

impl LoopConfig {
    fn resolve_max_iterations(&self, graph: &RoutingGraph) -> u32 {
        self.max_iterations
            .filter(|max| *max > 0)
            .or(graph.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
    }
}

/// Run skills until a route resolves to the terminal marker.
///
/// Steps run strictly one after another. `on_event` is called before and after
/// every step.
#[instrument(
    skip_all,
    fields(entrypoint = config.entrypoint.as_deref().unwrap_or(&graph.entrypoint))
)]
pub fn run_loop<E: SkillExecutor, F: FnMut(&LoopEvent)>(
    graph: &RoutingGraph,
    executor: &E,
    config: &LoopConfig,
    mut on_event: F,
) -> Result<LoopOutcome, LoopError> {
    let mut current = config
        .entrypoint
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| graph.entrypoint.clone());
    if !graph.contains(&current) {
        return Err(LoopError::UnknownEntrypoint(current));
    }

    let max_iterations = config.resolve_max_iterations(graph);
    let options = ExecutionOptions::new(graph.idle_timeout, graph.max_restarts);
    let mut previous = config.prompt.clone();
    debug!(max_iterations, idle_timeout_secs = options.idle_timeout.as_secs(), "starting loop");

    for iteration in 1..=max_iterations {
        let skill = graph
            .skill(&current)
            .ok_or_else(|| LoopError::UnknownEntrypoint(current.clone()))?;
        on_event(&LoopEvent::StepStarted {
            iteration,
            skill: current.clone(),
        });

        let request = ExecutionRequest {
            skill: current.clone(),
            runtime: skill.runtime,
            model: skill.model.clone(),
            extra_args: skill.args.clone(),
            previous_summary: previous,
            routes: skill.next.clone(),
        };
        let result = executor
            .execute(&request, &options)
            .map_err(|source| LoopError::Step {
                skill: current.clone(),
                iteration,
                source,
            })?;

        let next = resolve_next(&skill.next, &result.summary);
        info!(
            iteration,
            skill = %current,
            next = %next,
            restarts = result.restarts,
            "step finished"
        );
        on_event(&LoopEvent::StepFinished {
            iteration,
            skill: current.clone(),
            summary: result.summary.clone(),
            restarts: result.restarts,
            next: next.clone(),
        });

        match next {
            RouteTarget::Done => {
                return Ok(LoopOutcome {
                    steps_executed: iteration,
                    last_skill: current,
                    last_summary: result.summary,
                });
            }
            RouteTarget::Skill(name) => {
                if !graph.contains(&name) {
                    return Err(LoopError::UnknownSkill {
                        from: current,
                        next: name,
                    });
                }
                current = name;
                previous = result.summary;
            }
        }
    }

    Err(LoopError::IterationBudgetExceeded { max_iterations })
}
