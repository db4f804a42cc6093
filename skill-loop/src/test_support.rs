//! Test-only fakes and builders shared by unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::types::{Route, RouteTarget, RoutingGraph, Skill};
use crate::io::executor::{
    ExecError, ExecutionOptions, ExecutionRequest, ExecutionResult, SkillExecutor,
};
use crate::io::tmux::{Multiplexer, PaneState};

/// Executor that replays queued outcomes and records every request.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outcomes: RefCell<VecDeque<Result<String, ExecError>>>,
    requests: RefCell<Vec<ExecutionRequest>>,
    options: RefCell<Vec<ExecutionOptions>>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: Vec<Result<String, ExecError>>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            ..Self::default()
        }
    }

    pub fn with_summaries(summaries: &[&str]) -> Self {
        Self::new(summaries.iter().map(|s| Ok((*s).to_string())).collect())
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.borrow().clone()
    }

    pub fn options(&self) -> Vec<ExecutionOptions> {
        self.options.borrow().clone()
    }
}

impl SkillExecutor for ScriptedExecutor {
    fn execute(
        &self,
        request: &ExecutionRequest,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecError> {
        self.requests.borrow_mut().push(request.clone());
        self.options.borrow_mut().push(*options);
        let next = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("no scripted outcome left for skill {}", request.skill));
        next.map(|summary| ExecutionResult {
            summary,
            restarts: 0,
        })
    }
}

/// Route with an optional trigger; `"<DONE>"` targets the terminal marker.
pub fn route(when: Option<&str>, target: &str) -> Route {
    Route {
        when: when.map(str::to_string),
        criteria: None,
        target: RouteTarget::parse(target),
    }
}

/// Claude skill with the given routes.
pub fn skill(next: Vec<Route>) -> Skill {
    Skill {
        next,
        ..Skill::default()
    }
}

/// Unvalidated graph, so tests can build broken ones too.
pub fn graph(entrypoint: &str, skills: Vec<(&str, Skill)>) -> RoutingGraph {
    RoutingGraph {
        entrypoint: entrypoint.to_string(),
        max_iterations: None,
        idle_timeout: None,
        max_restarts: None,
        skills: skills
            .into_iter()
            .map(|(name, skill)| (name.to_string(), skill))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Launch recorded by [`FakeMultiplexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub session: String,
    pub workdir: PathBuf,
    pub shell_command: String,
}

/// In-memory multiplexer. Launched sessions start `Alive`; kills make them
/// `Absent`.
#[derive(Debug)]
pub struct FakeMultiplexer {
    available: bool,
    states: RefCell<HashMap<String, PaneState>>,
    launches: RefCell<Vec<Launch>>,
    kills: RefCell<Vec<String>>,
    attaches: RefCell<Vec<String>>,
}

impl FakeMultiplexer {
    pub const PID: u32 = 4242;

    pub fn new() -> Self {
        Self {
            available: true,
            states: RefCell::new(HashMap::new()),
            launches: RefCell::new(Vec::new()),
            kills: RefCell::new(Vec::new()),
            attaches: RefCell::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn set_state(&self, session: &str, state: PaneState) {
        self.states.borrow_mut().insert(session.to_string(), state);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.borrow().clone()
    }

    pub fn kills(&self) -> Vec<String> {
        self.kills.borrow().clone()
    }

    pub fn attaches(&self) -> Vec<String> {
        self.attaches.borrow().clone()
    }
}

impl Default for FakeMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer for FakeMultiplexer {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(anyhow!("tmux is required but not found on PATH"))
        }
    }

    fn state(&self, session: &str) -> Result<PaneState> {
        Ok(self
            .states
            .borrow()
            .get(session)
            .copied()
            .unwrap_or(PaneState::Absent))
    }

    fn launch(&self, session: &str, workdir: &Path, shell_command: &str) -> Result<()> {
        self.launches.borrow_mut().push(Launch {
            session: session.to_string(),
            workdir: workdir.to_path_buf(),
            shell_command: shell_command.to_string(),
        });
        self.set_state(session, PaneState::Alive);
        Ok(())
    }

    fn pane_pid(&self, session: &str) -> Result<u32> {
        match self.state(session)? {
            PaneState::Absent => Err(anyhow!("no session {session}")),
            _ => Ok(Self::PID),
        }
    }

    fn kill(&self, session: &str) -> Result<()> {
        self.kills.borrow_mut().push(session.to_string());
        self.set_state(session, PaneState::Absent);
        Ok(())
    }

    fn attach(&self, session: &str) -> Result<()> {
        self.attaches.borrow_mut().push(session.to_string());
        Ok(())
    }
}
