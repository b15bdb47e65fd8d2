//! Deterministic workflow resolver.
//!
//! The `WorkflowEngine` validates a step DAG, orders it, and answers "which
//! step runs next" from a task's execution state. It holds no state of its
//! own; the driving loop owns the `WorkflowExecutionState`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult, WorkflowIssue, WorkflowValidationError};
use crate::domain::models::{StepStatus, WorkflowDefinition, WorkflowExecutionState, WorkflowStep};

/// Adjacency map: step id -> ids it depends on, in declaration order.
type DependencyGraph<'a> = HashMap<&'a str, Vec<&'a str>>;

fn dependency_graph(def: &WorkflowDefinition) -> DependencyGraph<'_> {
    let mut graph: DependencyGraph<'_> = HashMap::new();
    for step in &def.steps {
        graph
            .entry(step.id.as_str())
            .or_default()
            .extend(step.depends_on.iter().map(String::as_str));
    }
    graph
}

// Standalone helper for cycle detection; records every back edge as a cycle path.
fn collect_cycles<'a>(
    node: &'a str,
    graph: &DependencyGraph<'a>,
    visited: &mut HashSet<&'a str>,
    in_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node);
    in_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !graph.contains_key(neighbor) {
                // Dangling reference, reported separately.
                continue;
            }
            if in_stack.contains(neighbor) {
                if let Some(start) = path.iter().position(|&id| id == neighbor) {
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|id| (*id).to_string()).collect();
                    cycle.push(neighbor.to_string());
                    cycles.push(cycle);
                }
            } else if !visited.contains(neighbor) {
                collect_cycles(neighbor, graph, visited, in_stack, path, cycles);
            }
        }
    }

    in_stack.remove(node);
    path.pop();
}

// Postorder DFS over dependency edges. Tolerates cycles and dangling
// references (they are simply not followed twice / at all).
fn visit_postorder<'a>(
    step: &'a WorkflowStep,
    by_id: &HashMap<&str, &'a WorkflowStep>,
    visited: &mut HashSet<&'a str>,
    order: &mut Vec<&'a WorkflowStep>,
) {
    if !visited.insert(step.id.as_str()) {
        return;
    }
    for dep in &step.depends_on {
        if let Some(dep_step) = by_id.get(dep.as_str()) {
            visit_postorder(dep_step, by_id, visited, order);
        }
    }
    order.push(step);
}

/// Stateless resolver over workflow definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowEngine;

impl WorkflowEngine {
    pub fn new() -> Self {
        Self
    }

    /// Check the structural invariants of a definition.
    ///
    /// Collects every issue rather than stopping at the first: empty step
    /// list, duplicate ids, unknown dependencies, and each dependency cycle.
    pub fn validate(&self, def: &WorkflowDefinition) -> Result<(), WorkflowValidationError> {
        let mut issues = Vec::new();

        if def.steps.is_empty() {
            issues.push(WorkflowIssue::NoSteps);
        }

        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for step in &def.steps {
            if !seen.insert(step.id.as_str()) && reported.insert(step.id.as_str()) {
                issues.push(WorkflowIssue::DuplicateStep(step.id.clone()));
            }
        }

        for step in &def.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    issues.push(WorkflowIssue::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = dependency_graph(def);
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();
        for step in &def.steps {
            if !visited.contains(step.id.as_str()) {
                collect_cycles(
                    step.id.as_str(),
                    &graph,
                    &mut visited,
                    &mut in_stack,
                    &mut path,
                    &mut cycles,
                );
            }
        }
        issues.extend(cycles.into_iter().map(WorkflowIssue::Cycle));

        if issues.is_empty() {
            Ok(())
        } else {
            Err(WorkflowValidationError {
                workflow_id: def.id.clone(),
                issues,
            })
        }
    }

    /// Dependency order: every step appears after all of its dependencies.
    ///
    /// Deterministic for a given definition (declaration order breaks ties).
    pub fn topological_sort<'a>(
        &self,
        def: &'a WorkflowDefinition,
    ) -> Result<Vec<&'a WorkflowStep>, WorkflowValidationError> {
        self.validate(def)?;
        Ok(Self::postorder(def))
    }

    /// Fresh execution state: every step pending, nothing current.
    pub fn init_execution_state(
        &self,
        def: &WorkflowDefinition,
        task_id: &str,
    ) -> WorkflowExecutionState {
        WorkflowExecutionState {
            workflow_id: def.id.clone(),
            task_id: task_id.to_string(),
            step_states: def
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepStatus::Pending))
                .collect(),
            current_step_id: None,
        }
    }

    /// First pending step (in dependency order) whose dependencies are all done.
    ///
    /// A skipped dependency counts as satisfied, the same way `is_complete`
    /// treats it.
    pub fn get_next_step<'a>(
        &self,
        def: &'a WorkflowDefinition,
        state: &WorkflowExecutionState,
    ) -> Option<&'a WorkflowStep> {
        Self::postorder(def).into_iter().find(|step| {
            state.status(&step.id) == Some(StepStatus::Pending)
                && step
                    .depends_on
                    .iter()
                    .all(|dep| state.status(dep).is_some_and(|s| s.is_done()))
        })
    }

    /// Every step is completed or skipped.
    pub fn is_complete(&self, state: &WorkflowExecutionState) -> bool {
        state.step_states.values().all(StepStatus::is_done)
    }

    /// Forward progress is impossible without outside intervention.
    pub fn is_stuck(&self, def: &WorkflowDefinition, state: &WorkflowExecutionState) -> bool {
        if self.is_complete(state) {
            return false;
        }
        let current_running = state
            .current_step_id
            .as_deref()
            .and_then(|id| state.status(id))
            == Some(StepStatus::InProgress);
        !current_running && self.get_next_step(def, state).is_none()
    }

    fn postorder(def: &WorkflowDefinition) -> Vec<&WorkflowStep> {
        let by_id: HashMap<&str, &WorkflowStep> =
            def.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(def.steps.len());
        for step in &def.steps {
            visit_postorder(step, &by_id, &mut visited, &mut order);
        }
        order
    }
}

/// Load a project's workflow override file.
///
/// - missing file: the built-in default pipeline
/// - unreadable or malformed JSON: the default, with a warning
/// - well-formed but structurally invalid: `DomainError::InvalidWorkflow`
pub async fn load_workflow(path: &Path) -> DomainResult<WorkflowDefinition> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WorkflowDefinition::default_pipeline());
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable workflow file, using default");
            return Ok(WorkflowDefinition::default_pipeline());
        }
    };

    let def: WorkflowDefinition = match serde_json::from_str(&contents) {
        Ok(def) => def,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed workflow file, using default");
            return Ok(WorkflowDefinition::default_pipeline());
        }
    };

    WorkflowEngine::new()
        .validate(&def)
        .map_err(DomainError::InvalidWorkflow)?;

    info!(
        path = %path.display(),
        workflow_id = %def.id,
        steps = def.steps.len(),
        "Loaded workflow override"
    );
    Ok(def)
}
