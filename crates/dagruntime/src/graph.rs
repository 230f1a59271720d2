use dagcore::{FlowError, StepId, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency graph of a workflow's steps (edge: dependency -> dependent)
pub struct StepGraph {
    graph: DiGraph<StepId, ()>,
    indices: HashMap<StepId, NodeIndex>,
}

impl StepGraph {
    /// Build the graph; duplicate dependency edges collapse into one
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, FlowError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for step in &definition.steps {
            let idx = graph.add_node(step.id.clone());
            indices.insert(step.id.clone(), idx);
        }

        for step in &definition.steps {
            let to_idx = indices[&step.id];
            for dep in &step.dependencies {
                let from_idx = indices.get(dep).ok_or_else(|| {
                    FlowError::validation(format!("step '{}' depends on unknown step '{}'", step.id, dep))
                })?;
                graph.update_edge(*from_idx, to_idx, ());
            }
        }

        Ok(Self { graph, indices })
    }

    /// Steps that depend directly on `step_id`
    pub fn dependents(&self, step_id: &str) -> Vec<StepId> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// Direct dependencies of `step_id`
    pub fn dependencies(&self, step_id: &str) -> Vec<StepId> {
        self.neighbors(step_id, Direction::Incoming)
    }

    fn neighbors(&self, step_id: &str, direction: Direction) -> Vec<StepId> {
        match self.indices.get(step_id) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ready-queue state for the steps not yet in `executed`.
    ///
    /// `order` fixes the initial queue order (declaration order).
    pub fn ready_queue<'a>(
        &self,
        order: impl IntoIterator<Item = &'a StepId>,
        executed: &HashSet<StepId>,
    ) -> ReadyQueue {
        let mut in_degree = HashMap::new();
        let mut ready = VecDeque::new();

        for step_id in order {
            if executed.contains(step_id) {
                continue;
            }
            let unmet = self
                .dependencies(step_id)
                .iter()
                .filter(|dep| !executed.contains(*dep))
                .count();
            if unmet == 0 {
                ready.push_back(step_id.clone());
            }
            in_degree.insert(step_id.clone(), unmet);
        }

        ReadyQueue { in_degree, ready }
    }
}

/// Steps waiting on dependencies plus those ready to run
pub struct ReadyQueue {
    in_degree: HashMap<StepId, usize>,
    ready: VecDeque<StepId>,
}

impl ReadyQueue {
    pub fn pop(&mut self) -> Option<StepId> {
        let step_id = self.ready.pop_front()?;
        self.in_degree.remove(&step_id);
        Some(step_id)
    }

    /// Mark a step finished, unlocking dependents whose last dependency it was
    pub fn complete(&mut self, step_id: &str, graph: &StepGraph) {
        for dependent in graph.dependents(step_id) {
            if let Some(remaining) = self.in_degree.get_mut(&dependent) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 && !self.ready.contains(&dependent) {
                    self.ready.push_back(dependent);
                }
            }
        }
    }

    /// Steps still blocked, sorted
    pub fn stuck(&self) -> Vec<StepId> {
        let mut stuck: Vec<StepId> = self
            .in_degree
            .keys()
            .filter(|id| !self.ready.contains(id))
            .cloned()
            .collect();
        stuck.sort();
        stuck
    }
}
