//! Dependency graph analysis.
//!
//! [`DependencyResolver`] is stateless: every operation takes the tasks and
//! edges it needs and derives a fresh [`DependencyGraph`]. Edges point from
//! the dependent task to the task it depends on; execution order runs the
//! other way.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::task::{collect_dependencies, DependencyType, Task, TaskDependency, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyNode {
    pub task_id: String,
    /// Tasks this node depends on
    pub dependencies: Vec<String>,
    /// Tasks that depend on this node
    pub dependents: Vec<String>,
    /// Edges touching this node, in either direction
    pub edges: Vec<TaskDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub node_count: usize,
    pub edge_count: usize,
    pub has_cycles: bool,
    /// Number of nodes on the longest chain starting at a source node
    pub max_depth: usize,
    pub ignored_edges: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    pub nodes: BTreeMap<String, DependencyNode>,
    pub edges: Vec<TaskDependency>,
    /// Task ids in the order they were supplied; drives every tie-break
    pub order: Vec<String>,
    pub metadata: GraphMetadata,
}

impl DependencyGraph {
    pub fn node(&self, task_id: &str) -> Option<&DependencyNode> {
        self.nodes.get(task_id)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn position_index(&self) -> HashMap<&str, usize> {
        self.order
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.as_str(), idx))
            .collect()
    }

    /// Kahn elimination; returns the visited order and each visited node's depth.
    fn kahn(&self) -> (Vec<String>, HashMap<String, usize>) {
        let position = self.position_index();
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .values()
            .map(|node| (node.task_id.as_str(), node.dependencies.len()))
            .collect();

        // Ready set keyed by input position so ties resolve in input order.
        let mut ready: BTreeSet<(usize, &str)> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .map(|id| (position[id.as_str()], id.as_str()))
            .collect();

        let mut visited = Vec::with_capacity(self.order.len());
        let mut depth: HashMap<String, usize> = HashMap::new();
        while let Some(entry) = ready.pop_first() {
            let (_, id) = entry;
            let node = &self.nodes[id];
            let level = node
                .dependencies
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.to_string(), level);
            visited.push(id.to_string());

            for dependent in &node.dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert((position[dependent.as_str()], dependent.as_str()));
                    }
                }
            }
        }
        (visited, depth)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    RemoveEdge,
    SplitTask,
    MergeTasks,
    Reorder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStrategy {
    pub kind: ResolutionKind,
    pub impact: Impact,
    pub description: String,
    /// The edge the strategy acts on, when it targets one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<TaskDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircularDependency {
    /// `cycle[i]` depends on `cycle[i + 1]`, and the last depends on the first
    pub cycle: Vec<String>,
    pub edges: Vec<TaskDependency>,
    /// Ordered by ascending impact
    pub strategies: Vec<ResolutionStrategy>,
}

impl CircularDependency {
    pub fn is_self_loop(&self) -> bool {
        self.cycle.len() == 1
    }

    pub fn soft_edges(&self) -> impl Iterator<Item = &TaskDependency> {
        self.edges
            .iter()
            .filter(|edge| edge.kind == DependencyType::Soft)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionAction {
    pub action: String,
    pub dependent_task_id: String,
    pub depends_on_task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub success: bool,
    pub actions: Vec<ResolutionAction>,
    pub unresolved_cycles: Vec<CircularDependency>,
    /// The graph's edges minus the removed ones
    pub remaining_edges: Vec<TaskDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSequence {
    pub order: Vec<String>,
    pub parallel_groups: Vec<Vec<String>>,
    pub critical_path: Vec<String>,
    /// Sum over groups of the longest estimate in each group
    pub estimated_duration_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolution_actions: Vec<ResolutionAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConstraint {
    pub resource_type: String,
    pub max_units: u32,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    pub task_id: String,
    pub resources: BTreeMap<String, u32>,
    pub allocated_at: DateTime<Utc>,
    pub expected_release: DateTime<Utc>,
}

/// Graph algorithms over tasks and their dependency edges.
#[derive(Clone)]
pub struct DependencyResolver {
    clock: Arc<dyn Clock>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver").finish_non_exhaustive()
    }
}

impl DependencyResolver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Graph over `tasks` using the edges declared on the tasks themselves.
    pub fn graph_for(&self, tasks: &[Task]) -> DependencyGraph {
        self.build_dependency_graph(tasks, &collect_dependencies(tasks))
    }

    pub fn build_dependency_graph(
        &self,
        tasks: &[Task],
        dependencies: &[TaskDependency],
    ) -> DependencyGraph {
        let mut order = Vec::with_capacity(tasks.len());
        let mut nodes: BTreeMap<String, DependencyNode> = BTreeMap::new();
        for task in tasks {
            if nodes.contains_key(&task.id) {
                continue;
            }
            order.push(task.id.clone());
            nodes.insert(
                task.id.clone(),
                DependencyNode {
                    task_id: task.id.clone(),
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                    edges: Vec::new(),
                },
            );
        }

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut edges = Vec::new();
        let mut ignored = 0usize;
        for dep in dependencies {
            let known = nodes.contains_key(&dep.dependent_task_id)
                && nodes.contains_key(&dep.depends_on_task_id);
            if !known {
                tracing::warn!(
                    dependent = %dep.dependent_task_id,
                    depends_on = %dep.depends_on_task_id,
                    "ignoring dependency on unknown task"
                );
                ignored += 1;
                continue;
            }
            let key = (dep.dependent_task_id.clone(), dep.depends_on_task_id.clone());
            if !seen.insert(key) {
                continue;
            }
            edges.push(dep.clone());
        }

        for edge in &edges {
            if let Some(node) = nodes.get_mut(&edge.dependent_task_id) {
                node.dependencies.push(edge.depends_on_task_id.clone());
                node.edges.push(edge.clone());
            }
            if let Some(node) = nodes.get_mut(&edge.depends_on_task_id) {
                node.dependents.push(edge.dependent_task_id.clone());
                if edge.dependent_task_id != edge.depends_on_task_id {
                    node.edges.push(edge.clone());
                }
            }
        }

        let mut graph = DependencyGraph {
            metadata: GraphMetadata {
                node_count: nodes.len(),
                edge_count: edges.len(),
                has_cycles: false,
                max_depth: 0,
                ignored_edges: ignored,
                created_at: self.clock.now(),
            },
            nodes,
            edges,
            order,
        };

        let (visited, depth) = graph.kahn();
        graph.metadata.has_cycles = visited.len() < graph.order.len();
        graph.metadata.max_depth = depth.values().max().map(|d| d + 1).unwrap_or(0);
        graph
    }

    /// Every elementary cycle reachable by depth-first search, self-loops included.
    pub fn detect_cycles(&self, graph: &DependencyGraph) -> Vec<CircularDependency> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = graph
            .order
            .iter()
            .map(|id| (id.as_str(), Mark::Unvisited))
            .collect();
        let mut found: Vec<Vec<String>> = Vec::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();

        for start in &graph.order {
            if marks[start.as_str()] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (node, index of next dependency to explore)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::OnStack);

            while let Some(frame) = stack.last_mut() {
                let (id, next) = *frame;
                let deps = &graph.nodes[id].dependencies;
                if next >= deps.len() {
                    marks.insert(id, Mark::Done);
                    stack.pop();
                    continue;
                }
                frame.1 += 1;
                let dep = deps[next].as_str();
                match marks[dep] {
                    Mark::Unvisited => {
                        marks.insert(dep, Mark::OnStack);
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        let from = stack
                            .iter()
                            .position(|(node, _)| *node == dep)
                            .unwrap_or(0);
                        let cycle: Vec<String> =
                            stack[from..].iter().map(|(node, _)| node.to_string()).collect();
                        let canonical = rotate_to_min(cycle);
                        if seen.insert(canonical.clone()) {
                            found.push(canonical);
                        }
                    }
                    Mark::Done => {}
                }
            }
        }

        found
            .into_iter()
            .map(|cycle| annotate_cycle(graph, cycle))
            .collect()
    }

    /// Kahn order, ties by input order; empty iff the graph has a cycle.
    pub fn topological_sort(&self, graph: &DependencyGraph) -> Vec<String> {
        let (visited, _) = graph.kahn();
        if visited.len() < graph.order.len() {
            return Vec::new();
        }
        visited
    }

    /// Break each cycle by dropping one of its soft edges.
    pub fn resolve_dependencies(
        &self,
        graph: &DependencyGraph,
        cycles: &[CircularDependency],
    ) -> ResolutionResult {
        let mut removed: HashSet<(String, String)> = HashSet::new();
        let mut actions = Vec::new();
        let mut unresolved = Vec::new();

        for cycle in cycles {
            let already_broken = cycle.edges.iter().any(|edge| {
                removed.contains(&(
                    edge.dependent_task_id.clone(),
                    edge.depends_on_task_id.clone(),
                ))
            });
            if already_broken {
                continue;
            }
            match cycle.soft_edges().next() {
                Some(edge) => {
                    removed.insert((
                        edge.dependent_task_id.clone(),
                        edge.depends_on_task_id.clone(),
                    ));
                    actions.push(ResolutionAction {
                        action: "remove_dependency".to_string(),
                        dependent_task_id: edge.dependent_task_id.clone(),
                        depends_on_task_id: edge.depends_on_task_id.clone(),
                        reason: format!("breaks cycle {}", cycle.cycle.join(" -> ")),
                    });
                }
                None => unresolved.push(cycle.clone()),
            }
        }

        let remaining_edges = graph
            .edges
            .iter()
            .filter(|edge| {
                !removed.contains(&(
                    edge.dependent_task_id.clone(),
                    edge.depends_on_task_id.clone(),
                ))
            })
            .cloned()
            .collect();

        ResolutionResult {
            success: unresolved.is_empty(),
            actions,
            unresolved_cycles: unresolved,
            remaining_edges,
        }
    }

    /// Longest chain by cumulative estimated duration.
    ///
    /// Chains compare by total duration; on a tie the chain ending at the
    /// earliest task id wins. Empty for cyclic graphs.
    pub fn find_critical_path(&self, graph: &DependencyGraph, tasks: &[Task]) -> Vec<String> {
        let order = self.topological_sort(graph);
        if order.is_empty() {
            return Vec::new();
        }
        let weight: HashMap<&str, u64> = tasks
            .iter()
            .map(|task| (task.id.as_str(), task.estimated_duration_secs()))
            .collect();

        let mut best: HashMap<&str, u64> = HashMap::new();
        let mut prev: HashMap<&str, Option<&str>> = HashMap::new();
        for id in &order {
            let node = &graph.nodes[id.as_str()];
            let mut chosen: Option<(&str, u64)> = None;
            for dep in &node.dependencies {
                let score = best.get(dep.as_str()).copied().unwrap_or(0);
                chosen = match chosen {
                    Some((cur_id, cur)) if compare_chain(cur, cur_id, score, dep) != Ordering::Less => {
                        Some((cur_id, cur))
                    }
                    _ => Some((dep.as_str(), score)),
                };
            }
            let own = weight.get(id.as_str()).copied().unwrap_or(0);
            let (base, from) = match chosen {
                Some((dep, score)) => (score, Some(dep)),
                None => (0, None),
            };
            best.insert(id.as_str(), base + own);
            prev.insert(id.as_str(), from);
        }

        let mut end: Option<(&str, u64)> = None;
        for id in &order {
            let score = best[id.as_str()];
            end = match end {
                Some((cur_id, cur)) if compare_chain(cur, cur_id, score, id) != Ordering::Less => {
                    Some((cur_id, cur))
                }
                _ => Some((id.as_str(), score)),
            };
        }

        let mut path = Vec::new();
        let mut cursor = end.map(|(id, _)| id);
        while let Some(id) = cursor {
            path.push(id.to_string());
            cursor = prev.get(id).copied().flatten();
        }
        path.reverse();
        path
    }

    /// Schedulable tasks whose every dependency is completed.
    pub fn get_ready_tasks(&self, graph: &DependencyGraph, tasks: &[Task]) -> Vec<Task> {
        let status: HashMap<&str, TaskStatus> = tasks
            .iter()
            .map(|task| (task.id.as_str(), task.status))
            .collect();

        tasks
            .iter()
            .filter(|task| !task.is_deleted())
            .filter(|task| {
                matches!(
                    task.status,
                    TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Blocked
                )
            })
            .filter(|task| {
                graph.node(&task.id).is_some_and(|node| {
                    node.dependencies
                        .iter()
                        .all(|dep| status.get(dep.as_str()) == Some(&TaskStatus::Completed))
                })
            })
            .cloned()
            .collect()
    }

    /// Tasks grouped by depth from the source nodes; nodes on cycles are left out.
    pub fn find_parallel_execution_groups(&self, graph: &DependencyGraph) -> Vec<Vec<String>> {
        let (visited, depth) = graph.kahn();
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let position = graph.position_index();
        for id in visited {
            let level = depth.get(&id).copied().unwrap_or(0);
            levels.entry(level).or_default().push(id);
        }
        levels
            .into_values()
            .map(|mut group| {
                group.sort_by_key(|id| position[id.as_str()]);
                group
            })
            .collect()
    }

    /// Full plan: order, groups, critical path and duration estimate.
    ///
    /// Soft edges on cycles are dropped first; any remaining hard cycle fails
    /// the plan with [`Error::Cycle`].
    pub fn plan_execution(
        &self,
        tasks: &[Task],
        dependencies: &[TaskDependency],
    ) -> Result<ExecutionSequence> {
        let mut graph = self.build_dependency_graph(tasks, dependencies);
        let mut resolution_actions = Vec::new();

        if graph.metadata.has_cycles {
            let cycles = self.detect_cycles(&graph);
            let resolution = self.resolve_dependencies(&graph, &cycles);
            if !resolution.success {
                return Err(Error::Cycle(
                    resolution
                        .unresolved_cycles
                        .into_iter()
                        .map(|cycle| cycle.cycle)
                        .collect(),
                ));
            }
            resolution_actions = resolution.actions;
            graph = self.build_dependency_graph(tasks, &resolution.remaining_edges);
            if graph.metadata.has_cycles {
                // Removing one soft edge per cycle left an overlapping cycle intact.
                let leftover = self
                    .detect_cycles(&graph)
                    .into_iter()
                    .map(|cycle| cycle.cycle)
                    .collect();
                return Err(Error::Cycle(leftover));
            }
        }

        let order = self.topological_sort(&graph);
        let parallel_groups = self.find_parallel_execution_groups(&graph);
        let critical_path = self.find_critical_path(&graph, tasks);

        let estimate: HashMap<&str, u64> = tasks
            .iter()
            .map(|task| (task.id.as_str(), task.estimated_duration_secs()))
            .collect();
        let estimated_duration_secs = parallel_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|id| estimate.get(id.as_str()).copied().unwrap_or(0))
                    .max()
                    .unwrap_or(0)
            })
            .sum();

        Ok(ExecutionSequence {
            order,
            parallel_groups,
            critical_path,
            estimated_duration_secs,
            resolution_actions,
        })
    }

    /// Pack each parallel group into waves that fit the resource constraints.
    ///
    /// Waves within a group run back to back, and each group starts when the
    /// previous group's last wave releases. Resources without a constraint
    /// are unlimited. A task asking for more than a constraint allows runs in
    /// a wave of its own.
    pub fn estimate_resource_allocations(
        &self,
        sequence: &ExecutionSequence,
        tasks: &[Task],
        constraints: &[ResourceConstraint],
        start: DateTime<Utc>,
    ) -> Vec<ResourceAllocation> {
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let limits: HashMap<&str, &ResourceConstraint> = constraints
            .iter()
            .map(|c| (c.resource_type.as_str(), c))
            .collect();

        let mut allocations = Vec::new();
        let mut cursor = start;

        for group in &sequence.parallel_groups {
            let mut waves: Vec<Vec<&Task>> = Vec::new();
            let mut usage: Vec<HashMap<&str, u32>> = Vec::new();
            let mut sealed: Vec<bool> = Vec::new();

            for id in group {
                let Some(task) = by_id.get(id.as_str()).copied() else {
                    continue;
                };
                let requested = &task.execution_context.resources;
                let oversized = requested.iter().any(|(kind, units)| {
                    limits
                        .get(kind.as_str())
                        .is_some_and(|limit| *units > limit.max_units)
                });
                if oversized {
                    tracing::warn!(task_id = %task.id, "resource request exceeds constraint; scheduling alone");
                }

                let slot = if oversized {
                    None
                } else {
                    usage
                        .iter()
                        .zip(&sealed)
                        .position(|(used, closed)| !closed && fits(requested, used, &limits))
                };
                let slot = match slot {
                    Some(slot) => slot,
                    None => {
                        waves.push(Vec::new());
                        usage.push(HashMap::new());
                        sealed.push(oversized);
                        waves.len() - 1
                    }
                };
                for (kind, units) in requested {
                    *usage[slot].entry(kind.as_str()).or_insert(0) += units;
                }
                waves[slot].push(task);
            }

            for wave in waves {
                let longest = wave
                    .iter()
                    .map(|task| task.estimated_duration_secs())
                    .max()
                    .unwrap_or(0);
                for task in &wave {
                    allocations.push(ResourceAllocation {
                        task_id: task.id.clone(),
                        resources: task.execution_context.resources.clone(),
                        allocated_at: cursor,
                        expected_release: cursor
                            + Duration::seconds(task.estimated_duration_secs() as i64),
                    });
                }
                cursor += Duration::seconds(longest as i64);
            }
        }

        allocations
    }
}

fn fits(
    requested: &BTreeMap<String, u32>,
    used: &HashMap<&str, u32>,
    limits: &HashMap<&str, &ResourceConstraint>,
) -> bool {
    requested.iter().all(|(kind, units)| {
        let Some(limit) = limits.get(kind.as_str()) else {
            return true;
        };
        let current = used.get(kind.as_str()).copied().unwrap_or(0);
        if limit.exclusive && current > 0 {
            return false;
        }
        current.saturating_add(*units) <= limit.max_units
    })
}

/// `Greater` when chain `a` beats chain `b`.
fn compare_chain(a: u64, a_id: &str, b: u64, b_id: &str) -> Ordering {
    a.cmp(&b).then_with(|| b_id.cmp(a_id))
}

fn rotate_to_min(mut cycle: Vec<String>) -> Vec<String> {
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(idx, _)| idx)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}

fn annotate_cycle(graph: &DependencyGraph, cycle: Vec<String>) -> CircularDependency {
    let edges: Vec<TaskDependency> = (0..cycle.len())
        .filter_map(|idx| {
            let from = &cycle[idx];
            let to = &cycle[(idx + 1) % cycle.len()];
            graph.nodes.get(from).and_then(|node| {
                node.edges
                    .iter()
                    .find(|edge| edge.dependent_task_id == *from && edge.depends_on_task_id == *to)
                    .cloned()
            })
        })
        .collect();

    let mut strategies = Vec::new();
    for edge in edges.iter().filter(|e| e.kind == DependencyType::Soft) {
        strategies.push(ResolutionStrategy {
            kind: ResolutionKind::RemoveEdge,
            impact: Impact::Low,
            description: format!(
                "drop soft dependency {} -> {}",
                edge.dependent_task_id, edge.depends_on_task_id
            ),
            edge: Some(edge.clone()),
        });
    }
    if cycle.len() == 1 {
        strategies.push(ResolutionStrategy {
            kind: ResolutionKind::RemoveEdge,
            impact: Impact::Low,
            description: format!("task {} depends on itself", cycle[0]),
            edge: edges.first().cloned(),
        });
    } else {
        strategies.push(ResolutionStrategy {
            kind: ResolutionKind::Reorder,
            impact: Impact::Medium,
            description: format!("reorder {} so one prerequisite comes first", cycle.join(", ")),
            edge: None,
        });
        strategies.push(ResolutionStrategy {
            kind: ResolutionKind::SplitTask,
            impact: Impact::Medium,
            description: format!("split {} to separate the mutually dependent work", cycle[0]),
            edge: None,
        });
        strategies.push(ResolutionStrategy {
            kind: ResolutionKind::MergeTasks,
            impact: Impact::High,
            description: format!("merge {} into one task", cycle.join(", ")),
            edge: None,
        });
    }
    if let Some(hard) = edges.iter().find(|e| e.kind == DependencyType::Hard) {
        if cycle.len() > 1 {
            strategies.push(ResolutionStrategy {
                kind: ResolutionKind::RemoveEdge,
                impact: Impact::High,
                description: format!(
                    "drop hard dependency {} -> {}",
                    hard.dependent_task_id, hard.depends_on_task_id
                ),
                edge: Some(hard.clone()),
            });
        }
    }
    strategies.sort_by_key(|strategy| strategy.impact);

    CircularDependency {
        cycle,
        edges,
        strategies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::task::DependencyRef;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn resolver() -> DependencyResolver {
        DependencyResolver::new(Arc::new(ManualClock::new(t0())))
    }

    fn task(id: &str) -> Task {
        Task::new(id, id.to_uppercase(), t0())
    }

    #[test]
    fn unknown_and_duplicate_edges_are_dropped() {
        let tasks = vec![task("a"), task("b")];
        let deps = vec![
            TaskDependency::hard("b", "a"),
            TaskDependency::hard("b", "a"),
            TaskDependency::hard("b", "ghost"),
        ];
        let graph = resolver().build_dependency_graph(&tasks, &deps);
        assert_eq!(graph.metadata.edge_count, 1);
        assert_eq!(graph.metadata.ignored_edges, 1);
        assert_eq!(graph.node("b").unwrap().dependencies, vec!["a"]);
        assert_eq!(graph.node("a").unwrap().dependents, vec!["b"]);
        assert_eq!(graph.metadata.max_depth, 2);
        assert_eq!(graph.metadata.created_at, t0());
    }

    #[test]
    fn self_loop_is_one_cycle() {
        let tasks = vec![task("a").with_dependency(DependencyRef::hard("a"))];
        let r = resolver();
        let graph = r.graph_for(&tasks);
        let cycles = r.detect_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].cycle, vec!["a"]);
        assert!(cycles[0].is_self_loop());
        assert!(r.topological_sort(&graph).is_empty());
    }

    #[test]
    fn strategies_are_ranked_by_impact() {
        let tasks = vec![
            task("a").with_dependency(DependencyRef::hard("b")),
            task("b").with_dependency(DependencyRef::soft("a")),
        ];
        let r = resolver();
        let cycles = r.detect_cycles(&r.graph_for(&tasks));
        let impacts: Vec<Impact> = cycles[0].strategies.iter().map(|s| s.impact).collect();
        let mut sorted = impacts.clone();
        sorted.sort();
        assert_eq!(impacts, sorted);
        assert_eq!(cycles[0].strategies[0].kind, ResolutionKind::RemoveEdge);
    }

    #[test]
    fn soft_edge_is_removed_to_resolve() {
        let tasks = vec![
            task("a").with_dependency(DependencyRef::hard("b")),
            task("b").with_dependency(DependencyRef::soft("a")),
        ];
        let r = resolver();
        let graph = r.graph_for(&tasks);
        let result = r.resolve_dependencies(&graph, &r.detect_cycles(&graph));
        assert!(result.success);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].action, "remove_dependency");
        assert_eq!(result.actions[0].dependent_task_id, "b");
        assert_eq!(result.remaining_edges.len(), 1);
    }

    #[test]
    fn hard_cycle_fails_planning() {
        let tasks = vec![
            task("a").with_dependency(DependencyRef::hard("b")),
            task("b").with_dependency(DependencyRef::hard("a")),
            task("c"),
        ];
        let err = resolver()
            .plan_execution(&tasks, &collect_dependencies(&tasks))
            .unwrap_err();
        match err {
            Error::Cycle(cycles) => assert_eq!(cycles, vec![vec!["a".to_string(), "b".to_string()]]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn critical_path_follows_longest_duration() {
        // a -> b (long) -> d, a -> c (short) -> d
        let tasks = vec![
            task("a").with_estimate_secs(10),
            task("b").with_estimate_secs(100).with_dependency(DependencyRef::hard("a")),
            task("c").with_estimate_secs(5).with_dependency(DependencyRef::hard("a")),
            task("d")
                .with_estimate_secs(1)
                .with_dependency(DependencyRef::hard("b"))
                .with_dependency(DependencyRef::hard("c")),
        ];
        let r = resolver();
        let graph = r.graph_for(&tasks);
        assert_eq!(r.find_critical_path(&graph, &tasks), vec!["a", "b", "d"]);

        let plan = r.plan_execution(&tasks, &collect_dependencies(&tasks)).unwrap();
        assert_eq!(plan.parallel_groups, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(plan.estimated_duration_secs, 111);
    }

    #[test]
    fn critical_path_ties_prefer_earliest_id() {
        let tasks = vec![task("b"), task("a")];
        let r = resolver();
        let graph = r.graph_for(&tasks);
        assert_eq!(r.find_critical_path(&graph, &tasks), vec!["a"]);
    }

    #[test]
    fn critical_path_ties_ignore_chain_length() {
        // "a" alone weighs the same as "b" -> "c"; the earlier id wins.
        let tasks = vec![
            task("a").with_estimate_secs(60),
            task("b").with_estimate_secs(30),
            task("c").with_estimate_secs(30).with_dependency(DependencyRef::hard("b")),
        ];
        let r = resolver();
        let graph = r.graph_for(&tasks);
        assert_eq!(r.find_critical_path(&graph, &tasks), vec!["a"]);
    }

    #[test]
    fn exclusive_resources_split_waves() {
        let mut first = task("a").with_estimate_secs(60);
        first.execution_context.resources.insert("gpu".to_string(), 1);
        let mut second = task("b").with_estimate_secs(30);
        second.execution_context.resources.insert("gpu".to_string(), 1);
        let third = task("c").with_estimate_secs(10);
        let tasks = vec![first, second, third];

        let r = resolver();
        let plan = r.plan_execution(&tasks, &[]).unwrap();
        let constraints = vec![ResourceConstraint {
            resource_type: "gpu".to_string(),
            max_units: 4,
            exclusive: true,
        }];
        let allocations = r.estimate_resource_allocations(&plan, &tasks, &constraints, t0());
        assert_eq!(allocations.len(), 3);
        let by_id: HashMap<_, _> = allocations.iter().map(|a| (a.task_id.as_str(), a)).collect();
        assert_eq!(by_id["a"].allocated_at, t0());
        assert_eq!(by_id["c"].allocated_at, t0());
        assert_eq!(by_id["b"].allocated_at, t0() + Duration::seconds(60));
        assert_eq!(by_id["b"].expected_release, t0() + Duration::seconds(90));
    }
}
