mod support;

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use taskvault::clock::ManualClock;
use taskvault::dependency::{DependencyResolver, ResourceConstraint};
use taskvault::error::Error;
use taskvault::task::{collect_dependencies, DependencyRef, Task, TaskDependency, TaskStatus};

fn resolver() -> DependencyResolver {
    DependencyResolver::new(Arc::new(ManualClock::new(support::start_time())))
}

fn task(id: &str, deps: &[&str]) -> Task {
    deps.iter().fold(Task::new(id, id, support::start_time()), |t, dep| {
        t.with_dependency(DependencyRef::hard(*dep))
    })
}

#[test]
fn diamond_plans_in_three_groups() {
    let tasks = vec![
        task("a", &[]),
        task("b", &["a"]).with_estimate_secs(30),
        task("c", &["a"]).with_estimate_secs(90),
        task("d", &["b", "c"]).with_estimate_secs(10),
    ];
    let plan = resolver()
        .plan_execution(&tasks, &collect_dependencies(&tasks))
        .unwrap();
    assert_eq!(plan.order, vec!["a", "b", "c", "d"]);
    assert_eq!(
        plan.parallel_groups,
        vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()], vec!["d".to_string()]]
    );
    assert_eq!(plan.critical_path, vec!["a", "c", "d"]);
    assert_eq!(plan.estimated_duration_secs, 100);
    assert!(plan.resolution_actions.is_empty());
}

#[test]
fn soft_cycle_is_broken_and_reported() {
    let tasks = vec![
        task("a", &["b"]),
        Task::new("b", "b", support::start_time()).with_dependency(DependencyRef::soft("a")),
    ];
    let plan = resolver()
        .plan_execution(&tasks, &collect_dependencies(&tasks))
        .unwrap();
    assert_eq!(plan.order, vec!["b", "a"]);
    assert_eq!(plan.resolution_actions.len(), 1);
    assert_eq!(plan.resolution_actions[0].dependent_task_id, "b");
}

#[test]
fn hard_cycle_fails_planning() {
    let tasks = vec![task("a", &["b"]), task("b", &["a"]), task("c", &[])];
    let err = resolver()
        .plan_execution(&tasks, &collect_dependencies(&tasks))
        .unwrap_err();
    match err {
        Error::Cycle(cycles) => assert_eq!(cycles, vec![vec!["a".to_string(), "b".to_string()]]),
        other => panic!("expected cycle error, got {other:?}"),
    }
}

#[test]
fn unknown_dependency_is_ignored() {
    let tasks = vec![task("a", &["ghost"])];
    let graph = resolver().build_dependency_graph(&tasks, &collect_dependencies(&tasks));
    assert_eq!(graph.metadata.edge_count, 0);
    assert_eq!(graph.metadata.ignored_edges, 1);
    assert_eq!(resolver().topological_sort(&graph), vec!["a"]);
}

#[test]
fn ready_tasks_wait_for_completed_prerequisites() {
    let tasks = vec![
        task("a", &[]).with_status(TaskStatus::Completed),
        task("b", &["a"]),
        task("c", &["b"]),
        task("d", &[]).with_status(TaskStatus::Running),
    ];
    let r = resolver();
    let graph = r.graph_for(&tasks);
    let ready: Vec<String> = r
        .get_ready_tasks(&graph, &tasks)
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec!["b"]);
}

fn ready_ids(r: &DependencyResolver, tasks: &[Task]) -> Vec<String> {
    let graph = r.graph_for(tasks);
    r.get_ready_tasks(&graph, tasks)
        .into_iter()
        .map(|t| t.id)
        .collect()
}

#[test]
fn linear_chain_releases_one_task_at_a_time() {
    let mut tasks = vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["b"]),
        task("d", &["c"]),
    ];
    let r = resolver();
    let graph = r.graph_for(&tasks);
    assert_eq!(r.topological_sort(&graph), vec!["a", "b", "c", "d"]);
    assert_eq!(r.find_parallel_execution_groups(&graph).len(), 4);

    assert_eq!(ready_ids(&r, &tasks), vec!["a"]);
    tasks[0].status = TaskStatus::Completed;
    assert_eq!(ready_ids(&r, &tasks), vec!["b"]);
}

#[test]
fn fan_out_runs_dependents_together() {
    let tasks = vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["a"]),
    ];
    let r = resolver();
    let graph = r.graph_for(&tasks);
    assert_eq!(
        r.find_parallel_execution_groups(&graph),
        vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        ]
    );
}

#[test]
fn single_task_is_one_group_of_one() {
    let tasks = vec![task("solo", &[])];
    let r = resolver();
    let graph = r.graph_for(&tasks);
    assert_eq!(
        r.find_parallel_execution_groups(&graph),
        vec![vec!["solo".to_string()]]
    );
    assert_eq!(ready_ids(&r, &tasks), vec!["solo"]);
}

#[test]
fn disjoint_cycles_are_reported_separately() {
    let tasks = vec![
        task("a", &["b"]),
        task("b", &["a"]),
        task("c", &["d"]),
        task("d", &["c"]),
        task("e", &[]),
    ];
    let r = resolver();
    let graph = r.graph_for(&tasks);
    assert!(graph.metadata.has_cycles);
    let cycles: Vec<Vec<String>> = r
        .detect_cycles(&graph)
        .into_iter()
        .map(|c| c.cycle)
        .collect();
    assert_eq!(
        cycles,
        vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string(), "d".to_string()]
        ]
    );
    assert!(r.topological_sort(&graph).is_empty());
}

#[test]
fn exclusive_resource_serializes_a_group() {
    let mut tasks = vec![task("a", &[]), task("b", &[])];
    for t in &mut tasks {
        t.metadata.estimated_duration_secs = Some(60);
        t.execution_context.resources.insert("gpu".to_string(), 1);
    }
    let r = resolver();
    let plan = r.plan_execution(&tasks, &[]).unwrap();
    let allocations = r.estimate_resource_allocations(
        &plan,
        &tasks,
        &[ResourceConstraint {
            resource_type: "gpu".to_string(),
            max_units: 1,
            exclusive: true,
        }],
        support::start_time(),
    );
    assert_eq!(allocations.len(), 2);
    assert_eq!(allocations[0].allocated_at, support::start_time());
    assert_eq!(allocations[1].allocated_at, allocations[0].expected_release);
}

/// Random DAG: each task may depend only on tasks with a smaller index.
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..12).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2));
        (Just(n), edges)
    })
}

proptest! {
    #[test]
    fn topological_order_respects_every_edge((n, raw_edges) in dag_strategy()) {
        let tasks: Vec<Task> = (0..n)
            .map(|i| Task::new(format!("t{i:02}"), "t", support::start_time()))
            .collect();
        let deps: Vec<TaskDependency> = raw_edges
            .into_iter()
            .filter(|(from, to)| from > to)
            .map(|(from, to)| TaskDependency::hard(format!("t{from:02}"), format!("t{to:02}")))
            .collect();

        let r = resolver();
        let graph = r.build_dependency_graph(&tasks, &deps);
        prop_assert!(!graph.metadata.has_cycles);
        let order = r.topological_sort(&graph);
        prop_assert_eq!(order.len(), n);

        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for dep in &deps {
            prop_assert!(position[dep.depends_on_task_id.as_str()] < position[dep.dependent_task_id.as_str()]);
        }

        let groups = r.find_parallel_execution_groups(&graph);
        prop_assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), n);
    }
}
