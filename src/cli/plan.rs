//! taskvault plan and ready commands

use crate::cli::CommandContext;
use crate::dependency::DependencyResolver;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::persistence::TaskPersistenceEngine;
use crate::task::{collect_dependencies, Task, TaskFilter};

fn live_tasks(cmd: &CommandContext) -> Result<Vec<Task>> {
    TaskPersistenceEngine::new(cmd.ctx.clone()).list_tasks(&TaskFilter::default())
}

pub fn run_plan(cmd: &CommandContext) -> Result<()> {
    let tasks = live_tasks(cmd)?;
    let resolver = DependencyResolver::new(cmd.ctx.clock.clone());
    let sequence = resolver.plan_execution(&tasks, &collect_dependencies(&tasks))?;

    let mut human = HumanOutput::new(format!("taskvault plan: {} task(s)", sequence.order.len()));
    human.push_summary("groups", sequence.parallel_groups.len().to_string());
    human.push_summary("estimated", format!("{}s", sequence.estimated_duration_secs));
    human.push_summary("critical path", sequence.critical_path.join(" -> "));
    for (index, group) in sequence.parallel_groups.iter().enumerate() {
        human.push_detail(format!("group {}: {}", index + 1, group.join(", ")));
    }
    for action in &sequence.resolution_actions {
        human.push_warning(format!(
            "{} {} -> {}: {}",
            action.action, action.dependent_task_id, action.depends_on_task_id, action.reason
        ));
    }

    emit_success(cmd.output, "plan", &sequence, Some(&human))
}

pub fn run_ready(cmd: &CommandContext) -> Result<()> {
    let tasks = live_tasks(cmd)?;
    let resolver = DependencyResolver::new(cmd.ctx.clock.clone());
    let graph = resolver.graph_for(&tasks);
    let ready = resolver.get_ready_tasks(&graph, &tasks);

    let mut human = HumanOutput::new(format!("taskvault ready: {} task(s)", ready.len()));
    for task in &ready {
        human.push_detail(format!("{} [{}] {}", task.id, task.priority.as_str(), task.title));
    }

    emit_success(cmd.output, "ready", &ready, Some(&human))
}
