//! Sequential plan execution: fetch, install, test, each short-circuit
//! on the first non-success task.
//!
//! Grounded in `reprise.plan.Plan`.

use crate::sandbox::Sandbox;
use crate::task::{Task, TaskError, TaskStatus};

/// An ordered list of tasks, already topologically sorted by
/// [`crate::planner::Planner::prepare`].
pub struct Plan {
    tasks: Vec<Task>,
}

impl Plan {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub async fn fetch(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> Result<TaskStatus, TaskError> {
        let mut status = TaskStatus::Success;
        for task in &self.tasks {
            if !status.is_success() {
                break;
            }
            status = task.fetch(sandbox, log).await?;
        }
        Ok(status)
    }

    pub async fn install(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> Result<TaskStatus, TaskError> {
        let mut status = TaskStatus::Success;
        for task in &self.tasks {
            if !status.is_success() {
                break;
            }
            status = task.install(sandbox, log).await?;
        }
        Ok(status)
    }

    pub async fn test(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> Result<TaskStatus, TaskError> {
        let mut status = TaskStatus::Success;
        for task in &self.tasks {
            if !status.is_success() {
                break;
            }
            status = task.test(sandbox, log).await?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PortTask;
    use crate::types::Port;

    fn noop_port_task(origin: &str) -> Task {
        Task::Port(PortTask {
            port: Port::new(origin.to_string(), None),
            do_test: false,
            build_as_nobody: false,
            fetch_timeout_secs: 1,
            build_timeout_secs: 1,
            test_timeout_secs: 1,
        })
    }

    #[test]
    fn plan_preserves_task_order() {
        let plan = Plan::new(vec![noop_port_task("cat/a"), noop_port_task("cat/b")]);
        assert_eq!(plan.tasks().len(), 2);
        assert!(plan.tasks()[0].label().contains("cat/a"));
        assert!(plan.tasks()[1].label().contains("cat/b"));
    }
}
