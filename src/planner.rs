//! Dependency planner: given a target port, discovers its dependency
//! graph via `make -V` queries against a running sandbox, decides
//! package-vs-port per node, and topologically sorts the result into a
//! `Plan`.
//!
//! Grounded in `reprise.plan.planner.Planner`. The arena below replaces
//! the original's mutually-referencing dataclasses (`_TaskItem` holding
//! `Vec<Option<&_TaskItem>>`) with an index-keyed `Vec`, since Rust has
//! no back-pointer-friendly GC: `consumers` stores arena indices rather
//! than shared references.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::executor::{ExecOptions, ExecutorError};
use crate::plan::Plan;
use crate::repository::{Repository, RepositoryError};
use crate::sandbox::{Sandbox, SandboxError, SandboxUser};
use crate::task::{PackageTask, PortTask, Task};
use crate::types::Port;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no package manifest found for pkgname {0:?}")]
    MissingManifest(String),
    #[error("make -V produced no output for {0}")]
    EmptyMakeOutput(String),
}

pub type PlannerResult<T> = Result<T, PlannerError>;

/// An arena slot: the task itself plus the indices of every other slot
/// that depends on it ("consumers"), used for the final topological
/// sort. `None` marks the root of the graph (the job's target port,
/// which has no consumer).
struct TaskItem {
    task: Task,
    consumers: Vec<Option<usize>>,
    visited: bool,
}

/// A pending unit of BFS work. Exactly one of `port`/`pkgname` may be
/// known at enqueue time; [`Planner::prepare`] fills in whichever is
/// missing before the item is otherwise processed.
struct QueueItem {
    port: Option<Port>,
    pkgname: Option<String>,
    consumer: Option<usize>,
}

struct PortDepends {
    depends: HashSet<Port>,
    test_depends: HashSet<Port>,
}

fn depend_to_port(depend: &str) -> Option<Port> {
    // e.g. "lib/libfoo.so:ftp/curl:build" or "...:ftp/curl@flavor"
    let after_first_colon = depend.splitn(2, ':').nth(1)?;
    let rest = after_first_colon.split(':').next().unwrap_or(after_first_colon);
    let mut parts = rest.splitn(2, '@');
    let origin = parts.next()?.to_string();
    let flavor = parts.next().map(str::to_string);
    Some(Port::new(origin, flavor))
}

/// Plans the build of `origin`, resolving package-vs-port preference
/// and dependency order against a sandbox with `/usr/ports` mounted and
/// the target repository already loaded.
pub struct Planner {
    sandbox: Arc<Sandbox>,
    repository: Arc<Repository>,
    executor: Arc<crate::executor::Executor>,
}

impl Planner {
    pub fn new(
        sandbox: Arc<Sandbox>,
        repository: Arc<Repository>,
        executor: Arc<crate::executor::Executor>,
    ) -> Self {
        Self {
            sandbox,
            repository,
            executor,
        }
    }

    async fn make_query(&self, origin: &str, flavor: Option<&str>, vars: &[&str]) -> PlannerResult<Vec<String>> {
        let mut args = Vec::new();
        if let Some(flavor) = flavor {
            args.push("env".to_string());
            args.push(format!("FLAVOR={flavor}"));
        }
        args.push("make".to_string());
        args.push("-C".to_string());
        args.push(Path::new("/usr/ports").join(origin).display().to_string());
        for v in vars {
            args.push("-V".to_string());
            args.push(v.to_string());
        }
        let result = self
            .sandbox
            .execute("make", &args, SandboxUser::Root, &ExecOptions::default())
            .await?;
        Ok(result.stdout)
    }

    async fn get_port_depends(&self, port: &Port) -> PlannerResult<PortDepends> {
        let lines = self
            .make_query(
                port.origin(),
                port.flavor(),
                &[
                    "PKG_DEPENDS",
                    "EXTRACT_DEPENDS",
                    "BUILD_DEPENDS",
                    "RUN_DEPENDS",
                    "LIB_DEPENDS",
                    "TEST_DEPENDS",
                ],
            )
            .await?;

        if lines.is_empty() {
            return Err(PlannerError::EmptyMakeOutput(port.origin().to_string()));
        }

        let (normal_lines, test_line) = lines.split_at(lines.len() - 1);
        let depends = normal_lines
            .join(" ")
            .split_whitespace()
            .filter_map(depend_to_port)
            .collect();
        let test_depends = test_line
            .first()
            .map(|s| s.split_whitespace().filter_map(depend_to_port).collect())
            .unwrap_or_default();

        Ok(PortDepends { depends, test_depends })
    }

    async fn get_port_package_name(&self, port: &Port) -> PlannerResult<String> {
        let lines = self.make_query(port.origin(), port.flavor(), &["PKGNAME"]).await?;
        let pkgname = lines
            .first()
            .ok_or_else(|| PlannerError::EmptyMakeOutput(port.origin().to_string()))?;
        Ok(pkgname.rsplit_once('-').map(|(name, _)| name.to_string()).unwrap_or_else(|| pkgname.clone()))
    }

    async fn get_port_default_flavor(&self, origin: &str) -> PlannerResult<Option<String>> {
        let lines = self.make_query(origin, None, &["FLAVOR"]).await?;
        Ok(lines.into_iter().next().filter(|s| !s.is_empty()))
    }

    /// Runs the BFS-with-late-identity-resolution over the dependency
    /// graph of `origin`, then returns a reverse-postorder [`Plan`].
    pub async fn prepare(
        &self,
        origin: &str,
        origins_to_rebuild: &HashSet<String>,
        build_as_nobody: bool,
        timeouts: PlanTimeouts,
    ) -> PlannerResult<Plan> {
        let mut arena: Vec<TaskItem> = Vec::new();
        let mut by_pkgname: HashMap<String, usize> = HashMap::new();

        let default_flavor = self.get_port_default_flavor(origin).await?;
        let mut queue = vec![QueueItem {
            port: Some(Port::new(origin.to_string(), default_flavor)),
            pkgname: None,
            consumer: None,
        }];

        let mut queue_pos = 0;
        while queue_pos < queue.len() {
            // Resolve the missing half of (port, pkgname) for this item
            // before indexing, without holding a live borrow of `queue`
            // across the awaits below.
            let port = queue[queue_pos].port.clone();
            let pkgname = queue[queue_pos].pkgname.clone();
            let consumer = queue[queue_pos].consumer;
            queue_pos += 1;

            let pkgname = match pkgname {
                Some(p) => p,
                None => {
                    let port = port.clone().expect("either port or pkgname is set");
                    self.get_port_package_name(&port).await?
                }
            };

            if let Some(&idx) = by_pkgname.get(&pkgname) {
                arena[idx].consumers.push(consumer);
                continue;
            }

            let mut manifest = self.repository.by_name(&pkgname).await?;
            let port = match port {
                Some(p) => p,
                None => {
                    let m = manifest
                        .as_ref()
                        .ok_or_else(|| PlannerError::MissingManifest(pkgname.clone()))?;
                    m.port()
                }
            };

            let want_testing = port.origin() == origin;
            let prefer_package = !want_testing && !origins_to_rebuild.contains(port.origin());

            if prefer_package {
                if manifest.is_none() {
                    manifest = self.repository.by_name(&pkgname).await?;
                }

                if let Some(info) = manifest {
                    let deps = info.deps.clone().unwrap_or_default();
                    let idx = arena.len();
                    arena.push(TaskItem {
                        task: Task::Package(PackageTask {
                            info,
                            repository: self.repository.clone(),
                            executor: self.executor.clone(),
                        }),
                        consumers: vec![consumer],
                        visited: false,
                    });
                    by_pkgname.insert(pkgname.clone(), idx);
                    for dep_pkgname in deps {
                        queue.push(QueueItem {
                            port: None,
                            pkgname: Some(dep_pkgname),
                            consumer: Some(idx),
                        });
                    }
                    continue;
                }
            }

            let port_depends = self.get_port_depends(&port).await?;
            let idx = arena.len();
            arena.push(TaskItem {
                task: Task::Port(PortTask {
                    port: port.clone(),
                    do_test: want_testing,
                    build_as_nobody,
                    fetch_timeout_secs: timeouts.fetch_secs,
                    build_timeout_secs: timeouts.build_secs,
                    test_timeout_secs: timeouts.test_secs,
                }),
                consumers: vec![consumer],
                visited: false,
            });
            by_pkgname.insert(pkgname.clone(), idx);

            for dep in port_depends.depends {
                queue.push(QueueItem {
                    port: Some(dep),
                    pkgname: None,
                    consumer: Some(idx),
                });
            }
            if want_testing {
                // TEST_DEPENDS never introduce a consumer edge: doing so
                // could create a cycle back through the target port.
                for dep in port_depends.test_depends {
                    queue.push(QueueItem {
                        port: Some(dep),
                        pkgname: None,
                        consumer: None,
                    });
                }
            }
        }

        Ok(Plan::new(topological_sort(arena)))
    }
}

/// Timeouts to stamp onto every `PortTask` discovered during planning.
#[derive(Debug, Clone, Copy)]
pub struct PlanTimeouts {
    pub fetch_secs: u64,
    pub build_secs: u64,
    pub test_secs: u64,
}

/// Iterative reverse-postorder DFS over the consumer edges, equivalent
/// to the original's recursive `toposort`, expressed without recursion
/// since the arena holds plain indices rather than reference cycles.
fn topological_sort(mut arena: Vec<TaskItem>) -> Vec<Task> {
    let mut order: Vec<usize> = Vec::with_capacity(arena.len());

    for start in 0..arena.len() {
        if arena[start].visited {
            continue;
        }
        // (index, next consumer slot to visit)
        let mut stack = vec![(start, 0usize)];
        arena[start].visited = true;

        while let Some((idx, next)) = stack.last().copied() {
            let consumers = &arena[idx].consumers;
            if next < consumers.len() {
                stack.last_mut().unwrap().1 += 1;
                if let Some(c) = consumers[next] {
                    if !arena[c].visited {
                        arena[c].visited = true;
                        stack.push((c, 0));
                    }
                }
            } else {
                order.push(idx);
                stack.pop();
            }
        }
    }

    // Splice tasks out of the arena in reverse post-order: a node is
    // pushed onto `order` only after all its consumers, so the target
    // (consumed by nothing) is pushed last and must come first.
    let mut slots: Vec<Option<Task>> = arena.into_iter().map(|item| Some(item.task)).collect();
    order
        .into_iter()
        .rev()
        .map(|idx| slots[idx].take().expect("each arena slot visited at most once"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depend_to_port_parses_origin_and_flavor() {
        assert_eq!(
            depend_to_port("lib/libfoo.so:ftp/curl:build"),
            Some(Port::new("ftp/curl", None))
        );
        assert_eq!(
            depend_to_port("lib/libfoo.so:lang/python@py311:build"),
            Some(Port::new("lang/python", Some("py311".to_string())))
        );
    }

    #[test]
    fn depend_to_port_rejects_malformed_input() {
        assert_eq!(depend_to_port("no-colons-here"), None);
    }

    #[test]
    fn topological_sort_orders_dependency_before_consumer() {
        // task 1 (a leaf) is consumed by task 0 (the root); the sort
        // must place 1 before 0.
        let arena = vec![
            TaskItem {
                task: Task::Port(PortTask {
                    port: Port::new("cat/root", None),
                    do_test: true,
                    build_as_nobody: false,
                    fetch_timeout_secs: 1,
                    build_timeout_secs: 1,
                    test_timeout_secs: 1,
                }),
                consumers: vec![None],
                visited: false,
            },
            TaskItem {
                task: Task::Port(PortTask {
                    port: Port::new("cat/dep", None),
                    do_test: false,
                    build_as_nobody: false,
                    fetch_timeout_secs: 1,
                    build_timeout_secs: 1,
                    test_timeout_secs: 1,
                }),
                consumers: vec![Some(0)],
                visited: false,
            },
        ];
        let tasks = topological_sort(arena);
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].label().contains("cat/dep"));
        assert!(tasks[1].label().contains("cat/root"));
    }
}
