//! # Task Graph
//!
//! A small DAG runner: steps declare predecessors, independent steps run
//! concurrently, and the first failure cancels everything still running.
//!
//! ```text
//!   step("a", [])      ─┐
//!                       ├──► step("c", ["a", "b"])  receives outputs of a, b
//!   step("b", [])      ─┘
//!
//!   a fails ──► b aborted, c never starts, run() returns Step { "a", err }
//! ```
//!
//! Steps are spawned on a `JoinSet`, so a cancelled step is dropped at its
//! next await point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

type StepFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type StepFn<T, E> = Box<dyn FnOnce(StepInputs<T>) -> StepFuture<T, E> + Send>;

/// Outputs of a step's declared predecessors.
#[derive(Debug)]
pub struct StepInputs<T> {
    outputs: HashMap<&'static str, T>,
}

impl<T> StepInputs<T> {
    /// Output of predecessor `name`, if it was declared.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.outputs.get(name)
    }
}

/// The graph itself is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Step '{0}' is declared twice")]
    DuplicateStep(&'static str),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        step: &'static str,
        dependency: &'static str,
    },

    #[error("Dependency cycle among steps {0:?}")]
    Cycle(Vec<&'static str>),
}

/// Why a graph run stopped early.
#[derive(Debug)]
pub enum GraphFailure<E> {
    /// The graph could not be scheduled.
    Invalid(GraphError),

    /// A step returned an error.
    Step { name: &'static str, error: E },

    /// A step panicked.
    Panicked(String),
}

struct Node<T, E> {
    name: &'static str,
    deps: Vec<&'static str>,
    run: StepFn<T, E>,
}

/// A set of steps with declared predecessors.
pub struct TaskGraph<T, E> {
    nodes: Vec<Node<T, E>>,
}

impl<T, E> Default for TaskGraph<T, E> {
    fn default() -> Self {
        TaskGraph { nodes: Vec::new() }
    }
}

impl<T, E> TaskGraph<T, E>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step that runs once every step in `deps` has succeeded.
    pub fn step<F, Fut>(mut self, name: &'static str, deps: &[&'static str], run: F) -> Self
    where
        F: FnOnce(StepInputs<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.nodes.push(Node {
            name,
            deps: deps.to_vec(),
            run: Box::new(move |inputs| Box::pin(run(inputs))),
        });
        self
    }

    /// Checks the graph and returns one valid execution order.
    pub fn validate(&self) -> Result<Vec<&'static str>, GraphError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name) {
                return Err(GraphError::DuplicateStep(node.name));
            }
        }
        for node in &self.nodes {
            if let Some(dependency) = node.deps.iter().find(|d| !names.contains(*d)) {
                return Err(GraphError::UnknownDependency {
                    step: node.name,
                    dependency: *dependency,
                });
            }
        }

        // Kahn's algorithm.
        let mut remaining: HashMap<&'static str, usize> =
            self.nodes.iter().map(|n| (n.name, n.deps.len())).collect();
        let mut ready: VecDeque<&'static str> = self
            .nodes
            .iter()
            .filter(|n| n.deps.is_empty())
            .map(|n| n.name)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = ready.pop_front() {
            order.push(name);
            for node in self.nodes.iter().filter(|n| n.deps.contains(&name)) {
                if let Some(count) = remaining.get_mut(node.name) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(node.name);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let mut stuck: Vec<&'static str> = self
                .nodes
                .iter()
                .map(|n| n.name)
                .filter(|n| !order.contains(n))
                .collect();
            stuck.sort_unstable();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Runs every step, returning all outputs by step name.
    pub async fn run(self) -> Result<HashMap<&'static str, T>, GraphFailure<E>> {
        self.validate().map_err(GraphFailure::Invalid)?;

        let mut waiting: Vec<Node<T, E>> = self.nodes;
        let mut done: HashMap<&'static str, T> = HashMap::new();
        let mut running: JoinSet<(&'static str, Result<T, E>)> = JoinSet::new();

        loop {
            let (ready, still_waiting): (Vec<_>, Vec<_>) = waiting
                .into_iter()
                .partition(|n| n.deps.iter().all(|d| done.contains_key(d)));
            waiting = still_waiting;

            for node in ready {
                let outputs = node
                    .deps
                    .iter()
                    .filter_map(|d| done.get(d).map(|v| (*d, v.clone())))
                    .collect();
                debug!(step = node.name, "Starting step");
                let name = node.name;
                let fut = (node.run)(StepInputs { outputs });
                running.spawn(async move { (name, fut.await) });
            }

            match running.join_next().await {
                None => break,
                Some(Ok((name, Ok(value)))) => {
                    debug!(step = name, "Step finished");
                    done.insert(name, value);
                }
                Some(Ok((name, Err(error)))) => {
                    warn!(step = name, "Step failed, cancelling remaining steps");
                    running.abort_all();
                    return Err(GraphFailure::Step { name, error });
                }
                Some(Err(join_error)) => {
                    running.abort_all();
                    return Err(GraphFailure::Panicked(join_error.to_string()));
                }
            }
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[test]
    fn test_validation() {
        let g: TaskGraph<u32, ()> = TaskGraph::new()
            .step("a", &[], |_| async { Ok(1) })
            .step("b", &["a"], |_| async { Ok(2) });
        assert_eq!(g.validate().unwrap(), vec!["a", "b"]);

        let dup: TaskGraph<u32, ()> = TaskGraph::new()
            .step("a", &[], |_| async { Ok(1) })
            .step("a", &[], |_| async { Ok(1) });
        assert_eq!(dup.validate(), Err(GraphError::DuplicateStep("a")));

        let unknown: TaskGraph<u32, ()> = TaskGraph::new().step("a", &["zzz"], |_| async { Ok(1) });
        assert!(matches!(
            unknown.validate(),
            Err(GraphError::UnknownDependency { dependency: "zzz", .. })
        ));

        let cycle: TaskGraph<u32, ()> = TaskGraph::new()
            .step("root", &[], |_| async { Ok(0) })
            .step("a", &["b"], |_| async { Ok(1) })
            .step("b", &["a"], |_| async { Ok(2) });
        assert_eq!(cycle.validate(), Err(GraphError::Cycle(vec!["a", "b"])));
    }

    #[tokio::test]
    async fn test_dependents_receive_outputs() {
        let g: TaskGraph<u32, String> = TaskGraph::new()
            .step("a", &[], |_| async { Ok(2) })
            .step("b", &[], |_| async { Ok(3) })
            .step("c", &["a", "b"], |inputs| async move {
                let a = inputs.get("a").copied().unwrap_or_default();
                let b = inputs.get("b").copied().unwrap_or_default();
                Ok(a * b)
            });

        let outputs = g.run().await.unwrap();
        assert_eq!(outputs["c"], 6);
        assert_eq!(outputs.len(), 3);
    }

    #[tokio::test]
    async fn test_independent_steps_run_concurrently() {
        // Each step waits for the other; sequential execution would hang.
        let barrier = Arc::new(Barrier::new(2));
        let (b1, b2) = (barrier.clone(), barrier);
        let g: TaskGraph<(), ()> = TaskGraph::new()
            .step("left", &[], move |_| async move {
                b1.wait().await;
                Ok(())
            })
            .step("right", &[], move |_| async move {
                b2.wait().await;
                Ok(())
            });

        tokio::time::timeout(Duration::from_secs(5), g.run())
            .await
            .expect("steps did not run concurrently")
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_failure_cancels_siblings_and_dependents() {
        let sibling_finished = Arc::new(AtomicBool::new(false));
        let dependent_started = Arc::new(AtomicBool::new(false));
        let (sf, ds) = (sibling_finished.clone(), dependent_started.clone());

        let g: TaskGraph<(), &'static str> = TaskGraph::new()
            .step("fails", &[], |_| async { Err("boom") })
            .step("slow", &[], move |_| async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                sf.store(true, Ordering::SeqCst);
                Ok(())
            })
            .step("after", &["fails"], move |_| async move {
                ds.store(true, Ordering::SeqCst);
                Ok(())
            });

        match g.run().await {
            Err(GraphFailure::Step { name, error }) => {
                assert_eq!(name, "fails");
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!sibling_finished.load(Ordering::SeqCst));
        assert!(!dependent_started.load(Ordering::SeqCst));
    }
}
