//! The build job graph.
//!
//! A build is a set of jobs with declared dependencies, somewhat like an
//! in-memory Makefile: package compiles are leaves, the link+optimize job
//! depends on all of them, and the final link consumes everything that
//! produces an object file. A job starts only after every declared
//! dependency has succeeded; independent jobs run in parallel on OS
//! threads. The first failure stops all further scheduling (jobs already
//! in flight complete) and is returned to the caller.
//!
//! Each job's action receives the results of its dependencies in
//! declaration order and produces a result string of its own, typically a
//! filesystem path consumed by dependent jobs.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread;

use tracing::debug;

use crate::error::BuildError;

/// Identifier of a job within one [`JobGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobId(usize);

type Action<'a> = Box<dyn FnOnce(&[String]) -> Result<String, BuildError> + Send + 'a>;

struct JobEntry<'a> {
    description: String,
    dependencies: Vec<JobId>,
    action: Option<Action<'a>>,
}

/// A dependency-ordered collection of build jobs.
#[derive(Default)]
pub struct JobGraph<'a> {
    jobs: Vec<JobEntry<'a>>,
}

impl<'a> JobGraph<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Add a job. Dependencies must already be part of the graph, which
    /// also rules out cycles by construction.
    pub fn add<F>(
        &mut self,
        description: impl Into<String>,
        dependencies: Vec<JobId>,
        action: F,
    ) -> JobId
    where
        F: FnOnce(&[String]) -> Result<String, BuildError> + Send + 'a,
    {
        let id = JobId(self.jobs.len());
        for dep in &dependencies {
            assert!(dep.0 < id.0, "job dependency added after its dependent");
        }
        self.jobs.push(JobEntry {
            description: description.into(),
            dependencies,
            action: Some(Box::new(action)),
        });
        id
    }

    /// Number of jobs in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job, honoring dependencies, with at most `workers` jobs in
    /// flight. Returns the per-job results indexed by [`JobId`] order, or
    /// the first error encountered.
    pub fn run(mut self, workers: usize) -> Result<Vec<String>, BuildError> {
        let total = self.jobs.len();
        let workers = workers.max(1);

        let mut remaining: Vec<usize> =
            self.jobs.iter().map(|job| job.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
        for (idx, job) in self.jobs.iter().enumerate() {
            for dep in &job.dependencies {
                dependents[dep.0].push(idx);
            }
        }

        let mut ready: VecDeque<usize> = (0..total).filter(|&i| remaining[i] == 0).collect();
        let mut results: Vec<Option<String>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<BuildError> = None;
        let mut completed = 0usize;

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<String, BuildError>)>();
            let mut running = 0usize;
            loop {
                while first_error.is_none() && running < workers {
                    let Some(idx) = ready.pop_front() else { break };
                    let action = self.jobs[idx]
                        .action
                        .take()
                        .expect("job scheduled twice");
                    let dep_results: Vec<String> = self.jobs[idx]
                        .dependencies
                        .iter()
                        .map(|dep| results[dep.0].clone().expect("dependency without result"))
                        .collect();
                    let description = self.jobs[idx].description.clone();
                    let tx = tx.clone();
                    running += 1;
                    scope.spawn(move || {
                        debug!("job: {description}");
                        let outcome = action(&dep_results);
                        // The receiver only disappears after all workers
                        // finished, so this send cannot fail.
                        let _ = tx.send((idx, outcome));
                    });
                }

                if running == 0 {
                    break;
                }
                let (idx, outcome) = rx.recv().expect("worker channel closed");
                running -= 1;
                match outcome {
                    Ok(result) => {
                        completed += 1;
                        results[idx] = Some(result);
                        for &dependent in &dependents[idx] {
                            remaining[dependent] -= 1;
                            if remaining[dependent] == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
        });

        if let Some(err) = first_error {
            return Err(err);
        }
        assert!(completed == total, "job graph contains a cycle");
        Ok(results.into_iter().map(Option::unwrap).collect())
    }
}

/// Default worker count: one per available CPU.
#[must_use]
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
