//! Concurrent work dispatcher.
//!
//! Runs a batch of independent tasks on a bounded pool sized to the host's
//! CPU parallelism. A failing task is logged and counted; it never cancels or
//! blocks its siblings, and [`Dispatcher::run_all`] returns only once every
//! task has finished.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::{KlpError, Result};

/// A unit of work the dispatcher can report on.
pub trait Task: Send + 'static {
    /// Short description used in progress lines, e.g. `15.2u25 kernel-default-...rpm`.
    fn subject(&self) -> String;
}

/// Successful task outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Nothing to do; the desired state already held.
    Skipped,
}

/// Position of a task within its batch, rendered as `(i/total)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}/{})", self.index, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub subject: String,
    pub error: String,
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: Vec<TaskFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Count and log the outcome of one task as
    /// `(i/total) <subject>: ok|skipped|<error>`.
    pub fn record(&mut self, progress: Progress, subject: String, result: Result<TaskOutcome>) {
        match result {
            Ok(TaskOutcome::Done) => {
                info!("{} {}: ok", progress, subject);
                self.done += 1;
            }
            Ok(TaskOutcome::Skipped) => {
                info!("{} {}: skipped", progress, subject);
                self.skipped += 1;
            }
            Err(e) => {
                error!("{} {}: {}", progress, subject, e);
                self.failed.push(TaskFailure {
                    subject,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Fold another batch into this one.
    pub fn merge(&mut self, other: BatchReport) {
        self.total += other.total;
        self.done += other.done;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }
}

/// Bounded worker pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    workers: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Pool sized to the available CPU parallelism.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Dispatcher { workers }
    }

    pub fn with_workers(workers: usize) -> Self {
        Dispatcher {
            workers: workers.max(1),
        }
    }

    /// Run `worker` over every task and wait for all of them.
    ///
    /// Each outcome is logged as `(i/total) <subject>: ok|skipped|<error>`.
    /// A worker that panics is recorded as failed like any other error.
    pub async fn run_all<T, F, Fut>(&self, tasks: Vec<T>, worker: F) -> BatchReport
    where
        T: Task,
        F: Fn(T, Progress) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
    {
        let total = tasks.len();
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        if total == 0 {
            return report;
        }

        let worker = Arc::new(worker);
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();

        for (i, task) in tasks.into_iter().enumerate() {
            let progress = Progress {
                index: i + 1,
                total,
            };
            let subject = task.subject();
            let worker = Arc::clone(&worker);
            let sem = Arc::clone(&sem);

            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                // Inner spawn isolates panics so the subject is still known.
                let result = match tokio::spawn(worker(task, progress)).await {
                    Ok(result) => result,
                    Err(e) => Err(KlpError::Task(e.to_string())),
                };
                (progress, subject, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (progress, subject, result) = match joined {
                Ok(entry) => entry,
                Err(e) => {
                    error!("dispatcher task lost: {}", e);
                    report.failed.push(TaskFailure {
                        subject: String::from("<unknown>"),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            report.record(progress, subject, result);
        }

        report
    }
}
