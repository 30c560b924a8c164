//! Build status poller.
//!
//! Each round fetches the per-architecture build codes of every tracked
//! project and prints one summary line per project. A project whose
//! architectures all reached a terminal code is dropped from later rounds.
//! In wait mode rounds repeat every [`POLL_INTERVAL`] until nothing is left
//! to track; the delay goes through a [`Sleeper`] so tests run instantly.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obs_client::ArchResult;
use tracing::{error, info};

use crate::error::Result;
use crate::registry::Registry;

pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Build state of one architecture of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Building,
    Succeeded,
    Failed,
    Unresolvable,
    /// A code this tool does not know; never terminal.
    Unknown,
}

impl BuildStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "scheduled" | "blocked" => BuildStatus::Pending,
            "building" | "dispatching" | "finished" | "signing" => BuildStatus::Building,
            "succeeded" => BuildStatus::Succeeded,
            "failed" => BuildStatus::Failed,
            "unresolvable" => BuildStatus::Unresolvable,
            _ => BuildStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Unresolvable
        )
    }
}

/// Delay between polling rounds.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Codes reported for one project in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectStatus {
    pub project: String,
    pub results: Vec<ArchResult>,
}

impl ProjectStatus {
    /// Every architecture is terminal. No results at all means the service
    /// has not scheduled anything yet.
    pub fn is_finished(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| BuildStatus::from_code(&r.code).is_terminal())
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.project)?;
        for r in &self.results {
            write!(f, "\t{}: {}", r.arch, r.code)?;
        }
        Ok(())
    }
}

/// Projects that reached a terminal state and are no longer polled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollState {
    finished: BTreeSet<String>,
}

impl PollState {
    pub fn is_finished(&self, project: &str) -> bool {
        self.finished.contains(project)
    }

    pub fn finished(&self) -> impl Iterator<Item = &str> {
        self.finished.iter().map(String::as_str)
    }
}

pub struct StatusPoller {
    registry: Arc<Registry>,
    sleeper: Arc<dyn Sleeper>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(registry: Arc<Registry>) -> Self {
        StatusPoller {
            registry,
            sleeper: Arc::new(TokioSleeper),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// One polling round over the projects not yet finished.
    ///
    /// Returns `None` once no tracked project is left, otherwise the
    /// statuses fetched this round. A project whose results cannot be
    /// fetched is logged and stays tracked for the next round.
    pub async fn round(&self, state: &mut PollState) -> Result<Option<Vec<ProjectStatus>>> {
        let service = self.registry.service();
        let tracked: Vec<String> = self
            .registry
            .project_names()
            .await?
            .into_iter()
            .filter(|project| !state.is_finished(project))
            .collect();
        if tracked.is_empty() {
            return Ok(None);
        }

        let mut polled = Vec::new();
        for project in tracked {
            let results = match service.build_results(&project).await {
                Ok(results) => results,
                Err(e) => {
                    error!("{}: {}", project, e);
                    continue;
                }
            };
            let status = ProjectStatus { project, results };
            info!("{}", status);

            if status.is_finished() {
                state.finished.insert(status.project.clone());
            }
            polled.push(status);
        }
        Ok(Some(polled))
    }

    /// Poll once, or with `wait` until every project is finished.
    pub async fn run(&self, wait: bool) -> Result<PollState> {
        let mut state = PollState::default();
        while self.round(&mut state).await?.is_some() && wait {
            self.sleeper.sleep(self.interval).await;
            info!("");
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::InstantSleeper;
    use crate::registry::CodestreamFilter;
    use obs_client::fakes::MemoryBuildService;

    fn poller(service: Arc<MemoryBuildService>) -> (StatusPoller, Arc<Registry>, Arc<InstantSleeper>) {
        let registry = Arc::new(Registry::new(
            service,
            "jdoe",
            "bsc1234567",
            CodestreamFilter::default(),
        ));
        let sleeper = Arc::new(InstantSleeper::new());
        let poller = StatusPoller::new(Arc::clone(&registry)).with_sleeper(sleeper.clone());
        (poller, registry, sleeper)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(BuildStatus::from_code("blocked"), BuildStatus::Pending);
        assert_eq!(BuildStatus::from_code("signing"), BuildStatus::Building);
        assert_eq!(BuildStatus::from_code("bogus"), BuildStatus::Unknown);
        assert!(BuildStatus::from_code("unresolvable").is_terminal());
        assert!(!BuildStatus::from_code("finished").is_terminal());
        assert!(!BuildStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_summary_line_prints_raw_codes() {
        let status = ProjectStatus {
            project: "home:jdoe:bsc1-klp-15_2u25".to_string(),
            results: vec![
                ArchResult::new("x86_64", "succeeded"),
                ArchResult::new("ppc64le", "dispatching"),
            ],
        };
        assert_eq!(
            status.to_string(),
            "home:jdoe:bsc1-klp-15_2u25\tx86_64: succeeded\tppc64le: dispatching"
        );
        assert!(!status.is_finished());
    }

    #[test]
    fn test_no_results_is_not_finished() {
        let status = ProjectStatus {
            project: "p".to_string(),
            results: vec![],
        };
        assert!(!status.is_finished());
    }

    #[tokio::test]
    async fn test_single_round_without_wait() {
        let service = Arc::new(MemoryBuildService::new());
        let (poller, registry, sleeper) = poller(service.clone());
        let prj = registry.project_for("15.2u25");
        service.add_project(&prj, "devbuild", &["x86_64"]);
        service.push_results(&prj, vec![ArchResult::new("x86_64", "building")]);

        let state = poller.run(false).await.unwrap();
        assert!(!state.is_finished(&prj));
        assert_eq!(service.result_queries(&prj), 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_finished_project_polled_exactly_once() {
        let service = Arc::new(MemoryBuildService::new());
        let (poller, registry, sleeper) = poller(service.clone());
        let prj = registry.project_for("15.2u25");
        service.add_project(&prj, "devbuild", &["x86_64", "ppc64le"]);
        service.push_results(
            &prj,
            vec![
                ArchResult::new("x86_64", "succeeded"),
                ArchResult::new("ppc64le", "succeeded"),
            ],
        );

        let state = poller.run(true).await.unwrap();
        assert!(state.is_finished(&prj));
        assert_eq!(service.result_queries(&prj), 1);
        assert_eq!(sleeper.sleeps(), vec![POLL_INTERVAL]);
    }

    #[tokio::test]
    async fn test_wait_until_all_terminal() {
        let service = Arc::new(MemoryBuildService::new());
        let (poller, registry, sleeper) = poller(service.clone());
        let fast = registry.project_for("15.2u25");
        let slow = registry.project_for("15.3u1");
        service.add_project(&fast, "devbuild", &["x86_64"]);
        service.add_project(&slow, "devbuild", &["x86_64"]);

        service.push_results(&fast, vec![ArchResult::new("x86_64", "failed")]);
        service.push_results(&slow, vec![ArchResult::new("x86_64", "scheduled")]);
        service.push_results(&slow, vec![ArchResult::new("x86_64", "building")]);
        service.push_results(&slow, vec![ArchResult::new("x86_64", "unresolvable")]);

        let state = poller.run(true).await.unwrap();
        assert_eq!(state.finished().count(), 2);
        assert_eq!(service.result_queries(&fast), 1);
        assert_eq!(service.result_queries(&slow), 3);
        assert_eq!(sleeper.sleeps().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_results_keep_project_tracked() {
        let service = Arc::new(MemoryBuildService::new());
        let (poller, registry, sleeper) = poller(service.clone());
        let prj = registry.project_for("15.2u25");
        service.add_project(&prj, "devbuild", &["x86_64"]);
        service.break_results(&prj, 2);
        service.push_results(&prj, vec![ArchResult::new("x86_64", "succeeded")]);

        let state = poller.run(true).await.unwrap();
        assert!(state.is_finished(&prj));
        assert_eq!(service.result_queries(&prj), 3);
        assert_eq!(sleeper.sleeps().len(), 3);
    }

    #[tokio::test]
    async fn test_round_reports_failed_fetch_as_empty_round() {
        let service = Arc::new(MemoryBuildService::new());
        let (poller, registry, _) = poller(service.clone());
        let prj = registry.project_for("15.2u25");
        service.add_project(&prj, "devbuild", &["x86_64"]);
        service.break_results(&prj, 1);

        let mut state = PollState::default();
        let polled = poller.round(&mut state).await.unwrap();
        assert_eq!(polled, Some(vec![]));
        assert!(!state.is_finished(&prj));
    }

    #[tokio::test]
    async fn test_no_projects_ends_immediately() {
        let service = Arc::new(MemoryBuildService::new());
        let (poller, _, sleeper) = poller(service.clone());

        let mut state = PollState::default();
        assert_eq!(poller.round(&mut state).await.unwrap(), None);
        poller.run(true).await.unwrap();
        assert!(sleeper.sleeps().is_empty());
    }
}
