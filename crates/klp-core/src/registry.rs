//! Codestream registry.
//!
//! Maps codestreams to the private build-service projects klp-build owns
//! (`home:<user>:<bsc>-klp-<cs>`, with `.` written as `_`) and applies the
//! operator's codestream filter to both local and remote sets.

use std::sync::Arc;

use obs_client::{BuildService, ProjectEntry};
use regex::Regex;
use tracing::debug;

use crate::codestream::{CodestreamMap, CodestreamTuple};
use crate::error::{KlpError, Result};

/// Repository every pushed project defines.
pub const DEVBUILD_REPO: &str = "devbuild";

/// Package holding the livepatch inside a pushed project.
pub const KLP_PACKAGE: &str = "klp";

/// Operator-supplied codestream filter.
///
/// The pattern is matched at the start of the canonical identifier, so
/// `15.2` selects every SLE 15 SP2 update. No pattern accepts everything.
#[derive(Debug, Clone, Default)]
pub struct CodestreamFilter {
    regex: Option<Regex>,
}

impl CodestreamFilter {
    /// Compile `pattern`; a malformed pattern is rejected here, before any
    /// remote call is made.
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let regex = pattern
            .map(|p| {
                Regex::new(&format!("^(?:{p})")).map_err(|source| KlpError::InvalidFilter {
                    pattern: p.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(CodestreamFilter { regex })
    }

    pub fn matches(&self, cs: &str) -> bool {
        self.regex.as_ref().map_or(true, |re| re.is_match(cs))
    }
}

/// Project naming and lookup for one bug.
pub struct Registry {
    service: Arc<dyn BuildService>,
    user: String,
    prefix: String,
    filter: CodestreamFilter,
}

impl Registry {
    /// `user` is the build-service account, `bsc` the bug id (`bsc1234567`).
    pub fn new(
        service: Arc<dyn BuildService>,
        user: &str,
        bsc: &str,
        filter: CodestreamFilter,
    ) -> Self {
        Registry {
            service,
            user: user.to_string(),
            prefix: format!("home:{user}:{bsc}-klp"),
            filter,
        }
    }

    pub fn service(&self) -> &Arc<dyn BuildService> {
        &self.service
    }

    /// Build service account owning the projects.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// `15.2u25` -> `home:<user>:<bsc>-klp-15_2u25`
    pub fn project_for(&self, cs: &str) -> String {
        format!("{}-{}", self.prefix, cs.replace('.', "_"))
    }

    /// Inverse of [`Registry::project_for`].
    pub fn codestream_for(&self, project: &str) -> String {
        project
            .strip_prefix(&format!("{}-", self.prefix))
            .unwrap_or(project)
            .replace('_', ".")
    }

    fn selects(&self, project: &str) -> bool {
        self.filter.matches(&self.codestream_for(project))
    }

    /// Keep the project names whose codestream passes the filter.
    pub fn filter_projects<S: AsRef<str>>(&self, projects: &[S]) -> Vec<String> {
        projects
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| self.selects(p))
            .map(str::to_string)
            .collect()
    }

    pub fn filter_codestreams(&self, codestreams: &CodestreamMap) -> CodestreamMap {
        codestreams.retain(|cs| self.filter.matches(&cs.id))
    }

    /// Remote projects under our prefix that pass the filter, in
    /// natural codestream order.
    pub async fn list_projects(&self) -> Result<Vec<ProjectEntry>> {
        let mut projects: Vec<ProjectEntry> = self
            .service
            .search_projects(&self.prefix)
            .await?
            .into_iter()
            .filter(|p| self.selects(&p.name))
            .collect();

        projects.sort_by_key(|p| {
            let cs = self.codestream_for(&p.name);
            (cs.parse::<CodestreamTuple>().ok(), p.name.clone())
        });
        debug!("{} projects under {}", projects.len(), self.prefix);
        Ok(projects)
    }

    pub async fn project_names(&self) -> Result<Vec<String>> {
        Ok(self
            .list_projects()
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::sample;
    use obs_client::fakes::MemoryBuildService;

    fn registry(service: Arc<MemoryBuildService>, pattern: Option<&str>) -> Registry {
        Registry::new(
            service,
            "jdoe",
            "bsc1234567",
            CodestreamFilter::new(pattern).unwrap(),
        )
    }

    #[test]
    fn test_project_name_round_trip() {
        let reg = registry(Arc::new(MemoryBuildService::new()), None);
        let prj = reg.project_for("15.2u25");
        assert_eq!(prj, "home:jdoe:bsc1234567-klp-15_2u25");
        assert_eq!(reg.codestream_for(&prj), "15.2u25");
    }

    #[test]
    fn test_malformed_filter_fails_fast() {
        let err = CodestreamFilter::new(Some("15.(2")).unwrap_err();
        assert!(matches!(err, KlpError::InvalidFilter { .. }));
        assert!(err.to_string().contains("15.(2"));
    }

    #[test]
    fn test_filter_matches_at_start_only() {
        let filter = CodestreamFilter::new(Some("15.2")).unwrap();
        assert!(filter.matches("15.2u25"));
        assert!(!filter.matches("12.5u15.2"));
        assert!(CodestreamFilter::new(None).unwrap().matches("anything"));
    }

    #[test]
    fn test_filter_projects_preserves_order() {
        let reg = registry(Arc::new(MemoryBuildService::new()), Some("15.2"));
        let projects = vec![
            reg.project_for("15.2u30"),
            reg.project_for("12.5u5"),
            reg.project_for("15.2u25"),
            reg.project_for("15.3u1"),
        ];

        let kept = reg.filter_projects(&projects);
        assert_eq!(kept, vec![projects[0].clone(), projects[2].clone()]);
    }

    #[test]
    fn test_no_filter_is_identity() {
        let reg = registry(Arc::new(MemoryBuildService::new()), None);
        let projects = vec![reg.project_for("15.3u1"), reg.project_for("12.5u5")];
        assert_eq!(reg.filter_projects(&projects), projects);
    }

    #[test]
    fn test_filter_codestreams() {
        let reg = registry(Arc::new(MemoryBuildService::new()), Some("15"));
        let map = CodestreamMap::new(vec![
            sample("12.5u5", &["x86_64"]),
            sample("15.2u25", &["x86_64"]),
        ]);
        assert_eq!(reg.filter_codestreams(&map).ids(), vec!["15.2u25"]);
    }

    #[tokio::test]
    async fn test_list_projects_filters_and_sorts_naturally() {
        let service = Arc::new(MemoryBuildService::new());
        let reg = registry(service.clone(), Some("15.2"));
        for cs in ["15.2u10", "15.2u9", "12.5u5"] {
            service.add_project(&reg.project_for(cs), "devbuild", &["x86_64"]);
        }
        service.add_project("home:someone:else", "devbuild", &["x86_64"]);

        let names = reg.project_names().await.unwrap();
        assert_eq!(
            names,
            vec![reg.project_for("15.2u9"), reg.project_for("15.2u10")]
        );
    }
}
