//! Package publisher.
//!
//! Pushes one build-service project per codestream: the project is
//! recreated from scratch, the patch branch is cloned from the local patch
//! source tree, packaged with the tree's own `tar-up.sh` and committed to
//! the `klp` package. Projects are mutated strictly one after another; the
//! service answers concurrent project mutations with server errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use obs_client::{BuildService, DeleteOutcome, ProjectMeta, RepositoryPath};
use tracing::{debug, info};

use crate::codestream::{Codestream, CodestreamMap};
use crate::dispatcher::{BatchReport, Progress, TaskOutcome};
use crate::error::{KlpError, Result};
use crate::git;
use crate::layout::{ensure_dir, remove_tree, Layout};
use crate::poller::{StatusPoller, POLL_INTERVAL};
use crate::registry::{Registry, DEVBUILD_REPO, KLP_PACKAGE};
use crate::tools::{path_arg, run_command};

const PACKAGE_DESCRIPTION: &str = "Test livepatch";

pub struct Publisher {
    registry: Arc<Registry>,
    layout: Layout,
    bsc: String,
    patches_dir: PathBuf,
    poller: StatusPoller,
}

impl Publisher {
    /// `patches_dir` is the local patch source tree holding one branch per
    /// codestream, named `<bsc>_<cs>`.
    pub fn new(
        registry: Arc<Registry>,
        layout: Layout,
        bsc: &str,
        patches_dir: impl Into<PathBuf>,
        poller: StatusPoller,
    ) -> Self {
        Publisher {
            registry,
            layout,
            bsc: bsc.to_string(),
            patches_dir: patches_dir.into(),
            poller,
        }
    }

    fn service(&self) -> &Arc<dyn BuildService> {
        self.registry.service()
    }

    pub fn branch_for(&self, cs: &str) -> String {
        format!("{}_{}", self.bsc, cs)
    }

    /// Metadata for the project of `cs`: build enabled, publish and
    /// debuginfo disabled, one repository building on the codestream's
    /// upstream repository for each of its architectures.
    pub fn project_meta(&self, cs: &Codestream) -> ProjectMeta {
        ProjectMeta {
            name: self.registry.project_for(&cs.id),
            title: String::new(),
            description: format!("Development of livepatches for {}", cs.id),
            owner: self.registry.user().to_string(),
            repository: DEVBUILD_REPO.to_string(),
            path: RepositoryPath {
                project: cs.project.clone(),
                repository: cs.repo.clone(),
            },
            archs: cs.archs.clone(),
        }
    }

    /// Push every codestream passing the filter.
    ///
    /// An empty selection is an error. With `wait`, the build results are
    /// polled until every project finished, then reported once more.
    pub async fn push(&self, codestreams: &CodestreamMap, wait: bool) -> Result<BatchReport> {
        let selected = self.registry.filter_codestreams(codestreams);
        if selected.is_empty() {
            return Err(KlpError::Config(format!(
                "push: No codestreams found for {}",
                self.bsc
            )));
        }

        let total = selected.len();
        info!("Preparing {} projects on IBS...", total);
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        for (i, cs) in selected.iter().enumerate() {
            let progress = Progress { index: i + 1, total };
            let result = self.push_codestream(cs, progress).await;
            report.record(progress, cs.id.clone(), result);
        }

        if wait {
            // Give the service time to schedule the last pushed projects.
            self.poller.sleeper().sleep(POLL_INTERVAL).await;
            self.poller.run(true).await?;
            // Finished projects drop out of the waiting rounds; show them all.
            self.poller.run(false).await?;
        }
        Ok(report)
    }

    async fn push_codestream(&self, cs: &Codestream, progress: Progress) -> Result<TaskOutcome> {
        let branch = self.branch_for(&cs.id);
        if !git::branch_exists(&self.patches_dir, &branch).await {
            info!("Could not find git branch for {}. Skipping.", cs.id);
            return Ok(TaskOutcome::Skipped);
        }
        info!("{} pushing {} using branch {}...", progress, cs.id, branch);

        let project = self.registry.project_for(&cs.id);
        if self.service().delete_project(&project).await? == DeleteOutcome::Deleted {
            debug!("{} deleted before push", project);
        }
        self.service().set_project_meta(&self.project_meta(cs)).await?;
        self.service()
            .set_package_meta(&project, KLP_PACKAGE, "", PACKAGE_DESCRIPTION)
            .await?;

        let checkout = self.layout.checkout_dir(&cs.id);
        let code = self.layout.code_dir(&cs.id);
        remove_tree(&checkout)?;
        remove_tree(&code)?;
        ensure_dir(&checkout)?;

        git::clone_branch(&self.patches_dir, &branch, &code).await?;
        let marker = code.join("scripts").join("release-version.sh");
        std::fs::write(&marker, format!("RELEASE={}", cs.release_version()))
            .map_err(|e| KlpError::at(&marker, e))?;

        let target = path_arg(&checkout);
        run_command("bash", &["./scripts/tar-up.sh", "-d", target.as_str()], &code).await?;
        remove_tree(&code)?;

        self.upload_dir(&project, &checkout).await?;
        self.service()
            .commit(&project, KLP_PACKAGE, &format!("Dump {branch}"))
            .await?;
        remove_tree(&checkout)?;

        Ok(TaskOutcome::Done)
    }

    /// Stage every regular file directly under `dir`.
    async fn upload_dir(&self, project: &str, dir: &Path) -> Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| KlpError::at(dir, e))? {
            let path = entry.map_err(|e| KlpError::at(dir, e))?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let content = std::fs::read(&path).map_err(|e| KlpError::at(&path, e))?;
            debug!("uploading {}/{}", project, name);
            self.service()
                .upload_file(project, KLP_PACKAGE, &name, content)
                .await?;
        }
        Ok(())
    }

    /// Delete every project passing the filter.
    pub async fn cleanup(&self) -> Result<BatchReport> {
        let projects = self.registry.project_names().await?;
        let total = projects.len();
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        if total == 0 {
            info!("No projects found.");
            return Ok(report);
        }

        info!("Deleting {} projects...", total);
        for (i, project) in projects.into_iter().enumerate() {
            let progress = Progress { index: i + 1, total };
            let result = match self.service().delete_project(&project).await {
                Ok(DeleteOutcome::Deleted) => Ok(TaskOutcome::Done),
                Ok(DeleteOutcome::NotFound) => Ok(TaskOutcome::Skipped),
                Err(e) => Err(e.into()),
            };
            report.record(progress, project, result);
        }
        Ok(report)
    }

    /// Build log of the livepatch package of `cs` on `arch`.
    pub async fn build_log(&self, cs: &str, arch: &str) -> Result<String> {
        let project = self.registry.project_for(cs);
        Ok(self
            .service()
            .build_log(&project, DEVBUILD_REPO, arch, KLP_PACKAGE)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::sample;
    use crate::fakes::InstantSleeper;
    use crate::registry::CodestreamFilter;
    use obs_client::fakes::MemoryBuildService;

    fn publisher(service: Arc<MemoryBuildService>, work: &Path, filter: Option<&str>) -> Publisher {
        let registry = Arc::new(Registry::new(
            service,
            "jdoe",
            "bsc1234567",
            CodestreamFilter::new(filter).unwrap(),
        ));
        let poller = StatusPoller::new(Arc::clone(&registry)).with_sleeper(Arc::new(InstantSleeper::new()));
        Publisher::new(
            registry,
            Layout::new(work.join("bsc1234567"), None),
            "bsc1234567",
            work.join("kgraft-patches"),
            poller,
        )
    }

    #[test]
    fn test_project_meta() {
        let work = tempfile::tempdir().unwrap();
        let publisher = publisher(Arc::new(MemoryBuildService::new()), work.path(), None);
        let meta = publisher.project_meta(&sample("15.2u25", &["x86_64", "ppc64le"]));

        assert_eq!(meta.name, "home:jdoe:bsc1234567-klp-15_2u25");
        assert_eq!(meta.description, "Development of livepatches for 15.2u25");
        assert_eq!(meta.owner, "jdoe");
        assert_eq!(meta.repository, "devbuild");
        assert_eq!(meta.path.project, "SUSE:Maintenance:1234");
        assert_eq!(meta.archs, vec!["x86_64", "ppc64le"]);
    }

    #[tokio::test]
    async fn test_push_with_empty_selection_fails() {
        let work = tempfile::tempdir().unwrap();
        let publisher = publisher(Arc::new(MemoryBuildService::new()), work.path(), Some("12"));
        let map = CodestreamMap::new(vec![sample("15.2u25", &["x86_64"])]);

        let err = publisher.push(&map, false).await.unwrap_err();
        assert!(err.to_string().contains("No codestreams found for bsc1234567"));
    }

    #[tokio::test]
    async fn test_missing_branch_is_skipped() {
        let work = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(work.path().join("kgraft-patches")).unwrap();
        let service = Arc::new(MemoryBuildService::new());
        let publisher = publisher(service.clone(), work.path(), None);
        let map = CodestreamMap::new(vec![sample("15.2u25", &["x86_64"])]);

        let report = publisher.push(&map, false).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.is_clean());
        assert!(service.project_names().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_counts_deleted_projects() {
        let work = tempfile::tempdir().unwrap();
        let service = Arc::new(MemoryBuildService::new());
        let publisher = publisher(service.clone(), work.path(), Some("15.2"));
        service.add_project("home:jdoe:bsc1234567-klp-15_2u25", "devbuild", &["x86_64"]);
        service.add_project("home:jdoe:bsc1234567-klp-15_3u1", "devbuild", &["x86_64"]);

        let report = publisher.cleanup().await.unwrap();
        assert_eq!(report.done, 1);
        assert_eq!(service.deleted(), vec!["home:jdoe:bsc1234567-klp-15_2u25"]);

        let none = publisher.cleanup().await.unwrap();
        assert_eq!(none, BatchReport::default());
    }

    #[tokio::test]
    async fn test_build_log() {
        let work = tempfile::tempdir().unwrap();
        let service = Arc::new(MemoryBuildService::new());
        let publisher = publisher(service.clone(), work.path(), None);
        service.set_log(
            "home:jdoe:bsc1234567-klp-15_2u25",
            "devbuild",
            "x86_64",
            "klp",
            "[  1s] build ok",
        );

        let log = publisher.build_log("15.2u25", "x86_64").await.unwrap();
        assert_eq!(log, "[  1s] build ok");
        assert!(publisher.build_log("15.2u25", "s390x").await.is_err());
    }
}
