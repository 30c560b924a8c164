//! In-memory build service (testing only)
//!
//! `MemoryBuildService` satisfies the [`BuildService`] contract without any
//! network access. Tests seed projects, binaries and scripted build results,
//! then inspect what the engine uploaded, committed and deleted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ObsError;
use crate::model::{ArchResult, ProjectEntry, ProjectMeta, RepositoryEntry};
use crate::service::{BuildService, DeleteOutcome, DownloadOutcome};
use crate::ObsResult;

type BinaryKey = (String, String, String, String);

/// A commit recorded by the fake, with the files staged before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub project: String,
    pub package: String,
    pub message: String,
    pub files: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<String, ProjectEntry>,
    metas: HashMap<String, ProjectMeta>,
    package_metas: HashSet<(String, String)>,
    binaries: HashMap<BinaryKey, Vec<(String, Vec<u8>)>>,
    results: HashMap<String, VecDeque<Vec<ArchResult>>>,
    result_queries: HashMap<String, usize>,
    logs: HashMap<BinaryKey, String>,
    staged: HashMap<(String, String), Vec<(String, Vec<u8>)>>,
    commits: Vec<CommitRecord>,
    deleted: Vec<String>,
    broken_downloads: HashSet<String>,
    broken_results: HashMap<String, usize>,
    transfers: usize,
}

/// In-memory build service backed by a `Mutex<State>`.
#[derive(Debug, Default)]
pub struct MemoryBuildService {
    state: Mutex<State>,
}

impl MemoryBuildService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project with one repository carrying `archs`.
    pub fn add_project(&self, name: &str, repo: &str, archs: &[&str]) {
        let entry = ProjectEntry::new(name, vec![RepositoryEntry::new(repo, archs)]);
        self.state
            .lock()
            .unwrap()
            .projects
            .insert(name.to_string(), entry);
    }

    pub fn add_binary(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
        filename: &str,
        content: &[u8],
    ) {
        let key = key(project, repo, arch, package);
        self.state
            .lock()
            .unwrap()
            .binaries
            .entry(key)
            .or_default()
            .push((filename.to_string(), content.to_vec()));
    }

    pub fn set_log(&self, project: &str, repo: &str, arch: &str, package: &str, log: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(key(project, repo, arch, package), log.to_string());
    }

    /// Queue the build results returned by successive `build_results` calls.
    /// The last queued round keeps being returned once the queue drains.
    pub fn push_results(&self, project: &str, results: Vec<ArchResult>) {
        self.state
            .lock()
            .unwrap()
            .results
            .entry(project.to_string())
            .or_default()
            .push_back(results);
    }

    /// Make every download of `filename` fail with a server error.
    pub fn break_download(&self, filename: &str) {
        self.state
            .lock()
            .unwrap()
            .broken_downloads
            .insert(filename.to_string());
    }

    /// Make the next `rounds` result queries for `project` fail with an
    /// unavailable service.
    pub fn break_results(&self, project: &str, rounds: usize) {
        self.state
            .lock()
            .unwrap()
            .broken_results
            .insert(project.to_string(), rounds);
    }

    /// Number of binaries actually transferred.
    pub fn transfers(&self) -> usize {
        self.state.lock().unwrap().transfers
    }

    /// How many times build results were fetched for `project`.
    pub fn result_queries(&self, project: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .result_queries
            .get(project)
            .copied()
            .unwrap_or(0)
    }

    pub fn project_names(&self) -> Vec<String> {
        self.state.lock().unwrap().projects.keys().cloned().collect()
    }

    pub fn project_meta(&self, project: &str) -> Option<ProjectMeta> {
        self.state.lock().unwrap().metas.get(project).cloned()
    }

    pub fn has_package(&self, project: &str, package: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .package_metas
            .contains(&(project.to_string(), package.to_string()))
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

fn key(project: &str, repo: &str, arch: &str, package: &str) -> BinaryKey {
    (
        project.to_string(),
        repo.to_string(),
        arch.to_string(),
        package.to_string(),
    )
}

fn not_found(what: String) -> ObsError {
    ObsError::Status {
        status: 404,
        url: what,
        body: String::new(),
    }
}

#[async_trait]
impl BuildService for MemoryBuildService {
    async fn search_projects(&self, prefix: &str) -> ObsResult<Vec<ProjectEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .projects
            .values()
            .filter(|p| p.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn binary_list(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
    ) -> ObsResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .binaries
            .get(&key(project, repo, arch, package))
            .map(|files| files.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }

    async fn download_binary(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
        filename: &str,
        dest_dir: &Path,
    ) -> ObsResult<DownloadOutcome> {
        let dest = dest_dir.join(filename);
        if dest.exists() {
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        let content = {
            let mut state = self.state.lock().unwrap();
            if state.broken_downloads.contains(filename) {
                return Err(ObsError::Status {
                    status: 500,
                    url: filename.to_string(),
                    body: "internal error".to_string(),
                });
            }
            let content = state
                .binaries
                .get(&key(project, repo, arch, package))
                .and_then(|files| files.iter().find(|(name, _)| name == filename))
                .map(|(_, content)| content.clone())
                .ok_or_else(|| not_found(format!("{project}/{repo}/{arch}/{package}/{filename}")))?;
            state.transfers += 1;
            content
        };

        std::fs::write(&dest, content)?;
        Ok(DownloadOutcome::Downloaded)
    }

    async fn build_log(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
    ) -> ObsResult<String> {
        let state = self.state.lock().unwrap();
        state
            .logs
            .get(&key(project, repo, arch, package))
            .cloned()
            .ok_or_else(|| not_found(format!("{project}/{repo}/{arch}/{package}/_log")))
    }

    async fn build_results(&self, project: &str) -> ObsResult<Vec<ArchResult>> {
        let mut state = self.state.lock().unwrap();
        *state.result_queries.entry(project.to_string()).or_default() += 1;
        if let Some(left) = state.broken_results.get_mut(project).filter(|left| **left > 0) {
            *left -= 1;
            return Err(ObsError::Status {
                status: 503,
                url: format!("/build/{project}/_result"),
                body: "service unavailable".to_string(),
            });
        }

        let queue = state.results.entry(project.to_string()).or_default();
        let round = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(round.unwrap_or_default())
    }

    async fn delete_project(&self, project: &str) -> ObsResult<DeleteOutcome> {
        let mut state = self.state.lock().unwrap();
        state.metas.remove(project);
        state.package_metas.retain(|(p, _)| p != project);
        match state.projects.remove(project) {
            Some(_) => {
                state.deleted.push(project.to_string());
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn set_project_meta(&self, meta: &ProjectMeta) -> ObsResult<()> {
        let archs: Vec<&str> = meta.archs.iter().map(String::as_str).collect();
        let entry = ProjectEntry::new(
            &meta.name,
            vec![RepositoryEntry::new(&meta.repository, &archs)],
        );

        let mut state = self.state.lock().unwrap();
        state.projects.insert(meta.name.clone(), entry);
        state.metas.insert(meta.name.clone(), meta.clone());
        Ok(())
    }

    async fn set_package_meta(
        &self,
        project: &str,
        package: &str,
        _title: &str,
        _description: &str,
    ) -> ObsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.projects.contains_key(project) {
            return Err(not_found(format!("source/{project}")));
        }
        state
            .package_metas
            .insert((project.to_string(), package.to_string()));
        Ok(())
    }

    async fn upload_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ObsResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .staged
            .entry((project.to_string(), package.to_string()))
            .or_default()
            .push((name.to_string(), content));
        Ok(())
    }

    async fn commit(&self, project: &str, package: &str, message: &str) -> ObsResult<()> {
        let mut state = self.state.lock().unwrap();
        let files = state
            .staged
            .remove(&(project.to_string(), package.to_string()))
            .unwrap_or_default()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        state.commits.push(CommitRecord {
            project: project.to_string(),
            package: package.to_string(),
            message: message.to_string(),
            files,
        });
        Ok(())
    }
}
