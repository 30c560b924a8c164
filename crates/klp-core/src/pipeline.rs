//! Download & extract pipeline.
//!
//! Fetches the upstream kernel packages of every selected codestream into
//! `<data>/<cs>/kernel-rpms`, unpacks them into the data tree and prepares
//! the extracted payloads (decompressed modules and images, a regenerated
//! kernel `.config`). Also fetches the livepatch RPMs built for a bug.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use obs_client::{BuildService, DownloadOutcome};
use regex::Regex;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::codestream::{CodestreamMap, PRIMARY_ARCH};
use crate::dispatcher::{BatchReport, Dispatcher, Task, TaskOutcome};
use crate::error::{cached_regex, compile, KlpError, Result};
use crate::layout::{ensure_dir, remove_tree, Layout};
use crate::registry::{Registry, DEVBUILD_REPO, KLP_PACKAGE};
use crate::tools::ArchiveTools;

/// Which of a codestream's resolved package names a catalogue entry lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Kernel,
    Source,
}

struct CatalogueEntry {
    arch: &'static str,
    kind: PackageKind,
    pattern: Regex,
}

/// Packages fetched per architecture. Only the primary architecture gets
/// the development and source packages; the others only need the kernel
/// image and modules for symbol validation. Utility packages such as
/// `kernel-macros` match no entry and are never fetched.
fn catalogue() -> Result<&'static [CatalogueEntry]> {
    static CATALOGUE: OnceLock<Vec<CatalogueEntry>> = OnceLock::new();
    if let Some(entries) = CATALOGUE.get() {
        return Ok(entries.as_slice());
    }

    let entries = [
        ("ppc64le", PackageKind::Kernel, r"^kernel-default-[\d.\-]+\.ppc64le\.rpm$"),
        ("s390x", PackageKind::Kernel, r"^kernel-default-[\d.\-]+\.s390x\.rpm$"),
        (
            "x86_64",
            PackageKind::Kernel,
            r"^kernel-(default|rt)-(extra-|(livepatch-|kgraft-)?devel-)?[\d.\-]+\.x86_64\.rpm$",
        ),
        (
            "x86_64",
            PackageKind::Source,
            r"^kernel-(source|devel)(-rt)?-[\d.\-]+\.noarch\.rpm$",
        ),
    ]
    .into_iter()
    .map(|(arch, kind, pattern)| {
        Ok(CatalogueEntry {
            arch,
            kind,
            pattern: compile(pattern)?,
        })
    })
    .collect::<Result<Vec<_>>>()?;
    Ok(CATALOGUE.get_or_init(|| entries).as_slice())
}

/// Kernel binary and `-extra` packages unpack per architecture.
fn is_arch_payload(rpm: &str) -> Result<bool> {
    static RE: OnceLock<Regex> = OnceLock::new();
    Ok(cached_regex(&RE, r"^kernel-(default|rt)-(extra-)?\d")?.is_match(rpm))
}

/// One artifact to fetch. `dest.join(rpm)` is unique across a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub seq: usize,
    pub cs: String,
    pub project: String,
    pub repo: String,
    pub arch: String,
    pub package: String,
    pub rpm: String,
    pub dest: PathBuf,
}

impl WorkItem {
    pub fn artifact_path(&self) -> PathBuf {
        self.dest.join(&self.rpm)
    }
}

impl Task for WorkItem {
    fn subject(&self) -> String {
        format!("{} {}", self.cs, self.rpm)
    }
}

/// Post-download processing of one unit of the data tree.
#[derive(Debug, Clone)]
enum PostStep {
    /// Decompress modules and kernel images of one architecture.
    Payloads { cs: String, arch: String, root: PathBuf },
    /// Drop stray trees and regenerate `.config` for one codestream.
    Config {
        cs: String,
        data_dir: PathBuf,
        obj_dir: PathBuf,
    },
}

impl Task for PostStep {
    fn subject(&self) -> String {
        match self {
            PostStep::Payloads { cs, arch, .. } => format!("{cs}/{arch} payloads"),
            PostStep::Config { cs, .. } => format!("{cs} kernel config"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub downloads: BatchReport,
    pub post: BatchReport,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.downloads.is_clean() && self.post.is_clean()
    }
}

pub struct DownloadPipeline {
    registry: Arc<Registry>,
    layout: Layout,
    tools: Arc<dyn ArchiveTools>,
    dispatcher: Dispatcher,
}

impl DownloadPipeline {
    pub fn new(registry: Arc<Registry>, layout: Layout, tools: Arc<dyn ArchiveTools>) -> Self {
        DownloadPipeline {
            registry,
            layout,
            tools,
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    fn service(&self) -> Arc<dyn BuildService> {
        Arc::clone(self.registry.service())
    }

    /// List the remote binaries of every selected codestream and keep the
    /// ones the catalogue asks for. A failed listing is logged and skipped.
    pub async fn plan_kernel_downloads(&self, codestreams: &CodestreamMap) -> Result<Vec<WorkItem>> {
        let service = self.service();
        let mut items = Vec::new();

        info!("Getting list of files...");
        for cs in codestreams.iter() {
            let dest = self.layout.kernel_rpms_dir(&cs.id)?;
            ensure_dir(&dest)?;
            let names = cs.package_names();

            for entry in catalogue()?.iter().filter(|e| cs.has_arch(e.arch)) {
                let package = match entry.kind {
                    PackageKind::Kernel => &names.kernel,
                    PackageKind::Source => &names.source,
                };
                let files = match service
                    .binary_list(&cs.project, &cs.repo, entry.arch, package)
                    .await
                {
                    Ok(files) => files,
                    Err(e) => {
                        error!("{} {}/{}: {}", cs.id, entry.arch, package, e);
                        continue;
                    }
                };

                for rpm in files.into_iter().filter(|f| entry.pattern.is_match(f)) {
                    items.push(WorkItem {
                        seq: items.len() + 1,
                        cs: cs.id.clone(),
                        project: cs.project.clone(),
                        repo: cs.repo.clone(),
                        arch: entry.arch.to_string(),
                        package: package.clone(),
                        rpm,
                        dest: dest.clone(),
                    });
                }
            }
        }
        Ok(items)
    }

    /// Download, unpack and prepare the kernel data of every codestream
    /// passing the filter.
    pub async fn fetch_kernel_data(&self, codestreams: &CodestreamMap) -> Result<PipelineReport> {
        let codestreams = self.registry.filter_codestreams(codestreams);
        let items = self.plan_kernel_downloads(&codestreams).await?;

        info!("Downloading {} rpms...", items.len());
        let service = self.service();
        let tools = Arc::clone(&self.tools);
        let layout = self.layout.clone();
        let downloads = self
            .dispatcher
            .run_all(items, move |item, _| {
                let service = Arc::clone(&service);
                let tools = Arc::clone(&tools);
                let layout = layout.clone();
                async move {
                    download_and_extract(service.as_ref(), tools.as_ref(), &layout, item).await
                }
            })
            .await;

        let steps = self.post_steps(&codestreams)?;
        let tools = Arc::clone(&self.tools);
        let post = self
            .dispatcher
            .run_all(steps, move |step, _| {
                let tools = Arc::clone(&tools);
                async move { post_process(tools.as_ref(), step).await }
            })
            .await;

        info!("Finished extract vmlinux and modules...");
        Ok(PipelineReport { downloads, post })
    }

    fn post_steps(&self, codestreams: &CodestreamMap) -> Result<Vec<PostStep>> {
        let mut steps = Vec::new();
        for cs in codestreams.iter() {
            for arch in &cs.archs {
                steps.push(PostStep::Payloads {
                    cs: cs.id.clone(),
                    arch: arch.clone(),
                    root: self.layout.arch_data_dir(&cs.id, arch)?,
                });
            }
            // The object tree ships with the primary architecture's devel package.
            if cs.has_arch(PRIMARY_ARCH) {
                steps.push(PostStep::Config {
                    cs: cs.id.clone(),
                    data_dir: self.layout.data_dir(&cs.id)?,
                    obj_dir: self.layout.obj_dir(cs)?,
                });
            }
        }
        Ok(steps)
    }

    /// Fetch the livepatch RPMs built in every pushed project into
    /// `<work>/<bsc>/c/<cs>/<arch>/rpm`, replacing earlier downloads.
    pub async fn download_livepatches(&self) -> Result<BatchReport> {
        let service = self.service();
        let mut items = Vec::new();

        for project in self.registry.list_projects().await? {
            let cs = self.registry.codestream_for(&project.name);
            let archs = project.archs();
            for arch in &archs {
                remove_tree(&self.layout.livepatch_rpm_dir(&cs, arch))?;
            }

            for arch in archs {
                let files = match service
                    .binary_list(&project.name, DEVBUILD_REPO, &arch, KLP_PACKAGE)
                    .await
                {
                    Ok(files) => files,
                    Err(e) => {
                        error!("{} {}: {}", project.name, arch, e);
                        continue;
                    }
                };

                let suffix = format!("{arch}.rpm");
                let dest = self.layout.livepatch_rpm_dir(&cs, &arch);
                for rpm in files
                    .into_iter()
                    .filter(|f| f.ends_with(&suffix) && !f.contains("preempt"))
                {
                    ensure_dir(&dest)?;
                    items.push(WorkItem {
                        seq: items.len() + 1,
                        cs: cs.clone(),
                        project: project.name.clone(),
                        repo: DEVBUILD_REPO.to_string(),
                        arch: arch.clone(),
                        package: KLP_PACKAGE.to_string(),
                        rpm,
                        dest: dest.clone(),
                    });
                }
            }
        }

        info!("Downloading {} packages", items.len());
        Ok(self
            .dispatcher
            .run_all(items, move |item, _| {
                let service = Arc::clone(&service);
                async move { download(service.as_ref(), &item).await }
            })
            .await)
    }
}

async fn download(service: &dyn BuildService, item: &WorkItem) -> Result<TaskOutcome> {
    let outcome = service
        .download_binary(
            &item.project,
            &item.repo,
            &item.arch,
            &item.package,
            &item.rpm,
            &item.dest,
        )
        .await?;
    Ok(match outcome {
        DownloadOutcome::Downloaded => TaskOutcome::Done,
        DownloadOutcome::AlreadyPresent => TaskOutcome::Skipped,
    })
}

/// Already-present artifacts were unpacked by the run that fetched them.
async fn download_and_extract(
    service: &dyn BuildService,
    tools: &dyn ArchiveTools,
    layout: &Layout,
    item: WorkItem,
) -> Result<TaskOutcome> {
    let outcome = download(service, &item).await?;
    if outcome == TaskOutcome::Skipped {
        return Ok(outcome);
    }

    let target = if is_arch_payload(&item.rpm)? {
        layout.arch_data_dir(&item.cs, &item.arch)?
    } else {
        layout.data_dir(&item.cs)?
    };
    ensure_dir(&target)?;
    tools.extract_rpm(&item.artifact_path(), &target).await?;
    Ok(TaskOutcome::Done)
}

async fn post_process(tools: &dyn ArchiveTools, step: PostStep) -> Result<TaskOutcome> {
    match step {
        PostStep::Payloads { root, .. } => {
            let mut files = find_files(&root.join("lib").join("modules"), |name| {
                name.ends_with(".ko.zst") || name.ends_with(".ko.xz")
            })?;
            files.extend(find_files(&root.join("boot"), |name| {
                name.starts_with("vmlinux") && name.ends_with("gz")
            })?);

            if files.is_empty() {
                return Ok(TaskOutcome::Skipped);
            }
            for file in &files {
                tools.decompress(file).await?;
            }
            Ok(TaskOutcome::Done)
        }
        PostStep::Config {
            data_dir, obj_dir, ..
        } => {
            remove_tree(&data_dir.join("boot"))?;
            remove_tree(&data_dir.join("lib"))?;
            if !obj_dir.is_dir() {
                return Err(missing_dir(&obj_dir));
            }
            tools.olddefconfig(&obj_dir).await?;
            Ok(TaskOutcome::Done)
        }
    }
}

fn missing_dir(path: &Path) -> KlpError {
    KlpError::at(
        path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "directory not found"),
    )
}

/// Regular files under `dir` whose name satisfies `keep`, sorted.
fn find_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(missing_dir(dir));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| KlpError::at(dir, e.into()))?;
        if entry.file_type().is_file() && keep(&entry.file_name().to_string_lossy()) {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::sample;
    use crate::fakes::FakeTools;
    use crate::registry::CodestreamFilter;
    use obs_client::fakes::MemoryBuildService;

    fn matches(arch: &str, kind: PackageKind, rpm: &str) -> bool {
        catalogue()
            .unwrap()
            .iter()
            .any(|e| e.arch == arch && e.kind == kind && e.pattern.is_match(rpm))
    }

    #[test]
    fn test_catalogue_selects_kernel_variants() {
        for rpm in [
            "kernel-default-5.3.18-24.67.1.x86_64.rpm",
            "kernel-default-extra-5.3.18-24.67.1.x86_64.rpm",
            "kernel-default-devel-5.3.18-24.67.1.x86_64.rpm",
            "kernel-default-livepatch-devel-5.3.18-24.67.1.x86_64.rpm",
            "kernel-rt-devel-5.3.18-24.67.1.x86_64.rpm",
        ] {
            assert!(matches("x86_64", PackageKind::Kernel, rpm), "{rpm}");
        }
        assert!(!matches(
            "x86_64",
            PackageKind::Kernel,
            "kernel-default-debuginfo-5.3.18-24.67.1.x86_64.rpm"
        ));
        assert!(!matches(
            "x86_64",
            PackageKind::Kernel,
            "kernel-default-base-5.3.18-24.67.1.x86_64.rpm"
        ));
    }

    #[test]
    fn test_catalogue_secondary_archs_get_kernel_only() {
        assert!(matches(
            "ppc64le",
            PackageKind::Kernel,
            "kernel-default-5.3.18-24.67.1.ppc64le.rpm"
        ));
        assert!(!matches(
            "ppc64le",
            PackageKind::Kernel,
            "kernel-default-devel-5.3.18-24.67.1.ppc64le.rpm"
        ));
        assert!(!catalogue()
            .unwrap()
            .iter()
            .any(|e| e.arch == "s390x" && e.kind == PackageKind::Source));
        assert!(matches(
            "x86_64",
            PackageKind::Source,
            "kernel-source-rt-5.3.18-24.67.1.noarch.rpm"
        ));
        assert!(!matches(
            "x86_64",
            PackageKind::Source,
            "kernel-macros-5.3.18-24.67.1.noarch.rpm"
        ));
    }

    #[test]
    fn test_extraction_targets() {
        let arch_payload = |rpm: &str| is_arch_payload(rpm).unwrap();
        assert!(arch_payload("kernel-default-5.3.18-24.67.1.x86_64.rpm"));
        assert!(arch_payload("kernel-rt-extra-5.3.18-24.67.1.x86_64.rpm"));
        assert!(!arch_payload("kernel-default-devel-5.3.18-24.67.1.x86_64.rpm"));
        assert!(!arch_payload("kernel-source-5.3.18-24.67.1.noarch.rpm"));
    }

    #[test]
    fn test_find_files_reports_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("lib").join("modules");
        let err = find_files(&missing, |_| true).unwrap_err();
        assert!(err.to_string().contains("lib/modules"));
    }

    #[tokio::test]
    async fn test_empty_listing_plans_nothing() {
        let data = tempfile::tempdir().unwrap();
        let service = Arc::new(MemoryBuildService::new());
        let registry = Arc::new(Registry::new(
            service.clone(),
            "jdoe",
            "bsc1234567",
            CodestreamFilter::default(),
        ));
        let pipeline = DownloadPipeline::new(
            registry,
            Layout::new(data.path().join("bsc1234567"), Some(data.path().to_path_buf())),
            Arc::new(FakeTools::new()),
        );

        let map = CodestreamMap::new(vec![sample("15.2u25", &["s390x"])]);
        let items = pipeline.plan_kernel_downloads(&map).await.unwrap();
        assert!(items.is_empty());
        assert!(data.path().join("15.2u25/kernel-rpms").is_dir());
    }
}
