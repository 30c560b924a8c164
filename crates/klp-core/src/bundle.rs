//! Test bundle preparation.
//!
//! Packs the livepatch RPMs built for a bug into one archive per
//! architecture, ready for the kernel test harness:
//!
//! ```text
//! <work>/<bsc>/tests/<arch>/<bsc>/
//!     run-kgr-test.sh
//!     built/      one livepatch RPM per codestream
//!     repro/      <bsc>_config.in, <bsc>_test_script.sh
//!     tests.out/
//! <work>/<bsc>/tests/<arch>/<bsc>.tar.xz
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::codestream::{CodestreamMap, ARCHS, PRIMARY_ARCH};
use crate::error::{KlpError, Result};
use crate::layout::{ensure_dir, remove_tree, Layout};
use crate::pipeline::DownloadPipeline;
use crate::registry::Registry;
use crate::tools::ArchiveTools;
use crate::validator::SymbolValidator;

const TEST_RUNNER: &str = "run-kgr-test.sh";

/// Copy `src` into `dir`, keeping its file name.
fn copy_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| KlpError::Config(format!("not a file: {}", src.display())))?;
    let dest = dir.join(name);
    std::fs::copy(src, &dest).map_err(|e| KlpError::at(src, e))?;
    Ok(dest)
}

fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KlpError::at(path, e)),
    }
}

/// Names of the `*.rpm` files in a livepatch RPM directory, sorted.
/// Partial downloads and other leftovers are ignored.
fn list_rpms(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| KlpError::at(dir, e))? {
        let entry = entry.map_err(|e| KlpError::at(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && name.ends_with(".rpm") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

pub struct TestBundler {
    registry: Arc<Registry>,
    layout: Layout,
    bsc: String,
    scripts_dir: PathBuf,
    test_script: PathBuf,
    pipeline: DownloadPipeline,
    validator: SymbolValidator,
    tools: Arc<dyn ArchiveTools>,
}

impl TestBundler {
    /// `scripts_dir` must hold `run-kgr-test.sh`; `test_script` is the bug's
    /// own test script, which may be missing.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        layout: Layout,
        bsc: &str,
        scripts_dir: impl Into<PathBuf>,
        test_script: impl Into<PathBuf>,
        pipeline: DownloadPipeline,
        validator: SymbolValidator,
        tools: Arc<dyn ArchiveTools>,
    ) -> Self {
        TestBundler {
            registry,
            layout,
            bsc: bsc.to_string(),
            scripts_dir: scripts_dir.into(),
            test_script: test_script.into(),
            pipeline,
            validator,
            tools,
        }
    }

    /// Build the bundle of every architecture and return the archive paths.
    ///
    /// Unless `skip_download` is set the built livepatch RPMs are fetched
    /// first. Codestreams without an RPM are left out; more than one RPM
    /// for a codestream is fatal.
    pub async fn prepare_tests(
        &self,
        codestreams: &CodestreamMap,
        skip_download: bool,
    ) -> Result<Vec<PathBuf>> {
        if !skip_download {
            self.pipeline.download_livepatches().await?;
        }

        let selected = self.registry.filter_codestreams(codestreams);
        let mut archives = Vec::new();
        for arch in ARCHS {
            archives.push(self.prepare_arch(&selected, arch).await?);
        }
        Ok(archives)
    }

    async fn prepare_arch(&self, codestreams: &CodestreamMap, arch: &str) -> Result<PathBuf> {
        let tests_path = self.layout.tests_dir(arch);
        let bundle = tests_path.join(&self.bsc);
        let archive = tests_path.join(format!("{}.tar.xz", self.bsc));

        remove_tree(&bundle)?;
        remove_file(&archive)?;
        ensure_dir(&bundle)?;
        copy_into(&self.scripts_dir.join(TEST_RUNNER), &bundle)?;
        for dir in ["built", "repro", "tests.out"] {
            ensure_dir(&bundle.join(dir))?;
        }

        let mut configs = Vec::new();
        for cs in codestreams.iter().filter(|cs| cs.has_arch(arch)) {
            let rpm_dir = self.layout.livepatch_rpm_dir(&cs.id, arch);
            if !rpm_dir.exists() {
                info!("{}/{}: rpm dir not found. Skipping.", cs.id, arch);
                continue;
            }

            let rpms = list_rpms(&rpm_dir)?;
            let rpm = match rpms.as_slice() {
                [] => {
                    info!("{}/{}: no rpm found. Skipping.", cs.id, arch);
                    continue;
                }
                [rpm] => rpm,
                _ => {
                    return Err(KlpError::ArtifactCount {
                        unit: format!("{}/{}", cs.id, arch),
                        found: rpms.len(),
                    })
                }
            };

            self.validator
                .validate_livepatch_rpm(cs, arch, &rpm_dir, rpm)
                .await?;
            copy_into(&rpm_dir.join(rpm), &bundle.join("built"))?;

            // Realtime kernels are only tested on the primary architecture.
            if cs.is_rt() && arch != PRIMARY_ARCH {
                continue;
            }
            configs.push(cs.full_name());
        }

        let config = bundle.join("repro").join(format!("{}_config.in", self.bsc));
        std::fs::write(&config, configs.join("\n")).map_err(|e| KlpError::at(&config, e))?;

        if self.test_script.is_file() {
            copy_into(&self.test_script, &bundle.join("repro"))?;
        } else {
            warn!("missing {}", self.test_script.display());
        }

        self.tools.archive_dir(&tests_path, &self.bsc).await?;
        info!("{}: {} codestreams bundled in {}", arch, configs.len(), archive.display());
        Ok(archive)
    }
}
