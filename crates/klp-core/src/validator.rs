//! Symbol validator.
//!
//! A built livepatch module may reference symbols that only exist in other
//! modules. When the module declares dependencies, its undefined symbols are
//! diffed against the symbols the unpatched kernel image defines and the
//! leftovers are reported as a warning for the patch author. The check is
//! advisory: nothing here fails a run because of a dependency.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::codestream::Codestream;
use crate::error::{cached_regex, KlpError, Result};
use crate::layout::{remove_tree, Layout};
use crate::tools::{path_arg, run_command, ArchiveTools};

/// Read-only inspection of ELF objects.
#[async_trait]
pub trait BinaryInspector: Send + Sync {
    async fn undefined_symbols(&self, module: &Path) -> Result<Vec<String>>;

    async fn defined_symbols(&self, image: &Path) -> Result<Vec<String>>;

    /// The module's `depends:` field; empty when it declares none.
    async fn module_depends(&self, module: &Path) -> Result<String>;
}

/// [`BinaryInspector`] over `nm` and `/sbin/modinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NmInspector;

fn dir_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// Symbol names from `nm --undefined-only` output.
pub fn parse_undefined(nm_output: &str) -> Result<Vec<String>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    Ok(cached_regex(&RE, r"(?m)^\s+U\s(\w+)")?
        .captures_iter(nm_output)
        .map(|c| c[1].to_string())
        .collect())
}

/// Symbol names from `nm --defined-only` output (`<addr> <type> <name>`).
pub fn parse_defined(nm_output: &str) -> Vec<String> {
    nm_output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, _, name] => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// The `depends:` value from `modinfo` output.
pub fn parse_depends(modinfo_output: &str) -> String {
    modinfo_output
        .lines()
        .find_map(|line| line.strip_prefix("depends:"))
        .map(|deps| deps.trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl BinaryInspector for NmInspector {
    async fn undefined_symbols(&self, module: &Path) -> Result<Vec<String>> {
        let path = path_arg(module);
        let out = run_command("nm", &["--undefined-only", path.as_str()], dir_of(module)).await?;
        parse_undefined(&out)
    }

    async fn defined_symbols(&self, image: &Path) -> Result<Vec<String>> {
        let path = path_arg(image);
        let out = run_command("nm", &["--defined-only", path.as_str()], dir_of(image)).await?;
        Ok(parse_defined(&out))
    }

    async fn module_depends(&self, module: &Path) -> Result<String> {
        let path = path_arg(module);
        let out = run_command("/sbin/modinfo", &[path.as_str()], dir_of(module)).await?;
        Ok(parse_depends(&out))
    }
}

/// Undefined symbols of the module that the kernel does not define.
///
/// Names are compared exactly; the module's order is kept and duplicates
/// are reported once.
pub fn missing_symbols(undefined: &[String], defined: &[String]) -> Vec<String> {
    let defined: HashSet<&str> = defined.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    undefined
        .iter()
        .filter(|sym| !defined.contains(sym.as_str()) && seen.insert(sym.as_str()))
        .cloned()
        .collect()
}

/// Where a livepatch RPM installs its module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivepatchModule {
    /// Directory under `lib/modules/<kernel>-<ktype>/`
    pub dir: &'static str,
    pub ktype: String,
    pub file: String,
}

impl LivepatchModule {
    /// Derive the module location from the RPM file name. Both the current
    /// `livepatch` naming and the legacy `kgraft-patch` naming are known.
    pub fn from_rpm(rpm: &str) -> Result<Self> {
        static LIVEPATCH: OnceLock<Regex> = OnceLock::new();
        static KGRAFT: OnceLock<Regex> = OnceLock::new();

        let livepatch = cached_regex(
            &LIVEPATCH,
            r"livepatch-.*(default|rt)-(\d+)-(\d+)\.(\d+)\.(\d+)\.",
        )?;
        if let Some(c) = livepatch.captures(rpm) {
            return Ok(LivepatchModule {
                dir: "livepatch",
                ktype: c[1].to_string(),
                file: format!("livepatch-{}-{}_{}_{}.ko", &c[2], &c[3], &c[4], &c[5]),
            });
        }

        let kgraft = cached_regex(&KGRAFT, r"kgraft-patch-.*default-(\d+)-(\d+)\.(\d+)\.")?;
        if let Some(c) = kgraft.captures(rpm) {
            return Ok(LivepatchModule {
                dir: "kgraft",
                ktype: "default".to_string(),
                file: format!("kgraft-patch-{}-{}_{}.ko", &c[1], &c[2], &c[3]),
            });
        }

        Err(KlpError::UnrecognizedLivepatch(rpm.to_string()))
    }

    /// Module path once the RPM is unpacked under `root`.
    pub fn path_in(&self, root: &Path, kernel: &str) -> PathBuf {
        root.join("lib")
            .join("modules")
            .join(format!("{kernel}-{}", self.ktype))
            .join(self.dir)
            .join(&self.file)
    }
}

/// Advisory finding for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyWarning {
    pub depends: String,
    pub missing: Vec<String>,
    /// Why the symbol diff could not be computed, if it could not.
    pub check_error: Option<String>,
}

pub struct SymbolValidator {
    inspector: Arc<dyn BinaryInspector>,
    tools: Arc<dyn ArchiveTools>,
    layout: Layout,
}

impl SymbolValidator {
    pub fn new(inspector: Arc<dyn BinaryInspector>, tools: Arc<dyn ArchiveTools>, layout: Layout) -> Self {
        SymbolValidator {
            inspector,
            tools,
            layout,
        }
    }

    pub async fn find_missing_symbols(&self, module: &Path, image: &Path) -> Result<Vec<String>> {
        let undefined = self.inspector.undefined_symbols(module).await?;
        let defined = self.inspector.defined_symbols(image).await?;
        Ok(missing_symbols(&undefined, &defined))
    }

    /// Check one unpacked module against the kernel image of `cs`/`arch`.
    ///
    /// Modules without declared dependencies are not diffed. The check is
    /// advisory: failures are logged and never stop the caller.
    pub async fn check_module(
        &self,
        cs: &Codestream,
        arch: &str,
        module: &Path,
    ) -> Option<DependencyWarning> {
        let depends = match self.inspector.module_depends(module).await {
            Ok(depends) => depends,
            Err(e) => {
                warn!("{}:{}: could not read module dependencies: {}", cs.id, arch, e);
                return None;
            }
        };
        if depends.is_empty() {
            debug!("{}:{}: module has no dependencies", cs.id, arch);
            return None;
        }

        let diff = match self.layout.kernel_image(cs, arch) {
            Ok(image) => self.find_missing_symbols(module, &image).await,
            Err(e) => Err(e),
        };
        match diff {
            Ok(missing) => {
                warn!(
                    "{}:{} has dependencies: {}. Functions: {}",
                    cs.id,
                    arch,
                    depends,
                    missing.join(" ")
                );
                Some(DependencyWarning {
                    depends,
                    missing,
                    check_error: None,
                })
            }
            Err(e) => {
                warn!(
                    "{}:{} has dependencies: {}. Symbol check failed: {}",
                    cs.id, arch, depends, e
                );
                Some(DependencyWarning {
                    depends,
                    missing: Vec::new(),
                    check_error: Some(e.to_string()),
                })
            }
        }
    }

    /// Unpack the livepatch `rpm` found in `rpm_dir`, check its module and
    /// remove the unpacked tree again.
    pub async fn validate_livepatch_rpm(
        &self,
        cs: &Codestream,
        arch: &str,
        rpm_dir: &Path,
        rpm: &str,
    ) -> Result<Option<DependencyWarning>> {
        let module = LivepatchModule::from_rpm(rpm)?;
        self.tools.extract_rpm(&rpm_dir.join(rpm), rpm_dir).await?;

        let path = module.path_in(rpm_dir, &cs.kernel);
        let warning = self.check_module(cs, arch, &path).await;
        remove_tree(&rpm_dir.join("lib"))?;
        Ok(warning)
    }
}
