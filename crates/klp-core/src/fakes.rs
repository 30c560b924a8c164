//! In-memory stand-ins for the engine's local seams (testing only).
//!
//! Together with `obs_client::fakes::MemoryBuildService` these let every
//! engine path run without rpm tooling, binutils or real time:
//!
//! - [`FakeTools`] records archive operations and materializes registered
//!   payload files on extraction
//! - [`FakeInspector`] answers symbol queries from tables keyed by file name
//! - [`InstantSleeper`] records requested delays and returns immediately

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{KlpError, Result};
use crate::poller::Sleeper;
use crate::tools::ArchiveTools;
use crate::validator::BinaryInspector;

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct ToolsState {
    payloads: Vec<(String, Vec<String>)>,
    broken: Vec<String>,
    extracted: Vec<(PathBuf, PathBuf)>,
    decompressed: Vec<PathBuf>,
    configured: Vec<PathBuf>,
    archived: Vec<PathBuf>,
}

/// [`ArchiveTools`] working on plain files.
///
/// `decompress` strips the last extension, `olddefconfig` writes `.config`
/// and `archive_dir` creates an empty `<name>.tar.xz`.
#[derive(Debug, Default)]
pub struct FakeTools {
    state: Mutex<ToolsState>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files (relative to the extraction target) created when an RPM whose
    /// name starts with `rpm_prefix` is extracted.
    pub fn add_payload(&self, rpm_prefix: &str, files: &[&str]) {
        self.state.lock().unwrap().payloads.push((
            rpm_prefix.to_string(),
            files.iter().map(|f| f.to_string()).collect(),
        ));
    }

    /// Make extraction of RPMs whose name starts with `rpm_prefix` fail.
    pub fn break_extract(&self, rpm_prefix: &str) {
        self.state.lock().unwrap().broken.push(rpm_prefix.to_string());
    }

    /// `(rpm, target dir)` pairs in extraction order.
    pub fn extracted(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.lock().unwrap().extracted.clone()
    }

    pub fn decompressed(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().decompressed.clone()
    }

    pub fn configured(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().configured.clone()
    }

    pub fn archived(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().archived.clone()
    }
}

#[async_trait]
impl ArchiveTools for FakeTools {
    async fn extract_rpm(&self, rpm: &Path, dest: &Path) -> Result<()> {
        let name = file_name(rpm);
        let files: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            if state.broken.iter().any(|p| name.starts_with(p.as_str())) {
                return Err(KlpError::Command {
                    program: "cpio".to_string(),
                    dir: dest.to_path_buf(),
                    stderr: format!("premature end of archive {name}"),
                });
            }
            state.extracted.push((rpm.to_path_buf(), dest.to_path_buf()));
            state
                .payloads
                .iter()
                .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
                .flat_map(|(_, files)| files.clone())
                .collect()
        };

        for file in files {
            let path = dest.join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, b"payload")?;
        }
        Ok(())
    }

    async fn decompress(&self, file: &Path) -> Result<()> {
        std::fs::rename(file, file.with_extension(""))?;
        self.state
            .lock()
            .unwrap()
            .decompressed
            .push(file.to_path_buf());
        Ok(())
    }

    async fn olddefconfig(&self, obj_dir: &Path) -> Result<()> {
        std::fs::write(obj_dir.join(".config"), b"CONFIG_LIVEPATCH=y\n")?;
        self.state
            .lock()
            .unwrap()
            .configured
            .push(obj_dir.to_path_buf());
        Ok(())
    }

    async fn archive_dir(&self, parent: &Path, name: &str) -> Result<()> {
        let archive = parent.join(format!("{name}.tar.xz"));
        std::fs::write(&archive, b"")?;
        self.state.lock().unwrap().archived.push(archive);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InspectorState {
    depends: HashMap<String, String>,
    undefined: HashMap<String, Vec<String>>,
    defined: HashMap<String, Vec<String>>,
    unreadable: Vec<String>,
    symbol_queries: usize,
}

/// [`BinaryInspector`] answering from tables keyed by file name.
/// Unknown files have no dependencies and no symbols.
#[derive(Debug, Default)]
pub struct FakeInspector {
    state: Mutex<InspectorState>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_module(&self, file: &str, depends: &str, undefined: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.depends.insert(file.to_string(), depends.to_string());
        state.undefined.insert(
            file.to_string(),
            undefined.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn set_image(&self, file: &str, defined: &[&str]) {
        self.state.lock().unwrap().defined.insert(
            file.to_string(),
            defined.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make every query about `file` fail, as `modinfo` would on a
    /// corrupt module.
    pub fn break_module(&self, file: &str) {
        self.state.lock().unwrap().unreadable.push(file.to_string());
    }

    /// Number of symbol table reads (undefined and defined).
    pub fn symbol_queries(&self) -> usize {
        self.state.lock().unwrap().symbol_queries
    }
}

#[async_trait]
impl BinaryInspector for FakeInspector {
    async fn undefined_symbols(&self, module: &Path) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.symbol_queries += 1;
        Ok(state
            .undefined
            .get(&file_name(module))
            .cloned()
            .unwrap_or_default())
    }

    async fn defined_symbols(&self, image: &Path) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.symbol_queries += 1;
        Ok(state
            .defined
            .get(&file_name(image))
            .cloned()
            .unwrap_or_default())
    }

    async fn module_depends(&self, module: &Path) -> Result<String> {
        let state = self.state.lock().unwrap();
        let name = file_name(module);
        if state.unreadable.contains(&name) {
            return Err(KlpError::Command {
                program: "modinfo".to_string(),
                dir: module.to_path_buf(),
                stderr: format!("{name}: not an ELF file"),
            });
        }
        Ok(state.depends.get(&name).cloned().unwrap_or_default())
    }
}

/// [`Sleeper`] that never waits.
#[derive(Debug, Default)]
pub struct InstantSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl InstantSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_extraction_materializes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::new();
        tools.add_payload("kernel-default-5", &["boot/vmlinux-5.3.18-24.67-default.gz"]);

        tools
            .extract_rpm(
                Path::new("/rpms/kernel-default-5.3.18-24.67.1.x86_64.rpm"),
                dir.path(),
            )
            .await
            .unwrap();
        let image = dir.path().join("boot/vmlinux-5.3.18-24.67-default.gz");
        assert!(image.is_file());

        tools.decompress(&image).await.unwrap();
        assert!(dir.path().join("boot/vmlinux-5.3.18-24.67-default").is_file());
        assert_eq!(tools.decompressed(), vec![image]);
    }

    #[tokio::test]
    async fn test_broken_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::new();
        tools.break_extract("kernel-source");

        let err = tools
            .extract_rpm(Path::new("kernel-source-5.3.18.noarch.rpm"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, KlpError::Command { .. }));
        assert!(tools.extracted().is_empty());
    }
}
