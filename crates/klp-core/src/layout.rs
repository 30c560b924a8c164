//! On-disk layout produced and consumed by the engine.
//!
//! Two trees are involved:
//!
//! - the data tree (`<data>/<cs>/...`) holding downloaded kernel RPMs and the
//!   extracted kernel payloads used for validation and compilation;
//! - the bug tree (`<work>/<bsc>/...`) holding built livepatch RPMs, push
//!   scratch areas and test bundles.

use std::path::{Path, PathBuf};

use crate::codestream::{Codestream, PRIMARY_ARCH};
use crate::error::{KlpError, Result};

#[derive(Debug, Clone)]
pub struct Layout {
    bsc_path: PathBuf,
    data: Option<PathBuf>,
}

impl Layout {
    pub fn new(bsc_path: impl Into<PathBuf>, data: Option<PathBuf>) -> Self {
        Layout {
            bsc_path: bsc_path.into(),
            data,
        }
    }

    pub fn bsc_path(&self) -> &Path {
        &self.bsc_path
    }

    fn data(&self) -> Result<&Path> {
        self.data.as_deref().ok_or_else(|| {
            KlpError::Config("--data or KLP_DATA_DIR should be defined".to_string())
        })
    }

    /// `<data>/<cs>`: noarch payloads (sources, devel trees).
    pub fn data_dir(&self, cs: &str) -> Result<PathBuf> {
        Ok(self.data()?.join(cs))
    }

    /// `<data>/<cs>/<arch>`: kernel binary payloads of one architecture.
    pub fn arch_data_dir(&self, cs: &str, arch: &str) -> Result<PathBuf> {
        Ok(self.data_dir(cs)?.join(arch))
    }

    pub fn kernel_rpms_dir(&self, cs: &str) -> Result<PathBuf> {
        Ok(self.data_dir(cs)?.join("kernel-rpms"))
    }

    /// Kernel object tree holding the build `.config`.
    pub fn obj_dir(&self, cs: &Codestream) -> Result<PathBuf> {
        Ok(self
            .data_dir(&cs.id)?
            .join("usr")
            .join("src")
            .join(format!("linux-{}-obj", cs.kernel))
            .join(PRIMARY_ARCH)
            .join(cs.ktype()))
    }

    /// Decompressed, unpatched kernel image of one architecture.
    pub fn kernel_image(&self, cs: &Codestream, arch: &str) -> Result<PathBuf> {
        Ok(self
            .arch_data_dir(&cs.id, arch)?
            .join("boot")
            .join(format!("vmlinux-{}-{}", cs.kernel, cs.ktype())))
    }

    /// `<work>/<bsc>/c/<cs>`
    pub fn cs_work_dir(&self, cs: &str) -> PathBuf {
        self.bsc_path.join("c").join(cs)
    }

    /// Built livepatch RPMs downloaded for one codestream and architecture.
    pub fn livepatch_rpm_dir(&self, cs: &str, arch: &str) -> PathBuf {
        self.cs_work_dir(cs).join(arch).join("rpm")
    }

    pub fn checkout_dir(&self, cs: &str) -> PathBuf {
        self.cs_work_dir(cs).join("checkout")
    }

    pub fn code_dir(&self, cs: &str) -> PathBuf {
        self.cs_work_dir(cs).join("code")
    }

    /// `<work>/<bsc>/tests/<arch>`
    pub fn tests_dir(&self, arch: &str) -> PathBuf {
        self.bsc_path.join("tests").join(arch)
    }
}

/// `mkdir -p` reporting the offending path on failure.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| KlpError::at(path, e))
}

/// Remove a directory tree; a tree that is already gone is fine.
pub fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KlpError::at(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::sample;

    #[test]
    fn test_remove_tree_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("c").join("15.2u25");
        ensure_dir(&tree.join("x86_64")).unwrap();

        remove_tree(&tree).unwrap();
        assert!(!tree.exists());
        remove_tree(&tree).unwrap();
    }

    #[test]
    fn test_data_paths() {
        let layout = Layout::new("/work/bsc1", Some(PathBuf::from("/data")));
        let cs = sample("15.2u25", &["x86_64"]);

        assert_eq!(
            layout.kernel_image(&cs, "x86_64").unwrap(),
            PathBuf::from("/data/15.2u25/x86_64/boot/vmlinux-5.3.18-24.67-default")
        );
        assert_eq!(
            layout.obj_dir(&cs).unwrap(),
            PathBuf::from("/data/15.2u25/usr/src/linux-5.3.18-24.67-obj/x86_64/default")
        );
        assert_eq!(
            layout.kernel_rpms_dir("15.2u25").unwrap(),
            PathBuf::from("/data/15.2u25/kernel-rpms")
        );
    }

    #[test]
    fn test_rt_image_uses_rt_ktype() {
        let layout = Layout::new("/work/bsc1", Some(PathBuf::from("/data")));
        let cs = sample("15.4rtu3", &["x86_64"]);
        assert!(layout
            .kernel_image(&cs, "x86_64")
            .unwrap()
            .ends_with("vmlinux-5.3.18-24.67-rt"));
    }

    #[test]
    fn test_missing_data_dir_is_config_error() {
        let layout = Layout::new("/work/bsc1", None);
        assert!(matches!(
            layout.data_dir("15.2u25"),
            Err(KlpError::Config(_))
        ));
        assert_eq!(
            layout.livepatch_rpm_dir("15.2u25", "s390x"),
            PathBuf::from("/work/bsc1/c/15.2u25/s390x/rpm")
        );
    }
}
