//! External tool invocations.
//!
//! Archive handling is done by the distribution tools (`rpm2cpio`, `cpio`,
//! `unzstd`, `xz`, `gzip`, `tar`, `make`). The [`ArchiveTools`] seam lets the
//! pipeline and the bundle step run against a fake in tests.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{KlpError, Result};

/// Run `program args...` in `dir` and return its stdout.
///
/// A non-zero exit status becomes [`KlpError::Command`] carrying stderr.
pub async fn run_command(program: &str, args: &[&str], dir: &Path) -> Result<String> {
    debug!("running {} {:?} in {}", program, args, dir.display());

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| KlpError::Command {
            program: program.to_string(),
            dir: dir.to_path_buf(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(KlpError::Command {
            program: program.to_string(),
            dir: dir.to_path_buf(),
            stderr: format!("{} {}", stderr.trim(), stdout.trim()).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Archive and payload operations on the local filesystem.
#[async_trait]
pub trait ArchiveTools: Send + Sync {
    /// Unpack `rpm` into `dest`, which must exist.
    async fn extract_rpm(&self, rpm: &Path, dest: &Path) -> Result<()>;

    /// Decompress a `.zst`, `.xz` or `.gz` file in place, removing the
    /// compressed original.
    async fn decompress(&self, file: &Path) -> Result<()>;

    /// Regenerate `.config` in a kernel object tree.
    async fn olddefconfig(&self, obj_dir: &Path) -> Result<()>;

    /// Create `<parent>/<name>.tar.xz` from `<parent>/<name>`.
    async fn archive_dir(&self, parent: &Path, name: &str) -> Result<()>;
}

/// [`ArchiveTools`] backed by the host's command-line tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTools;

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[async_trait]
impl ArchiveTools for SystemTools {
    async fn extract_rpm(&self, rpm: &Path, dest: &Path) -> Result<()> {
        let rpm = path_arg(rpm);
        run_command(
            "sh",
            &["-c", "rpm2cpio \"$1\" | cpio --quiet -uidm", "sh", rpm.as_str()],
            dest,
        )
        .await?;
        Ok(())
    }

    async fn decompress(&self, file: &Path) -> Result<()> {
        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        let name = path_arg(file);
        let ext = file.extension().and_then(|e| e.to_str()).unwrap_or_default();

        match ext {
            "zst" => run_command("unzstd", &["--rm", "-f", "-d", "--quiet", name.as_str()], dir).await?,
            "xz" => run_command("xz", &["--quiet", "-d", "-f", name.as_str()], dir).await?,
            "gz" => run_command("gzip", &["-d", "-f", name.as_str()], dir).await?,
            _ => {
                return Err(KlpError::Command {
                    program: "decompress".to_string(),
                    dir: file.to_path_buf(),
                    stderr: format!("unsupported compression '{ext}'"),
                })
            }
        };
        Ok(())
    }

    async fn olddefconfig(&self, obj_dir: &Path) -> Result<()> {
        run_command("make", &["olddefconfig"], obj_dir).await?;
        Ok(())
    }

    async fn archive_dir(&self, parent: &Path, name: &str) -> Result<()> {
        let archive = format!("{name}.tar.xz");
        run_command("tar", &["-cJf", archive.as_str(), name], parent).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let dir = tempdir().unwrap();
        let out = run_command("echo", &["hello"], dir.path()).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_failure_names_program() {
        let dir = tempdir().unwrap();
        let err = run_command("false", &[], dir.path()).await.unwrap_err();
        assert!(matches!(err, KlpError::Command { ref program, .. } if program == "false"));
    }

    #[tokio::test]
    async fn test_missing_program_is_command_error() {
        let dir = tempdir().unwrap();
        let err = run_command("definitely-not-a-real-tool", &[], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, KlpError::Command { .. }));
    }

    #[tokio::test]
    async fn test_decompress_gzip_in_place() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("vmlinux-5.3.18-default");
        std::fs::write(&plain, b"image").unwrap();
        run_command("gzip", &["-f", "vmlinux-5.3.18-default"], dir.path())
            .await
            .unwrap();

        SystemTools
            .decompress(&dir.path().join("vmlinux-5.3.18-default.gz"))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&plain).unwrap(), b"image");
        assert!(!dir.path().join("vmlinux-5.3.18-default.gz").exists());
    }
}
