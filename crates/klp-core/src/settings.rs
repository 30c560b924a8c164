//! Run settings resolved once, before the engine touches the network.
//!
//! Command-line values win over the environment (`KLP_WORK_DIR`,
//! `KLP_DATA_DIR`, `KLP_SCRIPTS_DIR`). Every missing required directory is a
//! [`KlpError::Config`].

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codestream::CodestreamMap;
use crate::error::{KlpError, Result};
use crate::layout::{ensure_dir, Layout};
use crate::registry::CodestreamFilter;

pub const WORK_DIR_ENV: &str = "KLP_WORK_DIR";
pub const DATA_DIR_ENV: &str = "KLP_DATA_DIR";
pub const SCRIPTS_DIR_ENV: &str = "KLP_SCRIPTS_DIR";

/// Raw operator input, typically straight from the command line.
#[derive(Debug, Clone, Default)]
pub struct SettingsInput {
    /// Bug number, with or without the `bsc` prefix
    pub bsc: String,
    pub filter: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub data: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Normalized bug id, e.g. `bsc1234567`
    pub bsc: String,
    pub filter: Option<String>,
    pub work_dir: PathBuf,
    /// `<work>/<bsc>`
    pub bsc_path: PathBuf,
    pub data: Option<PathBuf>,
    /// `~/kgr/kgraft-patches`: the patch source tree
    pub patches_dir: PathBuf,
    /// `~/kgr/kgraft-patches_testscripts`
    pub test_scripts_dir: PathBuf,
    /// Helper scripts such as `run-kgr-test.sh`
    pub scripts_dir: PathBuf,
    pub codestreams: CodestreamMap,
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(KlpError::Config(format!(
            "{what} should be a directory: {}",
            path.display()
        )))
    }
}

/// `1234567` and `bsc1234567` both name the same bug.
pub fn normalize_bsc(bsc: &str) -> String {
    if bsc.starts_with("bsc") {
        bsc.to_string()
    } else {
        format!("bsc{bsc}")
    }
}

impl Settings {
    /// Resolve against the environment and the operator's home directory.
    pub fn resolve(input: SettingsInput) -> Result<Self> {
        let home = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or_else(|| KlpError::Config("could not determine home directory".to_string()))?;

        let input = SettingsInput {
            work_dir: input.work_dir.or_else(|| env_path(WORK_DIR_ENV)),
            data: input.data.or_else(|| env_path(DATA_DIR_ENV)),
            ..input
        };
        Self::resolve_in(input, &home, env_path(SCRIPTS_DIR_ENV))
    }

    /// Resolution with explicit home and scripts locations; no environment
    /// lookups.
    pub fn resolve_in(
        input: SettingsInput,
        home: &Path,
        scripts_dir: Option<PathBuf>,
    ) -> Result<Self> {
        if input.bsc.is_empty() {
            return Err(KlpError::Config("--bsc should be defined".to_string()));
        }
        let bsc = normalize_bsc(&input.bsc);

        let work_dir = input.work_dir.ok_or_else(|| {
            KlpError::Config(format!("--work-dir or {WORK_DIR_ENV} should be defined"))
        })?;
        require_dir(&work_dir, "work dir")?;

        if let Some(data) = &input.data {
            require_dir(data, "data dir")?;
        }

        let kgr = home.join("kgr");
        let patches_dir = kgr.join("kgraft-patches");
        require_dir(&patches_dir, "patch source tree")?;
        let test_scripts_dir = kgr.join("kgraft-patches_testscripts");
        require_dir(&test_scripts_dir, "test scripts tree")?;

        // Fail on a bad filter here rather than after the first remote call.
        CodestreamFilter::new(input.filter.as_deref())?;

        let bsc_path = work_dir.join(&bsc);
        ensure_dir(&bsc_path)?;
        let codestreams = CodestreamMap::load(&bsc_path.join("codestreams.json"))?;
        debug!("{} codestreams loaded for {}", codestreams.len(), bsc);

        Ok(Settings {
            scripts_dir: scripts_dir.unwrap_or_else(|| work_dir.join("scripts")),
            bsc,
            filter: input.filter,
            work_dir,
            bsc_path,
            data: input.data,
            patches_dir,
            test_scripts_dir,
            codestreams,
        })
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.bsc_path, self.data.clone())
    }

    pub fn codestream_filter(&self) -> Result<CodestreamFilter> {
        CodestreamFilter::new(self.filter.as_deref())
    }

    /// `<bsc>_test_script.sh` in the test scripts tree.
    pub fn test_script(&self) -> PathBuf {
        self.test_scripts_dir
            .join(format!("{}_test_script.sh", self.bsc))
    }
}
