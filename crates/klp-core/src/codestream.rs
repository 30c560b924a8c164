//! Codestream model.
//!
//! A codestream is one kernel release variant patches are built against,
//! identified as `<sle>.<sp>[rt]u<update>` (for example `15.2u25` or
//! `15.4rtu3`). The set of codestreams for a bug is persisted in
//! `codestreams.json` by the setup step and is read-only here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{cached_regex, KlpError, Result};

/// Every architecture livepatches are built for.
pub const ARCHS: &[&str] = &["ppc64le", "s390x", "x86_64"];

/// Architecture that also receives source and development packages.
pub const PRIMARY_ARCH: &str = "x86_64";

/// Repository name that needs no package-name suffix.
pub const STANDARD_REPO: &str = "standard";

fn id_regex() -> Result<&'static Regex> {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached_regex(&RE, r"^(\d+)\.(\d+)(rt)?u(\d+)$")
}

/// Numeric breakdown of a codestream identifier.
///
/// Field order gives the natural ordering: `15.2u9` sorts before `15.2u10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodestreamTuple {
    pub sle: u32,
    pub sp: u32,
    pub update: u32,
    pub rt: bool,
}

impl FromStr for CodestreamTuple {
    type Err = KlpError;

    fn from_str(id: &str) -> Result<Self> {
        let caps = id_regex()?
            .captures(id)
            .ok_or_else(|| KlpError::InvalidCodestream(id.to_string()))?;
        let num = |i: usize| {
            caps[i]
                .parse::<u32>()
                .map_err(|_| KlpError::InvalidCodestream(id.to_string()))
        };

        Ok(CodestreamTuple {
            sle: num(1)?,
            sp: num(2)?,
            update: num(4)?,
            rt: caps.get(3).is_some(),
        })
    }
}

/// Kernel flavor a codestream ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFlavor {
    Default,
    Realtime,
}

impl KernelFlavor {
    /// Name used in package names, module directories and image names.
    pub fn ktype(self) -> &'static str {
        match self {
            KernelFlavor::Default => "default",
            KernelFlavor::Realtime => "rt",
        }
    }
}

/// Repository channel the upstream kernel packages come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoChannel {
    Standard,
    /// Maintenance channels suffix package names with `.<repo>`.
    Named(String),
}

impl RepoChannel {
    pub fn from_repo(repo: &str) -> Self {
        if repo == STANDARD_REPO {
            RepoChannel::Standard
        } else {
            RepoChannel::Named(repo.to_string())
        }
    }

    fn qualify(&self, package: &str) -> String {
        match self {
            RepoChannel::Standard => package.to_string(),
            RepoChannel::Named(repo) => format!("{package}.{repo}"),
        }
    }
}

/// Remote package names for one codestream, resolved once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageNames {
    /// Kernel binary package (`kernel-default` / `kernel-rt`)
    pub kernel: String,
    /// Kernel source package (`kernel-source` / `kernel-source-rt`)
    pub source: String,
}

impl PackageNames {
    pub fn resolve(flavor: KernelFlavor, channel: &RepoChannel) -> Self {
        let (kernel, source) = match flavor {
            KernelFlavor::Default => ("kernel-default", "kernel-source"),
            KernelFlavor::Realtime => ("kernel-rt", "kernel-source-rt"),
        };
        PackageNames {
            kernel: channel.qualify(kernel),
            source: channel.qualify(source),
        }
    }
}

/// Fields persisted per codestream in `codestreams.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodestreamData {
    /// Upstream build service project holding the kernel packages
    pub project: String,
    /// Repository of `project` to build against
    pub repo: String,
    /// Kernel version string, e.g. `5.3.18-24.67`
    pub kernel: String,
    pub archs: Vec<String>,
}

/// A codestream with its derived tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codestream {
    pub id: String,
    pub tuple: CodestreamTuple,
    pub project: String,
    pub repo: String,
    pub kernel: String,
    pub archs: Vec<String>,
}

impl Codestream {
    pub fn new(id: &str, data: CodestreamData) -> Result<Self> {
        Ok(Codestream {
            id: id.to_string(),
            tuple: id.parse()?,
            project: data.project,
            repo: data.repo,
            kernel: data.kernel,
            archs: data.archs,
        })
    }

    pub fn is_rt(&self) -> bool {
        self.tuple.rt
    }

    pub fn flavor(&self) -> KernelFlavor {
        if self.tuple.rt {
            KernelFlavor::Realtime
        } else {
            KernelFlavor::Default
        }
    }

    pub fn ktype(&self) -> &'static str {
        self.flavor().ktype()
    }

    pub fn has_arch(&self, arch: &str) -> bool {
        self.archs.iter().any(|a| a == arch)
    }

    pub fn package_names(&self) -> PackageNames {
        PackageNames::resolve(self.flavor(), &RepoChannel::from_repo(&self.repo))
    }

    /// Canonical release name: `15.2u25` becomes `SLE15-SP2_Update_25`.
    pub fn full_name(&self) -> String {
        let t = &self.tuple;
        let mut name = format!("SLE{}", t.sle);
        if t.sp > 0 {
            name.push_str(&format!("-SP{}", t.sp));
        }
        if t.rt {
            name.push_str("-RT");
        }
        format!("{name}_Update_{}", t.update)
    }

    /// Value written to the patch tree's release marker.
    pub fn release_version(&self) -> String {
        self.full_name()
    }
}

impl fmt::Display for Codestream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// The loaded codestream set, in natural order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodestreamMap {
    streams: Vec<Codestream>,
}

impl CodestreamMap {
    pub fn new(mut streams: Vec<Codestream>) -> Self {
        streams.sort_by(|a, b| a.tuple.cmp(&b.tuple));
        CodestreamMap { streams }
    }

    /// Parse the `codestreams.json` document.
    pub fn from_json(body: &str) -> Result<Self> {
        let raw: BTreeMap<String, CodestreamData> = serde_json::from_str(body)?;
        let streams = raw
            .into_iter()
            .map(|(id, data)| Codestream::new(&id, data))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(streams))
    }

    /// Load `codestreams.json`; a missing file yields an empty map.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path).map_err(|e| KlpError::at(path, e))?;
        Self::from_json(&body)
    }

    pub fn get(&self, id: &str) -> Result<&Codestream> {
        self.streams
            .iter()
            .find(|cs| cs.id == id)
            .ok_or_else(|| KlpError::UnknownCodestream(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Codestream> {
        self.streams.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.streams.iter().map(|cs| cs.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Keep only the codestreams `keep` accepts, preserving order.
    pub fn retain(&self, keep: impl Fn(&Codestream) -> bool) -> Self {
        CodestreamMap {
            streams: self.streams.iter().filter(|cs| keep(cs)).cloned().collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample(id: &str, archs: &[&str]) -> Codestream {
    Codestream::new(
        id,
        CodestreamData {
            project: "SUSE:Maintenance:1234".to_string(),
            repo: "SUSE_SLE-15-SP2_Update".to_string(),
            kernel: "5.3.18-24.67".to_string(),
            archs: archs.iter().map(|a| a.to_string()).collect(),
        },
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tuple() {
        let t: CodestreamTuple = "15.2u25".parse().unwrap();
        assert_eq!(
            t,
            CodestreamTuple {
                sle: 15,
                sp: 2,
                update: 25,
                rt: false
            }
        );

        let rt: CodestreamTuple = "15.4rtu3".parse().unwrap();
        assert!(rt.rt);
        assert_eq!(rt.update, 3);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("15_2u25".parse::<CodestreamTuple>().is_err());
        assert!("sle15".parse::<CodestreamTuple>().is_err());
    }

    #[test]
    fn test_full_name() {
        assert_eq!(sample("15.2u25", &[]).full_name(), "SLE15-SP2_Update_25");
        assert_eq!(sample("12.0u3", &[]).full_name(), "SLE12_Update_3");
        assert_eq!(sample("15.4rtu3", &[]).full_name(), "SLE15-SP4-RT_Update_3");
    }

    #[test]
    fn test_package_names_resolved_per_variant() {
        let names = PackageNames::resolve(KernelFlavor::Default, &RepoChannel::Standard);
        assert_eq!(names.kernel, "kernel-default");
        assert_eq!(names.source, "kernel-source");

        let rt = PackageNames::resolve(
            KernelFlavor::Realtime,
            &RepoChannel::from_repo("SUSE_SLE-15-SP4_Update"),
        );
        assert_eq!(rt.kernel, "kernel-rt.SUSE_SLE-15-SP4_Update");
        assert_eq!(rt.source, "kernel-source-rt.SUSE_SLE-15-SP4_Update");
    }

    #[test]
    fn test_map_is_naturally_ordered() {
        let body = r#"{
            "15.2u10": {"project": "P", "repo": "standard", "kernel": "5.3.18-24.1", "archs": ["x86_64"]},
            "15.2u9":  {"project": "P", "repo": "standard", "kernel": "5.3.18-22.1", "archs": ["x86_64"]},
            "12.5u5":  {"project": "P", "repo": "standard", "kernel": "4.12.14-122", "archs": ["x86_64"]}
        }"#;

        let map = CodestreamMap::from_json(body).unwrap();
        assert_eq!(map.ids(), vec!["12.5u5", "15.2u9", "15.2u10"]);
        assert!(map.get("15.2u9").unwrap().has_arch("x86_64"));
        assert!(matches!(
            map.get("15.3u1"),
            Err(KlpError::UnknownCodestream(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = CodestreamMap::load(&dir.path().join("codestreams.json")).unwrap();
        assert!(map.is_empty());
    }
}
