//! Wire models for the build service XML API.
//!
//! Only the attributes the orchestration engine reads are mapped; everything
//! else in a response is ignored.

use quick_xml::escape::escape;
use serde::Deserialize;

use crate::ObsResult;

/// `<collection>` returned by `/search/project`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectCollection {
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectEntry>,
}

/// One project as returned by a search query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectEntry {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "repository", default)]
    pub repositories: Vec<RepositoryEntry>,
}

impl ProjectEntry {
    pub fn new(name: &str, repositories: Vec<RepositoryEntry>) -> Self {
        Self {
            name: name.to_string(),
            repositories,
        }
    }

    /// Architectures of every repository, in document order.
    pub fn archs(&self) -> Vec<String> {
        self.repositories
            .iter()
            .flat_map(|r| r.archs.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryEntry {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "arch", default)]
    pub archs: Vec<String>,
}

impl RepositoryEntry {
    pub fn new(name: &str, archs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            archs: archs.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// `<binarylist>` returned by `/build/<prj>/<repo>/<arch>/<pkg>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BinaryList {
    #[serde(rename = "binary", default)]
    pub binaries: Vec<BinaryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinaryEntry {
    #[serde(rename = "@filename")]
    pub filename: String,
    #[serde(rename = "@size", default)]
    pub size: Option<u64>,
}

/// `<resultlist>` returned by `/build/<prj>/_result`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultList {
    #[serde(rename = "result", default)]
    pub results: Vec<ResultEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEntry {
    #[serde(rename = "@arch")]
    pub arch: String,
    #[serde(rename = "@repository", default)]
    pub repository: Option<String>,
    #[serde(rename = "status", default)]
    pub statuses: Vec<PackageStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageStatus {
    #[serde(rename = "@package", default)]
    pub package: Option<String>,
    #[serde(rename = "@code")]
    pub code: String,
}

/// Build code reported for one architecture of a project.
///
/// `code` is the raw service string; interpretation is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchResult {
    pub arch: String,
    pub code: String,
}

impl ArchResult {
    pub fn new(arch: &str, code: &str) -> Self {
        Self {
            arch: arch.to_string(),
            code: code.to_string(),
        }
    }
}

impl From<ResultList> for Vec<ArchResult> {
    fn from(list: ResultList) -> Self {
        list.results
            .into_iter()
            .map(|r| ArchResult {
                code: r
                    .statuses
                    .first()
                    .map(|s| s.code.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                arch: r.arch,
            })
            .collect()
    }
}

/// Upstream repository a project builds against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPath {
    pub project: String,
    pub repository: String,
}

/// Project metadata document sent to `/source/<prj>/_meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMeta {
    pub name: String,
    pub title: String,
    pub description: String,
    /// Account recorded as bugowner and maintainer
    pub owner: String,
    /// Name of the single repository the project defines
    pub repository: String,
    pub path: RepositoryPath,
    pub archs: Vec<String>,
}

impl ProjectMeta {
    /// Render the document. Build is enabled, publish and debuginfo are not.
    pub fn to_xml(&self) -> String {
        let archs: String = self
            .archs
            .iter()
            .map(|a| format!("<arch>{}</arch>", escape(a)))
            .collect();

        format!(
            "<project name=\"{name}\"><title>{title}</title>\
             <description>{description}</description>\
             <person userid=\"{owner}\" role=\"bugowner\"/>\
             <person userid=\"{owner}\" role=\"maintainer\"/>\
             <build><enable/></build><publish><disable/></publish>\
             <debuginfo><disable/></debuginfo>\
             <repository name=\"{repo}\">\
             <path project=\"{path_prj}\" repository=\"{path_repo}\"/>{archs}\
             </repository></project>",
            name = escape(&self.name),
            title = escape(&self.title),
            description = escape(&self.description),
            owner = escape(&self.owner),
            repo = escape(&self.repository),
            path_prj = escape(&self.path.project),
            path_repo = escape(&self.path.repository),
            archs = archs,
        )
    }
}

/// Render a package metadata document for `/source/<prj>/<pkg>/_meta`.
pub fn package_meta_xml(project: &str, package: &str, title: &str, description: &str) -> String {
    format!(
        "<package name=\"{}\" project=\"{}\"><title>{}</title><description>{}</description></package>",
        escape(package),
        escape(project),
        escape(title),
        escape(description)
    )
}

pub(crate) fn parse<'de, T: Deserialize<'de>>(body: &'de str) -> ObsResult<T> {
    Ok(quick_xml::de::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_collection() {
        let body = r#"<collection matches="2">
            <project name="home:jdoe:bsc1-klp-15_2u25">
              <title></title><description/>
              <repository name="devbuild">
                <path project="SUSE:Maintenance:1" repository="SUSE_SLE-15-SP2_Update"/>
                <arch>x86_64</arch>
                <arch>ppc64le</arch>
              </repository>
            </project>
            <project name="home:jdoe:bsc1-klp-12_5u5"/>
        </collection>"#;

        let collection: ProjectCollection = parse(body).unwrap();
        assert_eq!(collection.projects.len(), 2);
        assert_eq!(collection.projects[0].archs(), vec!["x86_64", "ppc64le"]);
        assert!(collection.projects[1].archs().is_empty());
    }

    #[test]
    fn test_parse_binary_list() {
        let body = r#"<binarylist>
            <binary filename="kernel-default-5.3.18-24.x86_64.rpm" size="100" mtime="1"/>
            <binary filename="_statistics" size="10" mtime="1"/>
        </binarylist>"#;

        let list: BinaryList = parse(body).unwrap();
        let names: Vec<_> = list.binaries.iter().map(|b| b.filename.as_str()).collect();
        assert_eq!(names, vec!["kernel-default-5.3.18-24.x86_64.rpm", "_statistics"]);
    }

    #[test]
    fn test_result_list_takes_first_status_code() {
        let body = r#"<resultlist state="x">
            <result project="p" repository="devbuild" arch="x86_64" code="published" state="published">
              <status package="klp" code="succeeded"/>
            </result>
            <result project="p" repository="devbuild" arch="s390x" code="building" state="building"/>
        </resultlist>"#;

        let list: ResultList = parse(body).unwrap();
        let results: Vec<ArchResult> = list.into();
        assert_eq!(results[0], ArchResult::new("x86_64", "succeeded"));
        assert_eq!(results[1], ArchResult::new("s390x", "unknown"));
    }

    #[test]
    fn test_project_meta_xml() {
        let meta = ProjectMeta {
            name: "home:jdoe:bsc1-klp-15_2u25".to_string(),
            title: String::new(),
            description: "Development of livepatches for 15.2u25".to_string(),
            owner: "jdoe".to_string(),
            repository: "devbuild".to_string(),
            path: RepositoryPath {
                project: "SUSE:Maintenance:1".to_string(),
                repository: "SUSE_SLE-15-SP2_Update".to_string(),
            },
            archs: vec!["x86_64".to_string(), "s390x".to_string()],
        };

        let xml = meta.to_xml();
        assert!(xml.contains("<build><enable/></build>"));
        assert!(xml.contains("<publish><disable/></publish>"));
        assert!(xml.contains("<debuginfo><disable/></debuginfo>"));
        assert!(xml.contains(
            "<path project=\"SUSE:Maintenance:1\" repository=\"SUSE_SLE-15-SP2_Update\"/>"
        ));
        assert!(xml.contains("<arch>x86_64</arch><arch>s390x</arch>"));
        assert!(xml.contains("userid=\"jdoe\" role=\"maintainer\""));
    }
}
