//! HTTP client for the build service API

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ObsConfig;
use crate::error::ObsError;
use crate::model::{self, ArchResult, BinaryList, ProjectCollection, ProjectEntry, ProjectMeta, ResultList};
use crate::service::{BuildService, DeleteOutcome, DownloadOutcome};
use crate::ObsResult;

/// reqwest-backed [`BuildService`]
pub struct ObsClient {
    config: ObsConfig,
    http_client: reqwest::Client,
}

impl ObsClient {
    /// Create a new client
    pub fn new(config: ObsConfig) -> ObsResult<Self> {
        let mut builder =
            reqwest::Client::builder().user_agent(concat!("klp-build/", env!("CARGO_PKG_VERSION")));
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }

        Ok(ObsClient {
            config,
            http_client: builder.build()?,
        })
    }

    /// Create client from environment variables
    pub fn from_env() -> ObsResult<Self> {
        Self::new(ObsConfig::from_env())
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.config.api_url, path.trim_start_matches('/'));
        let req = self.http_client.request(method, url);
        match &self.config.user {
            Some(user) => req.basic_auth(user, self.config.password.as_deref()),
            None => req,
        }
    }

    /// Send a request and turn any non-2xx answer into [`ObsError::Status`].
    async fn send(&self, req: RequestBuilder) -> ObsResult<Response> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(ObsError::Status {
            status: status.as_u16(),
            url,
            body,
        })
    }

    async fn get_text(&self, path: &str) -> ObsResult<String> {
        let response = self.send(self.request(Method::GET, path)).await?;
        Ok(response.text().await?)
    }
}

/// Write the body of `response` to `partial`, then move it to `dest`.
async fn stream_into(response: &mut Response, partial: &Path, dest: &Path) -> ObsResult<()> {
    let mut file = tokio::fs::File::create(partial).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(partial, dest).await?;
    Ok(())
}

#[async_trait]
impl BuildService for ObsClient {
    async fn search_projects(&self, prefix: &str) -> ObsResult<Vec<ProjectEntry>> {
        let query = format!("starts-with(@name, '{prefix}')");
        let req = self
            .request(Method::GET, "search/project")
            .query(&[("match", query.as_str())]);
        let body = self.send(req).await?.text().await?;

        let collection: ProjectCollection = model::parse(&body)?;
        debug!("search {} matched {} projects", prefix, collection.projects.len());
        Ok(collection.projects)
    }

    async fn binary_list(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
    ) -> ObsResult<Vec<String>> {
        let body = self
            .get_text(&format!("build/{project}/{repo}/{arch}/{package}"))
            .await?;
        let list: BinaryList = model::parse(&body)?;
        Ok(list.binaries.into_iter().map(|b| b.filename).collect())
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
        if tokio::fs::try_exists(&dest).await? {
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        let mut response = self
            .send(self.request(
                Method::GET,
                &format!("build/{project}/{repo}/{arch}/{package}/{filename}"),
            ))
            .await?;

        // Stream into a side file so an interrupted transfer is never taken
        // for a finished one on the next run.
        let partial = dest_dir.join(format!("{filename}.part"));
        if let Err(e) = stream_into(&mut response, &partial, &dest).await {
            if let Err(rm) = tokio::fs::remove_file(&partial).await {
                debug!("could not remove {}: {}", partial.display(), rm);
            }
            return Err(e);
        }

        Ok(DownloadOutcome::Downloaded)
    }

    async fn build_log(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
    ) -> ObsResult<String> {
        self.get_text(&format!("build/{project}/{repo}/{arch}/{package}/_log"))
            .await
    }

    async fn build_results(&self, project: &str) -> ObsResult<Vec<ArchResult>> {
        let body = self.get_text(&format!("build/{project}/_result")).await?;
        let list: ResultList = model::parse(&body)?;
        Ok(list.into())
    }

    async fn delete_project(&self, project: &str) -> ObsResult<DeleteOutcome> {
        let req = self
            .request(Method::DELETE, &format!("source/{project}"))
            .query(&[("force", "1")]);

        match self.send(req).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn set_project_meta(&self, meta: &ProjectMeta) -> ObsResult<()> {
        let req = self
            .request(Method::PUT, &format!("source/{}/_meta", meta.name))
            .body(meta.to_xml());
        self.send(req).await?;
        Ok(())
    }

    async fn set_package_meta(
        &self,
        project: &str,
        package: &str,
        title: &str,
        description: &str,
    ) -> ObsResult<()> {
        let req = self
            .request(Method::PUT, &format!("source/{project}/{package}/_meta"))
            .body(model::package_meta_xml(project, package, title, description));
        self.send(req).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ObsResult<()> {
        let req = self
            .request(Method::PUT, &format!("source/{project}/{package}/{name}"))
            .query(&[("rev", "upload")])
            .body(content);
        self.send(req).await?;
        Ok(())
    }

    async fn commit(&self, project: &str, package: &str, message: &str) -> ObsResult<()> {
        let req = self
            .request(Method::POST, &format!("source/{project}/{package}"))
            .query(&[("cmd", "commit"), ("comment", message)]);
        self.send(req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_client_keeps_api_url() {
        let client = ObsClient::new(ObsConfig::new("https://obs.example.com/")).unwrap();
        assert_eq!(client.api_url(), "https://obs.example.com");
    }

    #[tokio::test]
    async fn test_download_existing_file_is_skipped_without_network() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("klp.rpm"), b"rpm").unwrap();

        // Unroutable endpoint: any request would fail.
        let client = ObsClient::new(ObsConfig::new("http://127.0.0.1:9")).unwrap();
        let outcome = client
            .download_binary("prj", "devbuild", "x86_64", "klp", "klp.rpm", dir.path())
            .await
            .unwrap();

        assert_eq!(outcome, DownloadOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(dir.path().join("klp.rpm")).unwrap(), b"rpm");
    }

    #[tokio::test]
    async fn test_truncated_download_leaves_no_partial_file() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            // Promise more bytes than are sent, then hang up.
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc")
                .await
                .unwrap();
        });

        let dir = tempdir().unwrap();
        let client = ObsClient::new(ObsConfig::new(&format!("http://{addr}"))).unwrap();
        let result = client
            .download_binary("prj", "devbuild", "x86_64", "klp", "klp.rpm", dir.path())
            .await;
        server.await.unwrap();

        assert!(result.is_err());
        assert!(!dir.path().join("klp.rpm.part").exists());
        assert!(!dir.path().join("klp.rpm").exists());
    }
}
