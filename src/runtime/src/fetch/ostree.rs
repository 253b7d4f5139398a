//! OSTree targets: commit lookup on the OTA server or the public feed, and
//! pulling into the bundle's archive repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lockbox_core::error::{LockboxError, Result};
use tokio::process::Command;

use super::process::{run_tool, DEFAULT_TOOL_TIMEOUT};
use crate::http::{join_url, HttpRequest, HttpTransport};
use crate::uptane::Target;

/// Public feed used when the user's server does not have a commit.
pub const OSTREE_PUBLIC_FEED: &str = "https://feeds.toradex.com/ostree";

/// Name of the throwaway remote used while pulling.
pub const TEMP_REMOTE: &str = "tmpremote";

/// OSTree repository operations.
#[async_trait]
pub trait OstreeTool: Send + Sync {
    /// Create an `archive` mode repository at `repo` unless one exists.
    async fn init_archive(&self, repo: &Path) -> Result<()>;
    async fn remote_add(&self, repo: &Path, name: &str, url: &str) -> Result<()>;
    async fn remote_delete(&self, repo: &Path, name: &str) -> Result<()>;
    /// Pull `commit` from `remote`, sending `token` as a bearer token.
    async fn pull(&self, repo: &Path, remote: &str, commit: &str, token: Option<&str>)
        -> Result<()>;
    async fn create_ref(&self, repo: &Path, ref_name: &str, commit: &str) -> Result<()>;
}

/// [`OstreeTool`] driving the `ostree` command-line tool.
pub struct OstreeCli {
    binary: String,
    timeout: Duration,
}

impl OstreeCli {
    pub fn new() -> Self {
        Self {
            binary: "ostree".to_string(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, repo: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("--repo={}", repo.display()));
        cmd
    }

    async fn run(&self, cmd: Command) -> Result<Vec<u8>> {
        run_tool("ostree", cmd, None, self.timeout).await
    }
}

impl Default for OstreeCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OstreeTool for OstreeCli {
    async fn init_archive(&self, repo: &Path) -> Result<()> {
        if repo.join("config").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(repo)?;
        let mut cmd = self.command(repo);
        cmd.args(["init", "--mode=archive"]);
        self.run(cmd).await.map(|_| ())
    }

    async fn remote_add(&self, repo: &Path, name: &str, url: &str) -> Result<()> {
        let mut cmd = self.command(repo);
        cmd.args(["remote", "add", "--force", "--no-gpg-verify", name, url]);
        self.run(cmd).await.map(|_| ())
    }

    async fn remote_delete(&self, repo: &Path, name: &str) -> Result<()> {
        let mut cmd = self.command(repo);
        cmd.args(["remote", "delete", "--if-exists", name]);
        self.run(cmd).await.map(|_| ())
    }

    async fn pull(
        &self,
        repo: &Path,
        remote: &str,
        commit: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let mut cmd = self.command(repo);
        cmd.arg("pull");
        if let Some(token) = token {
            cmd.arg(format!("--http-header=Authorization=Bearer {}", token));
        }
        cmd.args([remote, commit]);
        self.run(cmd).await.map(|_| ())
    }

    async fn create_ref(&self, repo: &Path, ref_name: &str, commit: &str) -> Result<()> {
        let create = format!("--create={}", ref_name);
        let mut cmd = self.command(repo);
        cmd.args(["refs", "--force", create.as_str(), commit]);
        self.run(cmd).await.map(|_| ())
    }
}

/// Whether `server` has commit object `commit` (HEAD request).
///
/// Only a 404 means the commit is absent; any other failure status is an
/// error.
pub async fn commit_exists(
    transport: &dyn HttpTransport,
    server: &str,
    commit: &str,
    token: Option<&str>,
) -> Result<bool> {
    if commit.len() < 3 || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LockboxError::InvalidData(format!(
            "Invalid OSTree commit hash '{}'",
            commit
        )));
    }
    let url = join_url(
        server,
        &format!("objects/{}/{}.commit", &commit[..2], &commit[2..]),
    );
    let mut request = HttpRequest::head(&url);
    if let Some(token) = token {
        request = request.bearer(token);
    }
    let response = transport.send(request).await?;
    tracing::debug!(url = %url, status = response.status, "Commit lookup");
    match response.status {
        _ if response.is_success() => Ok(true),
        404 => Ok(false),
        status => Err(LockboxError::InvalidData(format!(
            "Unexpected status {} checking for commit at {}",
            status, url
        ))),
    }
}

/// Fetches OSTree targets into `images/ostree`.
pub struct OstreeFetcher {
    transport: Arc<dyn HttpTransport>,
    tool: Arc<dyn OstreeTool>,
    public_feed: String,
}

impl OstreeFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, tool: Arc<dyn OstreeTool>) -> Self {
        Self {
            transport,
            tool,
            public_feed: OSTREE_PUBLIC_FEED.to_string(),
        }
    }

    pub fn with_public_feed(mut self, url: impl Into<String>) -> Self {
        self.public_feed = url.into();
        self
    }

    /// Pull the commit of `target` into `<images_dir>/ostree`.
    ///
    /// A `custom.uri` on the target names the server and disables the
    /// token. Otherwise the user's server is tried with the token, then the
    /// public feed without it.
    pub async fn fetch(
        &self,
        name: &str,
        target: &Target,
        images_dir: &Path,
        user_server: Option<&str>,
        token: Option<&str>,
    ) -> Result<PathBuf> {
        let commit = target.hashes.sha256.as_str();

        let (server, token) = match target.uri() {
            Some(uri) => (uri.to_string(), None),
            None => {
                let mut found = None;
                if let Some(server) = user_server {
                    if commit_exists(self.transport.as_ref(), server, commit, token).await? {
                        found = Some((server.to_string(), token));
                    }
                }
                if let Some(found) = found {
                    found
                } else if commit_exists(self.transport.as_ref(), &self.public_feed, commit, None)
                    .await?
                {
                    (self.public_feed.clone(), None)
                } else {
                    return Err(LockboxError::TargetNotFound {
                        name: format!("{} (OSTree commit {})", name, commit),
                    });
                }
            }
        };

        let repo = images_dir.join("ostree");
        tracing::info!(
            target_name = %target.display_name(),
            commit = %commit,
            server = %server,
            "Pulling OSTree commit"
        );

        self.tool.init_archive(&repo).await?;
        self.tool.remote_add(&repo, TEMP_REMOTE, &server).await?;
        let pulled = self.tool.pull(&repo, TEMP_REMOTE, commit, token).await;
        if pulled.is_ok() {
            if let Err(e) = self.tool.create_ref(&repo, name, commit).await {
                tracing::warn!(reference = %name, error = %e, "Could not create OSTree ref");
            }
        }
        // Drop the remote whether or not the pull succeeded
        if let Err(e) = self.tool.remote_delete(&repo, TEMP_REMOTE).await {
            tracing::warn!(error = %e, "Could not delete temporary OSTree remote");
        }
        pulled?;

        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::testing::{FakeOstree, ScriptedTransport};
    use crate::uptane::metadata::{TargetCustom, TargetFormat, TargetHashes};

    const COMMIT: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";

    fn ostree_target(uri: Option<&str>) -> Target {
        Target {
            hashes: TargetHashes {
                sha256: COMMIT.to_string(),
            },
            length: 0,
            custom: Some(TargetCustom {
                target_format: Some(TargetFormat::Ostree),
                name: Some("torizon-os".to_string()),
                version: Some("7.0".to_string()),
                hardware_ids: vec!["verdin-imx8mp".to_string()],
                uri: uri.map(str::to_string),
            }),
        }
    }

    fn commit_url(server: &str) -> String {
        format!("{}/objects/ab/{}.commit", server, &COMMIT[2..])
    }

    #[tokio::test]
    async fn test_pull_from_user_server_with_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_head(&commit_url("https://ota.example/treehub"), HttpResponse::new(200, Vec::new()));
        let tool = Arc::new(FakeOstree::default());
        let fetcher = OstreeFetcher::new(transport.clone(), tool.clone());
        let dir = tempfile::tempdir().unwrap();

        let repo = fetcher
            .fetch(
                "torizon-os-7.0",
                &ostree_target(None),
                dir.path(),
                Some("https://ota.example/treehub"),
                Some("tok"),
            )
            .await
            .unwrap();
        assert_eq!(repo, dir.path().join("ostree"));

        let calls = tool.calls();
        assert!(calls.contains(&"remote add tmpremote https://ota.example/treehub".to_string()));
        assert!(calls.contains(&format!("pull tmpremote {} token", COMMIT)));
        assert!(calls.contains(&format!("ref torizon-os-7.0 {}", COMMIT)));
        assert_eq!(calls.last().unwrap(), "remote delete tmpremote");
        assert_eq!(
            transport.requests()[0].header_value("Authorization"),
            Some("Bearer tok")
        );
    }

    #[tokio::test]
    async fn test_public_feed_fallback_drops_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_head(&commit_url("https://feeds.example/ostree"), HttpResponse::new(200, Vec::new()));
        let tool = Arc::new(FakeOstree::default());
        let fetcher = OstreeFetcher::new(transport.clone(), tool.clone())
            .with_public_feed("https://feeds.example/ostree");
        let dir = tempfile::tempdir().unwrap();

        fetcher
            .fetch("os", &ostree_target(None), dir.path(), Some("https://ota.example/treehub"), Some("tok"))
            .await
            .unwrap();

        let calls = tool.calls();
        assert!(calls.contains(&"remote add tmpremote https://feeds.example/ostree".to_string()));
        assert!(calls.contains(&format!("pull tmpremote {} anonymous", COMMIT)));
        let feed_request = &transport.requests()[1];
        assert_eq!(feed_request.header_value("Authorization"), None);
    }

    #[tokio::test]
    async fn test_user_server_error_does_not_fall_back() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_head(&commit_url("https://ota.example/treehub"), HttpResponse::new(500, Vec::new()));
        transport.on_head(&commit_url("https://feeds.example/ostree"), HttpResponse::new(200, Vec::new()));
        let tool = Arc::new(FakeOstree::default());
        let fetcher = OstreeFetcher::new(transport.clone(), tool.clone())
            .with_public_feed("https://feeds.example/ostree");
        let dir = tempfile::tempdir().unwrap();

        let err = fetcher
            .fetch("os", &ostree_target(None), dir.path(), Some("https://ota.example/treehub"), Some("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::InvalidData(_)));
        assert_eq!(transport.call_count(), 1);
        assert!(tool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_custom_uri_skips_lookup() {
        let transport = Arc::new(ScriptedTransport::new());
        let tool = Arc::new(FakeOstree::default());
        let fetcher = OstreeFetcher::new(transport.clone(), tool.clone());
        let dir = tempfile::tempdir().unwrap();

        fetcher
            .fetch("os", &ostree_target(Some("https://mirror.example/ostree")), dir.path(), None, Some("tok"))
            .await
            .unwrap();
        assert_eq!(transport.call_count(), 0);
        assert!(tool
            .calls()
            .contains(&format!("pull tmpremote {} anonymous", COMMIT)));
    }

    #[tokio::test]
    async fn test_commit_nowhere() {
        let transport = Arc::new(ScriptedTransport::new());
        let tool = Arc::new(FakeOstree::default());
        let fetcher = OstreeFetcher::new(transport, tool.clone())
            .with_public_feed("https://feeds.example/ostree");
        let dir = tempfile::tempdir().unwrap();

        let err = fetcher
            .fetch("os", &ostree_target(None), dir.path(), Some("https://ota.example/treehub"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::TargetNotFound { .. }));
        assert!(tool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pull_still_deletes_remote() {
        let transport = Arc::new(ScriptedTransport::new());
        let tool = Arc::new(FakeOstree::failing_pull());
        let fetcher = OstreeFetcher::new(transport, tool.clone());
        let dir = tempfile::tempdir().unwrap();

        let result = fetcher
            .fetch("os", &ostree_target(Some("https://mirror.example/ostree")), dir.path(), None, None)
            .await;
        assert!(result.is_err());
        assert_eq!(tool.calls().last().unwrap(), "remote delete tmpremote");
    }

    #[tokio::test]
    async fn test_invalid_commit_hash() {
        let transport = ScriptedTransport::new();
        assert!(commit_exists(&transport, "https://x", "zz", None).await.is_err());
    }
}
