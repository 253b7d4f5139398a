//! In-process stand-ins for the HTTP transport and the external tools, used
//! by unit and integration tests.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use lockbox_core::config::RegistryLogin;
use lockbox_core::error::{LockboxError, Result};
use parking_lot::Mutex;

use crate::fetch::container::ContainerRuntime;
use crate::fetch::ostree::OstreeTool;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

#[derive(Debug, Clone)]
enum Reply {
    Respond(HttpResponse),
    Refuse,
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    method: Option<HttpMethod>,
    url: String,
    bearer: Option<String>,
}

/// [`HttpTransport`] answering from a fixed script.
///
/// Unscripted URLs get a 404. A route registered with a bearer token only
/// matches requests carrying that token, and wins over the plain route.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<RouteKey, Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, method: Option<HttpMethod>, url: &str, bearer: Option<&str>, reply: Reply) {
        self.routes.lock().insert(
            RouteKey {
                method,
                url: url.to_string(),
                bearer: bearer.map(str::to_string),
            },
            reply,
        );
    }

    pub fn on_get(&self, url: &str, response: HttpResponse) {
        self.script(Some(HttpMethod::Get), url, None, Reply::Respond(response));
    }

    pub fn on_head(&self, url: &str, response: HttpResponse) {
        self.script(Some(HttpMethod::Head), url, None, Reply::Respond(response));
    }

    pub fn on_post(&self, url: &str, response: HttpResponse) {
        self.script(Some(HttpMethod::Post), url, None, Reply::Respond(response));
    }

    /// Answer GETs of `url` that carry `Bearer <token>`.
    pub fn on_get_with_bearer(&self, url: &str, token: &str, response: HttpResponse) {
        self.script(Some(HttpMethod::Get), url, Some(token), Reply::Respond(response));
    }

    /// Fail every request to `url` without a response.
    pub fn refuse(&self, url: &str) {
        self.script(None, url, None, Reply::Refuse);
    }

    /// Never answer requests to `url`.
    pub fn hang(&self, url: &str) {
        self.script(None, url, None, Reply::Hang);
    }

    /// Every request sent so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of requests sent to `url`.
    pub fn count_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }

    fn lookup(&self, request: &HttpRequest) -> Option<Reply> {
        let bearer = request
            .header_value("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let routes = self.routes.lock();
        let key = |method: Option<HttpMethod>, bearer: Option<String>| RouteKey {
            method,
            url: request.url.clone(),
            bearer,
        };

        let mut candidates = Vec::new();
        if bearer.is_some() {
            candidates.push(key(Some(request.method), bearer));
        }
        candidates.push(key(Some(request.method), None));
        candidates.push(key(None, None));
        candidates.into_iter().find_map(|k| routes.get(&k).cloned())
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let reply = self.lookup(&request);
        let url = request.url.clone();
        self.requests.lock().push(request);

        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Refuse) => Err(LockboxError::Other(format!("connection refused: {}", url))),
            Some(Reply::Hang) => {
                std::future::pending::<()>().await;
                Err(LockboxError::Timeout(url))
            }
            None => Ok(HttpResponse::new(404, Vec::new())),
        }
    }
}

/// [`OstreeTool`] recording its calls.
///
/// `init_archive` creates the directory without recording a call.
#[derive(Default)]
pub struct FakeOstree {
    calls: Mutex<Vec<String>>,
    fail_pull: bool,
}

impl FakeOstree {
    /// A tool whose pulls fail.
    pub fn failing_pull() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_pull: true,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl OstreeTool for FakeOstree {
    async fn init_archive(&self, repo: &Path) -> Result<()> {
        std::fs::create_dir_all(repo)?;
        Ok(())
    }

    async fn remote_add(&self, _repo: &Path, name: &str, url: &str) -> Result<()> {
        self.record(format!("remote add {} {}", name, url));
        Ok(())
    }

    async fn remote_delete(&self, _repo: &Path, name: &str) -> Result<()> {
        self.record(format!("remote delete {}", name));
        Ok(())
    }

    async fn pull(
        &self,
        _repo: &Path,
        remote: &str,
        commit: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let auth = if token.is_some() { "token" } else { "anonymous" };
        self.record(format!("pull {} {} {}", remote, commit, auth));
        if self.fail_pull {
            return Err(LockboxError::Collaborator {
                tool: "ostree".to_string(),
                message: "pull failed".to_string(),
            });
        }
        Ok(())
    }

    async fn create_ref(&self, _repo: &Path, ref_name: &str, commit: &str) -> Result<()> {
        self.record(format!("ref {} {}", ref_name, commit));
        Ok(())
    }
}

/// [`ContainerRuntime`] recording its calls; `save` writes a small tarball.
#[derive(Default)]
pub struct FakeContainerRuntime {
    calls: Mutex<Vec<String>>,
}

impl FakeContainerRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn login(&self, registry: Option<&str>, login: &RegistryLogin) -> Result<()> {
        self.record(format!(
            "login {} {}",
            registry.unwrap_or("default"),
            login.username
        ));
        Ok(())
    }

    async fn pull(&self, image_spec: &str) -> Result<()> {
        self.record(format!("pull {}", image_spec));
        Ok(())
    }

    async fn tag(&self, source: &str, repository: &str, tag: &str) -> Result<()> {
        self.record(format!("tag {} {}:{}", source, repository, tag));
        Ok(())
    }

    async fn save(&self, image: &str, dest: &Path) -> Result<()> {
        self.record(format!("save {} {}", image, dest.display()));
        std::fs::write(dest, format!("image {}", image))?;
        Ok(())
    }
}
