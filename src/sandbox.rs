//! Narrow interface to the remote sandbox provisioning service.
//!
//! The swarm manager only ever talks to a `SandboxApi`; the production
//! implementation is a small JSON-over-HTTP client. The service's wire
//! protocol beyond these six calls is out of scope. Tests substitute an
//! in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{hlog_debug, Error, Result};

/// Result of running a command inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr if non-empty, otherwise stdout. Used for error messages.
    pub fn detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// The sandbox provisioning service, reduced to the calls the swarm needs.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Provision a sandbox from a template. Returns the sandbox id.
    async fn create(&self, template: &str, timeout: Duration) -> Result<String>;

    /// Verify a previously created sandbox is still reachable.
    async fn connect(&self, sandbox_id: &str) -> Result<()>;

    /// Run a shell command inside the sandbox.
    async fn run_command(
        &self,
        sandbox_id: &str,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput>;

    /// Write a file into the sandbox filesystem.
    async fn write_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Read a file from the sandbox filesystem as UTF-8 text.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String>;

    /// Force-terminate the sandbox.
    async fn kill(&self, sandbox_id: &str) -> Result<()>;
}

/// JSON-over-HTTP `SandboxApi` client.
pub struct HttpSandbox {
    http: reqwest::Client,
    base: String,
    api_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(Deserialize)]
struct ReadFileResponse {
    content: String,
}

impl HttpSandbox {
    pub fn new(base: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check(&self, resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Sandbox(format!(
            "{} failed: {} {}",
            what,
            status,
            body.trim()
        )))
    }
}

#[async_trait]
impl SandboxApi for HttpSandbox {
    async fn create(&self, template: &str, timeout: Duration) -> Result<String> {
        hlog_debug!("HttpSandbox::create template={}", template);
        let resp = self
            .http
            .post(self.url("/sandboxes"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "template": template,
                "timeoutMs": timeout.as_millis() as u64,
            }))
            .send()
            .await?;
        let resp = self.check(resp, "create").await?;
        let created: CreateResponse = resp.json().await?;
        Ok(created.sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .http
            .get(self.url(&format!("/sandboxes/{}", sandbox_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(resp, "connect").await?;
        Ok(())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        hlog_debug!("HttpSandbox::run_command sandbox={} cmd={}", sandbox_id, cmd);
        let mut body = json!({ "cmd": cmd });
        if let Some(t) = timeout {
            body["timeoutMs"] = json!(t.as_millis() as u64);
        }
        let resp = self
            .http
            .post(self.url(&format!("/sandboxes/{}/exec", sandbox_id)))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let resp = self.check(resp, "run_command").await?;
        Ok(resp.json().await?)
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let resp = self
            .http
            .put(self.url(&format!("/sandboxes/{}/files", sandbox_id)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .body(contents.to_vec())
            .send()
            .await?;
        self.check(resp, "write_file").await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let resp = self
            .http
            .get(self.url(&format!("/sandboxes/{}/files", sandbox_id)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = self.check(resp, "read_file").await?;
        let file: ReadFileResponse = resp.json().await?;
        Ok(file.content)
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        hlog_debug!("HttpSandbox::kill sandbox={}", sandbox_id);
        let resp = self
            .http
            .delete(self.url(&format!("/sandboxes/{}", sandbox_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(resp, "kill").await?;
        Ok(())
    }
}
