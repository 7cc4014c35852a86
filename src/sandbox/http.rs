//! REST client for a hosted sandbox API.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Operation      | Request                                   |
//! |----------------|-------------------------------------------|
//! | create         | `POST /sandboxes`                         |
//! | write_file     | `POST /sandboxes/{id}/files`              |
//! | read_file      | `GET /sandboxes/{id}/files?path=`         |
//! | list_files     | `GET /sandboxes/{id}/files/list`          |
//! | make_directory | `POST /sandboxes/{id}/directories`        |
//! | run_command    | `POST /sandboxes/{id}/commands`           |
//! | stop_command   | `DELETE /sandboxes/{id}/commands/{cmd}`   |
//! | kill           | `DELETE /sandboxes/{id}`                  |

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::provider::{
    CommandHandle, CommandSpec, ProviderError, ProvisionConfig, ProvisionedSandbox,
    SandboxProvider, is_excluded,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    template: &'a str,
    port: u16,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct DirectoryRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    id: String,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    output: String,
}

pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        check_status(response).await
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Network(format!("invalid response body: {e}")))
    }
}

/// Map a non-success status onto a [`ProviderError`] kind.
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized(body),
        StatusCode::FORBIDDEN => ProviderError::PermissionDenied(body),
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::QuotaExceeded(body)
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(body),
        _ => ProviderError::Rejected {
            status: status.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(&self, config: &ProvisionConfig) -> Result<ProvisionedSandbox, ProviderError> {
        let body = CreateRequest {
            template: &config.template,
            port: config.port,
            timeout_ms: config.lifetime.as_millis() as u64,
        };
        let created: CreateResponse = self
            .json(self.client.post(self.url("/sandboxes")).json(&body))
            .await?;
        Ok(ProvisionedSandbox {
            id: created.id,
            host_url: created.url,
        })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}/files"));
        self.send(self.client.post(url).json(&WriteRequest { path, content }))
            .await?;
        Ok(())
    }

    async fn make_directory(&self, sandbox_id: &str, path: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}/directories"));
        self.send(self.client.post(url).json(&DirectoryRequest { path }))
            .await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}/files"));
        let read: ReadResponse = self
            .json(self.client.get(url).query(&[("path", path)]))
            .await?;
        Ok(read.content)
    }

    async fn list_files(&self, sandbox_id: &str) -> Result<Vec<String>, ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}/files/list"));
        let listed: ListResponse = self.json(self.client.get(url)).await?;
        Ok(listed
            .files
            .into_iter()
            .map(|p| p.trim_start_matches('/').to_string())
            .filter(|p| !p.is_empty() && !is_excluded(p))
            .collect())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        spec: &CommandSpec,
    ) -> Result<CommandHandle, ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}/commands"));
        let ran: CommandResponse = self.json(self.client.post(url).json(spec)).await?;
        Ok(CommandHandle {
            id: ran.id,
            exit_code: ran.exit_code,
            output: ran.output,
        })
    }

    async fn stop_command(&self, sandbox_id: &str, command_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}/commands/{command_id}"));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("/sandboxes/{sandbox_id}"));
        match self.send(self.client.delete(url)).await {
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
