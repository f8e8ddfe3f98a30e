use serde::{Deserialize, Serialize};
use stash_core::codec::{transpose, wire};
use stash_core::Hash32;
use uuid::Uuid;

pub struct ApiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

// --- Server info ---

#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

// --- Repositories ---

#[derive(Debug, Serialize)]
struct CreateRepoRequest {
    name: String,
    storage_class: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub id: Uuid,
    pub name: String,
    pub chunk_store_id: Uuid,
    pub storage_class: String,
    pub created_at: String,
}

// --- Releases ---

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    pub id: String,
    pub repo_id: Uuid,
    pub version: String,
    pub created_at: String,
    pub definition_checksum: String,
}

// --- Ingest sessions ---

#[derive(Debug, Serialize)]
struct CreateSessionRequest {
    repo_id: Uuid,
    intended_release: String,
    client_agent: String,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: Uuid,
}

/// Transient failures retry with exponential backoff before giving up.
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: std::time::Duration = std::time::Duration::from_millis(500);

impl ApiClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send with retries on connection errors, timeouts, and 5xx
    /// responses. Only used for idempotent calls: missing-set queries
    /// are read-only and chunk re-uploads are server-side no-ops.
    async fn send_retrying(
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<reqwest::Response> {
        let mut delay = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            let this_try = request
                .try_clone()
                .ok_or_else(|| anyhow::anyhow!("request body is not retryable"))?;
            let transient = match this_try.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    format!("server error {}", resp.status())
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_connect() || err.is_timeout() => err.to_string(),
                Err(err) => return Err(err.into()),
            };
            if attempt == MAX_ATTEMPTS {
                anyhow::bail!("giving up after {MAX_ATTEMPTS} attempts: {transient}");
            }
            tracing::warn!(attempt, %transient, "transient API failure, retrying");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        unreachable!("loop either returns or bails")
    }

    /// Check response status; on error, read body for detail message.
    async fn ensure_ok(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body)
        }
    }

    pub async fn server_info(&self) -> anyhow::Result<ServerInfo> {
        let resp = Self::send_retrying(
            self.client.get(format!("{}/api/server/info", self.base_url)),
        )
        .await?;
        Ok(Self::ensure_ok(resp).await?.json().await?)
    }

    pub async fn create_repo(&self, name: &str, storage_class: &str) -> anyhow::Result<RepoInfo> {
        let resp = self
            .request(self.client.post(format!("{}/api/repos", self.base_url)))
            .json(&CreateRepoRequest {
                name: name.to_string(),
                storage_class: storage_class.to_string(),
            })
            .send()
            .await?;
        Ok(Self::ensure_ok(resp).await?.json().await?)
    }

    pub async fn list_repos(&self) -> anyhow::Result<Vec<RepoInfo>> {
        let resp = Self::send_retrying(
            self.request(self.client.get(format!("{}/api/repos", self.base_url))),
        )
        .await?;
        Ok(Self::ensure_ok(resp).await?.json().await?)
    }

    pub async fn list_releases(&self, repo_id: Uuid) -> anyhow::Result<Vec<ReleaseInfo>> {
        let resp = Self::send_retrying(self.request(
            self.client
                .get(format!("{}/api/repos/{}/releases", self.base_url, repo_id)),
        ))
        .await?;
        Ok(Self::ensure_ok(resp).await?.json().await?)
    }

    pub async fn create_session(
        &self,
        repo_id: Uuid,
        intended_release: &str,
    ) -> anyhow::Result<Uuid> {
        let resp = self
            .request(
                self.client
                    .post(format!("{}/api/ingest/sessions", self.base_url)),
            )
            .json(&CreateSessionRequest {
                repo_id,
                intended_release: intended_release.to_string(),
                client_agent: format!("stash/{}", env!("CARGO_PKG_VERSION")),
            })
            .send()
            .await?;
        let created: CreateSessionResponse = Self::ensure_ok(resp).await?.json().await?;
        Ok(created.session_id)
    }

    async fn missing_query(
        &self,
        session: Uuid,
        kind: &str,
        hashes: &[Hash32],
    ) -> anyhow::Result<Vec<Hash32>> {
        let body = transpose::encode_hashes(hashes)?;
        let resp = Self::send_retrying(
            self.request(self.client.post(format!(
                "{}/api/ingest/sessions/{}/{}/missing",
                self.base_url, session, kind
            )))
            .header("Content-Type", "application/octet-stream")
            .body(body),
        )
        .await?;
        let bytes = Self::ensure_ok(resp).await?.bytes().await?;
        Ok(transpose::decode_hashes(&bytes)?)
    }

    pub async fn missing_chunks(
        &self,
        session: Uuid,
        hashes: &[Hash32],
    ) -> anyhow::Result<Vec<Hash32>> {
        self.missing_query(session, "chunks", hashes).await
    }

    pub async fn missing_files(
        &self,
        session: Uuid,
        hashes: &[Hash32],
    ) -> anyhow::Result<Vec<Hash32>> {
        self.missing_query(session, "files", hashes).await
    }

    pub async fn upload_chunks(
        &self,
        session: Uuid,
        batch: &[(Hash32, Vec<u8>)],
    ) -> anyhow::Result<()> {
        let body = wire::encode_chunk_batch(batch)?;
        let resp = Self::send_retrying(
            self.request(self.client.post(format!(
                "{}/api/ingest/sessions/{}/chunks/batch",
                self.base_url, session
            )))
            .header("Content-Type", "application/octet-stream")
            .body(body),
        )
        .await?;
        Self::ensure_ok(resp).await?;
        Ok(())
    }

    pub async fn upload_file_definitions(
        &self,
        session: Uuid,
        defs: &[wire::FileDefinition],
    ) -> anyhow::Result<()> {
        let body = wire::encode_file_definitions(defs)?;
        let resp = Self::send_retrying(
            self.request(self.client.post(format!(
                "{}/api/ingest/sessions/{}/files/batch",
                self.base_url, session
            )))
            .header("Content-Type", "application/octet-stream")
            .body(body),
        )
        .await?;
        Self::ensure_ok(resp).await?;
        Ok(())
    }

    pub async fn finalize(
        &self,
        session: Uuid,
        repo_id: Uuid,
        definition: Vec<u8>,
    ) -> anyhow::Result<ReleaseInfo> {
        let form = reqwest::multipart::Form::new()
            .text("repo_id", repo_id.to_string())
            .part(
                "release_definition",
                reqwest::multipart::Part::bytes(definition)
                    .file_name("release.rdef")
                    .mime_str("application/octet-stream")?,
            );
        let resp = self
            .request(self.client.post(format!(
                "{}/api/ingest/sessions/{}/finalize",
                self.base_url, session
            )))
            .multipart(form)
            .send()
            .await?;
        Ok(Self::ensure_ok(resp).await?.json().await?)
    }

    pub async fn abort_session(&self, session: Uuid) -> anyhow::Result<()> {
        let resp = self
            .request(self.client.post(format!(
                "{}/api/ingest/sessions/{}/abort",
                self.base_url, session
            )))
            .send()
            .await?;
        Self::ensure_ok(resp).await?;
        Ok(())
    }

    pub async fn download_release(
        &self,
        release_id: &str,
        component: Option<&str>,
        diff: Option<&str>,
    ) -> anyhow::Result<Vec<u8>> {
        let mut req = self.request(self.client.get(format!(
            "{}/api/releases/{}/download",
            self.base_url, release_id
        )));
        if let Some(component) = component {
            req = req.query(&[("component", component)]);
        }
        if let Some(diff) = diff {
            req = req.query(&[("diff", diff)]);
        }
        let resp = Self::send_retrying(req).await?;
        Ok(Self::ensure_ok(resp).await?.bytes().await?.to_vec())
    }
}
