//! Gemini File API + `generateContent` over HTTP.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::remote::{Content, RemoteService, ResourceState, UploadedFile};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    request_timeout: Duration,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FileResponse {
    file: FileMeta,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FileMeta {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Serialize, Debug)]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Serialize, Debug)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text { text: &'a str },
    File { file_data: FileData<'a> },
}

#[derive(Serialize, Debug)]
struct FileData<'a> {
    mime_type: &'a str,
    file_uri: &'a str,
}

fn parse_state(state: Option<&str>) -> anyhow::Result<ResourceState> {
    match state {
        Some("PROCESSING") => Ok(ResourceState::Uploading),
        Some("ACTIVE") => Ok(ResourceState::Active),
        Some("FAILED") => Ok(ResourceState::Failed),
        other => anyhow::bail!("unexpected file state {other:?}"),
    }
}

/// Passes 2XX responses through; anything else becomes an error carrying the
/// status and whatever body came back.
async fn ok_or_body(res: Response, what: &'static str) -> anyhow::Result<Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let code = res.status();
    let body = res
        .text()
        .await
        .unwrap_or_else(|_| String::from("<failed to read>"));
    Err(anyhow::anyhow!(body))
        .with_context(|| format!("HTTP status: {code}"))
        .context(what)
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RemoteService for GeminiClient {
    async fn upload(&self, path: &Path, mime_type: &str) -> anyhow::Result<UploadedFile> {
        let len = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat '{}'", path.display()))?
            .len();
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment".to_string());

        let res = self
            .client
            .post(self.url("upload/v1beta/files"))
            .query(&[("key", &self.api_key)])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", len)
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .timeout(self.request_timeout)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .context("issue upload start request")?;
        let res = ok_or_body(res, "start upload").await?;
        let upload_url = res
            .headers()
            .get("x-goog-upload-url")
            .context("no upload url in response")?
            .to_str()
            .context("non-ascii upload url")?
            .to_string();

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open '{}'", path.display()))?;
        let res = self
            .client
            .post(upload_url)
            .header("Content-Length", len)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(reqwest::Body::wrap_stream(FramedRead::new(
                file,
                BytesCodec::new(),
            )))
            .send()
            .await
            .context("issue upload request")?;
        let res = ok_or_body(res, "upload file bytes").await?;
        let res: FileResponse = res.json().await.context("parse upload json")?;

        Ok(UploadedFile {
            mime_type: res.file.mime_type.unwrap_or_else(|| mime_type.to_string()),
            name: res.file.name,
            uri: res.file.uri,
        })
    }

    async fn get_state(&self, name: &str) -> anyhow::Result<ResourceState> {
        let res = self
            .client
            .get(self.url(&format!("v1beta/{name}")))
            .query(&[("key", &self.api_key)])
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("issue state request for {name}"))?;
        let res = ok_or_body(res, "get file state").await?;
        let file: FileMeta = res.json().await.context("parse file json")?;
        parse_state(file.state.as_deref())
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let res = self
            .client
            .delete(self.url(&format!("v1beta/{name}")))
            .query(&[("key", &self.api_key)])
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("issue delete request for {name}"))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ok_or_body(res, "delete file").await?;
        Ok(())
    }

    async fn generate(
        &self,
        model: &str,
        contents: &[Content],
    ) -> anyhow::Result<serde_json::Value> {
        let parts = contents
            .iter()
            .map(|c| match c {
                Content::Text(text) => RequestPart::Text {
                    text: text.as_str(),
                },
                Content::File { uri, mime_type } => RequestPart::File {
                    file_data: FileData {
                        mime_type: mime_type.as_str(),
                        file_uri: uri.as_str(),
                    },
                },
            })
            .collect();
        let body = GenerateRequest {
            contents: [RequestContent {
                role: "user",
                parts,
            }],
        };
        let res = self
            .client
            .post(self.url(&format!("v1beta/models/{model}:generateContent")))
            .query(&[("key", &self.api_key)])
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .context("issue generate request")?;
        let res = ok_or_body(res, "generate content").await?;
        res.json().await.context("parse generate json")
    }
}
