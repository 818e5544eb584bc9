use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, InvalidHeaderValue};
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

const TIMESTAMP_HEADER: &str = "X-File-Timestamp";

/// Characters left literal in a path segment; `/` stays a separator.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'/');

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        detail: Option<String>,
        body: String,
    },
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// True when the exchange never produced an HTTP status.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Request(err) if err.status().is_none())
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Request(err) => err.status(),
            _ => None,
        }
    }

    /// Text suitable for a task card.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Api {
                detail: Some(detail),
                ..
            } => detail.clone(),
            ApiError::Api { status, .. } => format!("server returned {status}"),
            ApiError::Request(err) => match err.status() {
                Some(status) => format!("server returned {status}"),
                None => "network error".to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// Percent-encodes every segment of a remote path, keeping `/` literal.
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path.trim_start_matches('/'), PATH_SEGMENT).to_string()
}

#[derive(Clone)]
pub struct GfwebClient {
    http: Client,
    base_url: Url,
}

impl GfwebClient {
    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Self::with_session(base_url, None)
    }

    /// Builds a client that keeps cookies between requests and optionally
    /// starts from an existing session cookie.
    pub fn with_session(base_url: &str, session_cookie: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = session_cookie {
            headers.insert(COOKIE, HeaderValue::from_str(cookie)?);
        }
        let http = Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
        })
    }

    /// `PUT /dir/{path}`. An already existing directory is not an error.
    pub async fn create_dir(&self, path: &str, parents: bool) -> Result<(), ApiError> {
        let mut url = self.route("/dir/", path)?;
        if parents {
            url.query_pairs_mut().append_pair("p", "on");
        }
        let response = self.http.put(url).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::check_status(response).await?;
        Ok(())
    }

    /// Effective permission string (`"rwx"`) of `dir` for the session user.
    pub async fn effective_perms(&self, dir: &str) -> Result<Option<String>, ApiError> {
        let mut url = self.route("/dir/", dir)?;
        url.query_pairs_mut()
            .append_pair("show_hidden", "on")
            .append_pair("effperm", "on");
        let response = self.http.get(url).send().await?;
        let entries: Vec<PermEntry> = Self::handle_response(response).await?;
        Ok(entries.into_iter().next().map(|entry| entry.perms))
    }

    pub async fn list_dir(&self, dir: &str) -> Result<Vec<DirEntry>, ApiError> {
        let mut url = self.route("/dir/", dir)?;
        url.query_pairs_mut()
            .append_pair("show_hidden", "on")
            .append_pair("long", "on");
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    /// `PUT /file/{path}` with a streamed body.
    pub async fn put_file(
        &self,
        path: &str,
        body: impl Into<Body>,
        meta: &UploadMeta,
    ) -> Result<(), ApiError> {
        let url = self.route("/file/", path)?;
        let mut request = self
            .http
            .put(url)
            .header(
                CONTENT_TYPE,
                meta.content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .body(body);
        if let Some(size) = meta.size {
            request = request.header(CONTENT_LENGTH, size);
        }
        if let Some(mtime) = meta.mtime {
            request = request.header(TIMESTAMP_HEADER, mtime.to_string());
        }
        let response = request.send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// `GET /file/{path}?action=download`; the body is left unread.
    pub async fn get_file(&self, path: &str) -> Result<Response, ApiError> {
        let mut url = self.route("/file/", path)?;
        url.query_pairs_mut().append_pair("action", "download");
        let response = self.http.get(url).send().await?;
        Self::check_status(response).await
    }

    /// Asks the server to assemble `files` into one archive.
    pub async fn post_zip(&self, files: &[String], streaming: bool) -> Result<Response, ApiError> {
        let route = if streaming {
            "/download/zip_w_stream"
        } else {
            "/download/zip"
        };
        let response = self
            .http
            .post(self.endpoint(route)?)
            .json(&json!({ "files": files }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Plain `GET` of an absolute URL or a route under the API base.
    pub async fn fetch(&self, location: &str) -> Result<Response, ApiError> {
        let url = match Url::parse(location) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.endpoint(&format!("/{}", location.trim_start_matches('/')))?
            }
            Err(err) => return Err(err.into()),
        };
        let response = self.http.get(url).send().await?;
        Self::check_status(response).await
    }

    pub async fn post_copy(&self, source: &str, destination: &str) -> Result<Response, ApiError> {
        let response = self
            .http
            .post(self.endpoint("/copy")?)
            .json(&json!({ "source": source, "destination": destination }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    pub async fn post_archive(&self, request: &ArchiveRequest) -> Result<Response, ApiError> {
        let response = self
            .http
            .post(self.endpoint("/gfptar")?)
            .json(request)
            .send()
            .await?;
        Self::check_status(response).await
    }

    fn route(&self, prefix: &str, path: &str) -> Result<Url, ApiError> {
        self.endpoint(&format!("{prefix}{}", encode_path(path)))
    }

    fn endpoint(&self, route: &str) -> Result<Url, ApiError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{route}"))?)
    }

    async fn check_status(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Api {
            status,
            detail: extract_detail(&body),
            body,
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, ApiError> {
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn extract_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(detail) => Some(detail.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub size: Option<u64>,
    /// Modification time in epoch seconds.
    pub mtime: Option<i64>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: i64,
}

#[derive(Debug, Deserialize)]
struct PermEntry {
    perms: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveCommand {
    Create,
    Extract,
    List,
}

impl ArchiveCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveCommand::Create => "create",
            ArchiveCommand::Extract => "extract",
            ArchiveCommand::List => "list",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub command: ArchiveCommand,
    pub basedir: String,
    pub source: Vec<String>,
    pub outdir: String,
    #[serde(default)]
    pub options: Vec<String>,
}
