use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use gfweb_core::{GfwebClient, LineBuffer, ZipEvent, parse_sse_line};
use reqwest::Response;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cancellable;
use super::progress::{ProgressMeter, ProgressSink, ProgressValue};
use crate::error::TransferError;
use crate::paths::{file_name, local_target_for};
use crate::registry::ProgressEvent;

const DEFAULT_ARCHIVE_NAME: &str = "download.zip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct Downloader {
    client: GfwebClient,
    zip_streaming: bool,
}

impl Downloader {
    pub fn new(client: GfwebClient, zip_streaming: bool) -> Self {
        Self {
            client,
            zip_streaming,
        }
    }

    /// Streams one remote file into `target_dir`.
    pub async fn download_file(
        &self,
        remote: &str,
        target_dir: &Path,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<DownloadOutcome, TransferError> {
        let response = cancellable(cancel, self.client.get_file(remote)).await?;
        save_response(response, target_dir, &file_name(remote), cancel, sink.as_ref()).await
    }

    /// Has the server pack `remotes` into one archive and saves it.
    pub async fn download_zip(
        &self,
        remotes: &[String],
        target_dir: &Path,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<DownloadOutcome, TransferError> {
        let response =
            cancellable(cancel, self.client.post_zip(remotes, self.zip_streaming)).await?;
        if !is_event_stream(&response) {
            return save_response(response, target_dir, DEFAULT_ARCHIVE_NAME, cancel, sink.as_ref())
                .await;
        }

        let location = await_zip_path(response, cancel, sink.as_ref()).await?;
        info!(location = %location, "archive ready");
        let response = cancellable(cancel, self.client.fetch(&location)).await?;
        let fallback = match file_name(&location) {
            name if name.is_empty() => DEFAULT_ARCHIVE_NAME.to_string(),
            name => name,
        };
        save_response(response, target_dir, &fallback, cancel, sink.as_ref()).await
    }
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

async fn await_zip_path(
    response: Response,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> Result<String, TransferError> {
    let mut lines = LineBuffer::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        for line in lines.push(&chunk.map_err(gfweb_core::ApiError::from)?) {
            if let Some(location) = handle_zip_line(&line, sink)? {
                return Ok(location);
            }
        }
    }
    if let Some(line) = lines.finish()
        && let Some(location) = handle_zip_line(&line, sink)?
    {
        return Ok(location);
    }
    Err(TransferError::Protocol(
        "archive stream ended without a zip path".to_string(),
    ))
}

fn handle_zip_line(line: &str, sink: &dyn ProgressSink) -> Result<Option<String>, TransferError> {
    match parse_sse_line(line) {
        Some(ZipEvent::Percent(percent)) => {
            sink.emit(ProgressEvent::Progress {
                value: ProgressValue::Percent(percent),
                message: format!("{percent}% | preparing archive"),
            });
            Ok(None)
        }
        Some(ZipEvent::Status(text)) => {
            sink.emit(ProgressEvent::Message(text));
            Ok(None)
        }
        Some(ZipEvent::Ready(location)) => Ok(Some(location)),
        Some(ZipEvent::Error(reason)) => Err(TransferError::Remote(reason)),
        None => Ok(None),
    }
}

async fn save_response(
    response: Response,
    target_dir: &Path,
    fallback_name: &str,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> Result<DownloadOutcome, TransferError> {
    let total = response.content_length();
    let name = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(content_disposition_filename)
        .unwrap_or_else(|| fallback_name.to_string());
    let target = local_target_for(target_dir, &name)
        .map_err(|err| TransferError::InvalidTarget(format!("{name}: {err}")))?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(&target);
    let result = write_body(response, &partial, total, cancel, sink).await;
    let bytes = match result {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
    };
    tokio::fs::rename(&partial, &target).await?;
    debug!(path = %target.display(), bytes, "download saved");
    Ok(DownloadOutcome {
        path: target,
        bytes,
    })
}

async fn write_body(
    response: Response,
    partial: &Path,
    total: Option<u64>,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let meter = ProgressMeter::start();
    let mut loaded = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.map_err(gfweb_core::ApiError::from)?;
        file.write_all(&chunk).await?;
        loaded += chunk.len() as u64;
        if !cancel.is_cancelled() {
            sink.emit(meter.update(loaded, total).into_event());
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(loaded)
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

/// Extracts the file name from a `Content-Disposition` value, preferring
/// the RFC 5987 `filename*` form. Directory parts are stripped.
pub fn content_disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.trim().trim_matches('"');
                let encoded = encoded
                    .split_once("''")
                    .map(|(_, rest)| rest)
                    .unwrap_or(encoded);
                extended = urlencoding::decode(encoded).ok().map(|s| s.into_owned());
            }
            "filename" => plain = Some(raw.trim().trim_matches('"').to_string()),
            _ => {}
        }
    }
    let name = extended.or(plain)?;
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recorder() -> (Arc<Mutex<Vec<ProgressEvent>>>, Arc<dyn ProgressSink>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: Arc<dyn ProgressSink> =
            Arc::new(move |event: ProgressEvent| sink_events.lock().unwrap().push(event));
        (events, sink)
    }

    #[test]
    fn parses_content_disposition_forms() {
        assert_eq!(
            content_disposition_filename(r#"attachment; filename="report.pdf""#).as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            content_disposition_filename(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''%E5%A0%B1%E5%91%8A.txt"
            )
            .as_deref(),
            Some("報告.txt")
        );
        assert_eq!(
            content_disposition_filename(r#"attachment; filename="../../etc/passwd""#).as_deref(),
            Some("passwd")
        );
        assert_eq!(content_disposition_filename("inline"), None);
        assert_eq!(content_disposition_filename(r#"attachment; filename="..""#), None);
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/d/a.txt")),
            PathBuf::from("/d/a.txt.partial")
        );
        assert_eq!(partial_path(Path::new("/d/a")), PathBuf::from("/d/a.partial"));
    }

    #[tokio::test]
    async fn single_file_uses_content_disposition_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/docs/a.txt"))
            .and(query_param("action", "download"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"b.txt\"")
                    .set_body_bytes(b"hello"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (events, sink) = recorder();
        let outcome = Downloader::new(client, true)
            .download_file("/docs/a.txt", dir.path(), &CancellationToken::new(), sink)
            .await
            .unwrap();

        assert_eq!(outcome.path, dir.path().join("b.txt"));
        assert_eq!(outcome.bytes, 5);
        assert_eq!(std::fs::read(&outcome.path).unwrap(), b"hello");
        assert!(!dir.path().join("b.txt.partial").exists());
        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Progress {
                value: ProgressValue::Percent(100),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn streaming_zip_waits_for_path_then_downloads() {
        let server = MockServer::start().await;
        let sse = format!(
            "data: {{\"progress\": 30}}\n\ndata: {{\"progress\": \"compressing\"}}\n\ndata: {{\"zipPath\": \"{}/tmp/out.zip\"}}\n\n",
            server.uri()
        );
        Mock::given(method("POST"))
            .and(path("/download/zip_w_stream"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tmp/out.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (events, sink) = recorder();
        let outcome = Downloader::new(client, true)
            .download_zip(
                &["/a".to_string(), "/b".to_string()],
                dir.path(),
                &CancellationToken::new(),
                sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome.path, dir.path().join("out.zip"));
        assert_eq!(std::fs::read(&outcome.path).unwrap(), b"PK\x03\x04");
        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            ProgressEvent::Progress {
                value: ProgressValue::Percent(30),
                message: "30% | preparing archive".into()
            }
        );
        assert_eq!(events[1], ProgressEvent::Message("compressing".into()));
    }

    #[tokio::test]
    async fn direct_zip_response_is_the_archive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/download/zip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/zip")
                    .insert_header("content-disposition", "attachment; filename=\"files.zip\"")
                    .set_body_bytes(b"PK"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (_, sink) = recorder();
        let outcome = Downloader::new(client, false)
            .download_zip(&["/a".to_string()], dir.path(), &CancellationToken::new(), sink)
            .await
            .unwrap();

        assert_eq!(outcome.path, dir.path().join("files.zip"));
    }

    #[tokio::test]
    async fn zip_stream_error_fails_download() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/download/zip_w_stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {\"error\": \"no such file\"}\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (_, sink) = recorder();
        let err = Downloader::new(client, true)
            .download_zip(&["/gone".to_string()], dir.path(), &CancellationToken::new(), sink)
            .await
            .unwrap_err();

        assert_eq!(err.user_message(), "no such file");
    }
}
