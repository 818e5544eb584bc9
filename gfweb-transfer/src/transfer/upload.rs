use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use gfweb_core::{GfwebClient, UploadMeta};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cancellable;
use super::precondition::DirPreconditionCache;
use super::progress::{ProgressMeter, ProgressSink, ProgressValue};
use crate::error::TransferError;
use crate::item::{EntryKind, TransferItem};
use crate::registry::ProgressEvent;

#[derive(Clone)]
pub struct Uploader {
    client: GfwebClient,
}

impl Uploader {
    pub fn new(client: GfwebClient) -> Self {
        Self { client }
    }

    /// Sends one item to `item.dest_path`.
    ///
    /// The destination directory is created and its write permission
    /// checked first, both through `cache`; a failure there ends the upload
    /// before any bytes are sent. Directory items stop after creation.
    pub async fn upload(
        &self,
        item: &TransferItem,
        cache: &DirPreconditionCache,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if item.kind == EntryKind::Dir {
            sink.emit(ProgressEvent::Progress {
                value: ProgressValue::Indeterminate,
                message: "creating directory".to_string(),
            });
            cancellable(cancel, cache.ensure_dir(&self.client, &item.dest_path)).await?;
            return Ok(());
        }

        cancellable(cancel, cache.ensure_dir(&self.client, &item.upload_dir)).await?;
        cancellable(cancel, cache.check_permission(&self.client, &item.upload_dir)).await?;

        let source = item
            .source
            .as_ref()
            .ok_or_else(|| TransferError::MissingSource(item.path.clone()))?;
        let file = tokio::fs::File::open(source).await?;
        let total = item.size;
        let meter = ProgressMeter::start();
        let loaded = Arc::new(AtomicU64::new(0));
        let body_sink = Arc::clone(&sink);
        let body_cancel = cancel.clone();
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                let now = loaded.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
                if !body_cancel.is_cancelled() {
                    body_sink.emit(meter.update(now, Some(total)).into_event());
                }
            }
        });
        let meta = UploadMeta {
            size: Some(total),
            mtime: Some(item.mtime),
            content_type: item.content_type.clone(),
        };

        debug!(path = %item.dest_path, size = total, "uploading");
        cancellable(
            cancel,
            self.client
                .put_file(&item.dest_path, reqwest::Body::wrap_stream(stream), &meta),
        )
        .await?;

        sink.emit(ProgressEvent::Progress {
            value: ProgressValue::Percent(100),
            message: String::new(),
        });
        Ok(())
    }
}
