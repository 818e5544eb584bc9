use std::sync::Arc;

use futures_util::StreamExt;
use gfweb_core::{
    ApiError, ArchiveCommand, ArchiveMember, ArchiveRequest, GfwebClient, NdjsonDecoder,
    StreamRecord, parse_listing_line,
};
use reqwest::Response;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cancellable;
use super::progress::{ProgressMeter, ProgressSink, ProgressValue};
use crate::error::TransferError;
use crate::registry::ProgressEvent;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// Members reported by a `list` command; `None` for other commands.
    pub listing: Option<Vec<ArchiveMember>>,
}

/// Server-side copy and gfptar operations, both answered with an NDJSON
/// progress stream.
#[derive(Clone)]
pub struct StreamOps {
    client: GfwebClient,
}

impl StreamOps {
    pub fn new(client: GfwebClient) -> Self {
        Self { client }
    }

    pub async fn copy(
        &self,
        source: &str,
        destination: &str,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        let response = cancellable(cancel, self.client.post_copy(source, destination)).await?;
        let mut driver = StreamDriver::new(sink.as_ref(), false);
        driver.drive(response, cancel).await?;
        debug!(source = %source, destination = %destination, "copy finished");
        Ok(())
    }

    pub async fn archive(
        &self,
        request: &ArchiveRequest,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<ArchiveOutcome, TransferError> {
        let response = cancellable(cancel, self.client.post_archive(request)).await?;
        let listing = request.command == ArchiveCommand::List;
        let mut driver = StreamDriver::new(sink.as_ref(), listing);
        driver.drive(response, cancel).await?;
        debug!(command = request.command.as_str(), "archive command finished");
        Ok(ArchiveOutcome {
            listing: listing.then_some(driver.members),
        })
    }
}

struct StreamDriver<'a> {
    sink: &'a dyn ProgressSink,
    meter: ProgressMeter,
    listing: bool,
    members: Vec<ArchiveMember>,
}

enum Flow {
    Continue,
    Done,
}

impl<'a> StreamDriver<'a> {
    fn new(sink: &'a dyn ProgressSink, listing: bool) -> Self {
        Self {
            sink,
            meter: ProgressMeter::start(),
            listing,
            members: Vec::new(),
        }
    }

    /// Consumes the body until a `done` record or the end of the stream.
    async fn drive(
        &mut self,
        response: Response,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut decoder = NdjsonDecoder::new();
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
            let chunk = chunk.map_err(ApiError::from)?;
            for record in decoder.feed(&chunk) {
                if let Flow::Done = self.handle(record)? {
                    return Ok(());
                }
            }
        }
        for record in decoder.finish() {
            if let Flow::Done = self.handle(record)? {
                break;
            }
        }
        Ok(())
    }

    fn handle(&mut self, record: StreamRecord) -> Result<Flow, TransferError> {
        match record {
            StreamRecord::Warn(text) => {
                warn!(warning = %text, "server reported a warning");
                self.sink.emit(ProgressEvent::Message(text));
            }
            StreamRecord::Error(reason) => return Err(TransferError::Remote(reason)),
            StreamRecord::Progress { copied, total } => {
                self.sink.emit(self.meter.update(copied, total).into_event());
            }
            StreamRecord::Message(text) if self.listing => match parse_listing_line(&text) {
                Some(member) => self.members.push(member),
                None => warn!(line = %text, "skipping malformed listing line"),
            },
            StreamRecord::Message(text) => self.sink.emit(ProgressEvent::Progress {
                value: ProgressValue::Indeterminate,
                message: text,
            }),
            StreamRecord::Done => return Ok(Flow::Done),
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfweb_core::ArchiveMemberKind;
    use std::sync::Mutex;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recorder() -> (Arc<Mutex<Vec<ProgressEvent>>>, Arc<dyn ProgressSink>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: Arc<dyn ProgressSink> =
            Arc::new(move |event: ProgressEvent| sink_events.lock().unwrap().push(event));
        (events, sink)
    }

    fn list_request() -> ArchiveRequest {
        ArchiveRequest {
            command: ArchiveCommand::List,
            basedir: "/backup/set1".into(),
            source: Vec::new(),
            outdir: String::new(),
            options: Vec::new(),
        }
    }

    #[tokio::test]
    async fn copy_reports_progress_and_warnings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/copy"))
            .and(body_json(serde_json::json!({"source": "/a.bin", "destination": "/b.bin"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"copied\":50,\"total\":100}\n{\"warn\":\"slow disk\"}\n{\"copied\":100,\"total\":100}\n{\"done\":true}\n",
            ))
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (events, sink) = recorder();
        StreamOps::new(client)
            .copy("/a.bin", "/b.bin", &CancellationToken::new(), sink)
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            ProgressEvent::Progress {
                value: ProgressValue::Percent(50),
                ..
            }
        ));
        assert_eq!(events[1], ProgressEvent::Message("slow disk".into()));
        assert!(matches!(
            events[2],
            ProgressEvent::Progress {
                value: ProgressValue::Percent(100),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn error_record_fails_the_copy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/copy"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"copied\":10,\"total\":100}\n{\"error\":\"disk quota exceeded\"}\n",
            ))
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (_, sink) = recorder();
        let err = StreamOps::new(client)
            .copy("/a", "/b", &CancellationToken::new(), sink)
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "disk quota exceeded");
    }

    #[tokio::test]
    async fn list_collects_members_and_skips_odd_lines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gfptar"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"message\":\"D dir1\"}\n{\"message\":\"F dir1/a.txt\"}\n{\"message\":\"garbage\"}\n{\"message\":\"S link\"}\n",
            ))
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (events, sink) = recorder();
        let outcome = StreamOps::new(client)
            .archive(&list_request(), &CancellationToken::new(), sink)
            .await
            .unwrap();

        let listing = outcome.listing.unwrap();
        assert_eq!(listing.len(), 3);
        assert_eq!(listing[0].kind, ArchiveMemberKind::Directory);
        assert_eq!(listing[1].path, "dir1/a.txt");
        assert_eq!(listing[2].kind, ArchiveMemberKind::Symlink);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_messages_become_indeterminate_progress() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gfptar"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("{\"message\":\"adding a.txt\"}"),
            )
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (events, sink) = recorder();
        let request = ArchiveRequest {
            command: ArchiveCommand::Create,
            ..list_request()
        };
        let outcome = StreamOps::new(client)
            .archive(&request, &CancellationToken::new(), sink)
            .await
            .unwrap();

        assert_eq!(outcome.listing, None);
        assert_eq!(
            *events.lock().unwrap(),
            vec![ProgressEvent::Progress {
                value: ProgressValue::Indeterminate,
                message: "adding a.txt".into()
            }]
        );
    }

    #[tokio::test]
    async fn cancelled_before_response_is_not_an_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/copy"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_secs(5))
                    .set_body_string("{\"done\":true}\n"),
            )
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let (events, sink) = recorder();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = StreamOps::new(client)
            .copy("/a", "/b", &cancel, sink)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(events.lock().unwrap().is_empty());
    }
}
