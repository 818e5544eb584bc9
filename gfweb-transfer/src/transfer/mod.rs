pub mod download;
pub mod precondition;
pub mod progress;
pub mod stream_ops;
pub mod upload;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Races `fut` against `cancel`; cancellation wins ties and drops `fut`.
pub(crate) async fn cancellable<F, T, E>(cancel: &CancellationToken, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TransferError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}
