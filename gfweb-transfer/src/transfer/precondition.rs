use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use gfweb_core::GfwebClient;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::TransferError;

const PERMISSION_DENIED: &str = "permission denied";

/// `None` means the check passed, `Some(reason)` holds the failure.
type Outcome = Option<String>;
type OutcomeMap = Mutex<HashMap<String, Arc<OnceCell<Outcome>>>>;

/// Per-batch memo of directory creation and write-permission checks.
///
/// Each directory hits the network at most once per cache, also when
/// several uploads ask for it concurrently: later callers wait for the
/// first one's outcome.
#[derive(Default)]
pub struct DirPreconditionCache {
    created: OutcomeMap,
    permissions: OutcomeMap,
}

impl DirPreconditionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `dir` as existing without asking the server.
    pub fn mark_created(&self, dir: &str) {
        let cell = cell_for(&self.created, dir);
        let _ = cell.set(None);
    }

    pub fn is_created(&self, dir: &str) -> bool {
        lock(&self.created)
            .get(dir)
            .and_then(|cell| cell.get().cloned())
            .is_some_and(|outcome| outcome.is_none())
    }

    pub async fn ensure_dir(&self, client: &GfwebClient, dir: &str) -> Result<(), TransferError> {
        let cell = cell_for(&self.created, dir);
        let outcome = cell
            .get_or_init(|| async {
                debug!(dir = %dir, "creating destination directory");
                match client.create_dir(dir, true).await {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(dir = %dir, error = %err, "directory creation failed");
                        Some(err.user_message())
                    }
                }
            })
            .await;
        match outcome {
            None => Ok(()),
            Some(reason) => Err(TransferError::DirCreate {
                dir: dir.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// The cached permission error for `dir`, querying the server once.
    pub async fn permission_error(&self, client: &GfwebClient, dir: &str) -> Option<String> {
        let cell = cell_for(&self.permissions, dir);
        cell.get_or_init(|| async {
            match client.effective_perms(dir).await {
                Ok(Some(perms)) if perms.contains('w') => None,
                Ok(perms) => {
                    debug!(dir = %dir, perms = ?perms, "no write permission");
                    Some(PERMISSION_DENIED.to_string())
                }
                Err(err) => {
                    warn!(dir = %dir, error = %err, "permission check failed");
                    Some(err.user_message())
                }
            }
        })
        .await
        .clone()
    }

    pub async fn check_permission(
        &self,
        client: &GfwebClient,
        dir: &str,
    ) -> Result<(), TransferError> {
        match self.permission_error(client, dir).await {
            None => Ok(()),
            Some(reason) => Err(TransferError::Permission {
                dir: dir.to_string(),
                reason,
            }),
        }
    }
}

fn lock(map: &OutcomeMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OnceCell<Outcome>>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cell_for(map: &OutcomeMap, dir: &str) -> Arc<OnceCell<Outcome>> {
    lock(map).entry(dir.to_string()).or_default().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn concurrent_callers_share_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/dir/new"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let cache = DirPreconditionCache::new();
        let (a, b, c) = tokio::join!(
            cache.ensure_dir(&client, "/new"),
            cache.ensure_dir(&client, "/new"),
            cache.ensure_dir(&client, "/new"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert!(cache.is_created("/new"));
    }

    #[tokio::test]
    async fn failed_creation_is_remembered() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/dir/ro"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "detail": "read-only file system"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let cache = DirPreconditionCache::new();
        for _ in 0..2 {
            let err = cache.ensure_dir(&client, "/ro").await.unwrap_err();
            assert_eq!(
                err.user_message(),
                "cannot create directory /ro: read-only file system"
            );
        }
        assert!(!cache.is_created("/ro"));
    }

    #[tokio::test]
    async fn permission_and_creation_are_cached_separately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dir/d"))
            .and(query_param("effperm", "on"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "perms": "r-x" }])))
            .expect(1)
            .mount(&server)
            .await;

        let client = GfwebClient::with_base_url(&server.uri()).unwrap();
        let cache = DirPreconditionCache::new();
        cache.mark_created("/d");
        assert!(cache.ensure_dir(&client, "/d").await.is_ok());

        for _ in 0..2 {
            let err = cache.check_permission(&client, "/d").await.unwrap_err();
            assert_eq!(err.user_message(), "/d: permission denied");
        }
    }
}
