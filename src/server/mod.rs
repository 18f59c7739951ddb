//! HTTP API over the pipeline.
//!
//! Exposes health, queue statistics, worker state, document submission and
//! dead-letter management.

mod handlers;
mod routes;

pub use routes::create_router;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerSettings;
use crate::pipeline::Pipeline;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Whether `DELETE /api/queues` is enabled.
    pub allow_destructive: bool,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, settings: &ServerSettings) -> Self {
        Self {
            pipeline,
            allow_destructive: settings.allow_destructive,
        }
    }
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(state: AppState, settings: &ServerSettings, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::{QueueBackend, Settings};
    use crate::models::{DocumentMetadata, Priority, ProcessingOptions, QueueMessage, Stage};
    use crate::queue::{InMemoryQueueStore, QueueStore};
    use crate::services::{Collaborators, InMemoryCollaborators};

    struct TestApp {
        app: axum::Router,
        store: InMemoryQueueStore,
        pipeline: Arc<Pipeline>,
    }

    fn setup_test_app(allow_destructive: bool) -> TestApp {
        let mut settings = Settings::default();
        settings.queue.backend = QueueBackend::Memory;
        settings.server.allow_destructive = allow_destructive;
        settings.workers.poll_interval_ms = 50;

        let store = InMemoryQueueStore::new();
        let collab = Collaborators::from_backend(Arc::new(InMemoryCollaborators::new()));
        let pipeline = Arc::new(settings.assemble(Arc::new(store.clone()), collab));

        let app = create_router(AppState::new(pipeline.clone(), &settings.server));
        TestApp {
            app,
            store,
            pipeline,
        }
    }

    async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn dead_lettered(store: &InMemoryQueueStore, can_retry: bool) -> String {
        let metadata = DocumentMetadata::new("user-1", "receipts/doc-9.pdf", 512, "image/png");
        let msg = QueueMessage::new("doc-9", metadata, Priority::Low, ProcessingOptions::default());
        store.enqueue(&msg).await.unwrap();
        let leased = store.dequeue(Stage::DocumentValidation).await.unwrap().unwrap();
        store
            .move_to_dead_letter(&leased, "retries exhausted", can_retry)
            .await
            .unwrap()
            .id()
            .to_string()
    }

    #[tokio::test]
    async fn test_health_unavailable_until_started() {
        let t = setup_test_app(false);

        let (status, json) = send(&t.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["running"], false);

        t.pipeline.start().await.unwrap();
        let (status, json) = send(&t.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], true);

        let (status, json) = send(&t.app, "GET", "/api/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 10);

        t.pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_document_queues_first_stage() {
        let t = setup_test_app(false);

        let body = serde_json::json!({
            "metadata": {
                "user_id": "user-1",
                "storage_key": "receipts/doc-1.pdf",
                "file_size": 4096,
                "content_type": "application/pdf"
            },
            "priority": "high"
        });
        let (status, json) = send(&t.app, "POST", "/api/documents/doc-1/process", Some(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["stage"], "document_validation");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["position"], 1);

        let (status, json) = send(&t.app, "GET", "/api/queues/stats?stage=document_validation", None).await;
        assert_eq!(status, StatusCode::OK);
        let stages = json["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0]["stage"], "document_validation");
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let t = setup_test_app(false);

        let (status, json) = send(&t.app, "GET", "/api/queues/stats?stage=shipping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("shipping"));

        let body = serde_json::json!({
            "metadata": {
                "user_id": "user-1",
                "storage_key": "k",
                "file_size": 1,
                "content_type": "image/png"
            },
            "priority": "urgent"
        });
        let (status, _) = send(&t.app, "POST", "/api/documents/doc-1/process", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dead_letter_listing_and_retry() {
        let t = setup_test_app(false);
        let id = dead_lettered(&t.store, true).await;

        let (status, json) = send(&t.app, "GET", "/api/dead-letters?limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["reason"], "retries exhausted");

        let uri = format!("/api/dead-letters/{}/retry", id);
        let (status, json) = send(&t.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_ne!(json["message_id"], id.as_str());

        let (status, _) = send(&t.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hopeless_dead_letter_conflicts() {
        let t = setup_test_app(false);
        let id = dead_lettered(&t.store, false).await;

        let uri = format!("/api/dead-letters/{}/retry", id);
        let (status, _) = send(&t.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_clear_queues_requires_opt_in() {
        let t = setup_test_app(false);
        let (status, _) = send(&t.app, "DELETE", "/api/queues", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let t = setup_test_app(true);
        dead_lettered(&t.store, true).await;
        let (status, json) = send(&t.app, "DELETE", "/api/queues", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["deleted"].as_u64().unwrap() >= 1);

        let stats = t.store.stats(None).await.unwrap();
        assert_eq!(stats.dead_letter_count, 0);
    }
}
