//! JSON-over-HTTP collaborators.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET    /documents/{id}`
//! - `PATCH  /documents/{id}/status`
//! - `PUT    /documents/{id}/extracted-data`
//! - `PUT    /documents/{id}/comparison`
//! - `PUT    /documents/{id}/authenticity`
//! - `GET    /blobs/info?key=...`
//! - `POST   /processing-logs`
//! - `POST   /ocr/extract`
//! - `POST   /verification/authenticity`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    AuthenticityVerifier, BlobStorage, CollaboratorError, CollaboratorResult, DocumentStore,
    OcrEngine, ProcessingLogSink,
};
use crate::models::{
    AuthenticityReport, BlobInfo, ComparisonResult, DocumentRecord, DocumentStatus,
    ExtractedData, ProcessingLogEntry,
};

/// Client for the document service.
#[derive(Clone)]
pub struct HttpCollaborators {
    base_url: String,
    api_token: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    document_id: &'a str,
    storage_key: &'a str,
    language_hints: &'a [String],
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    document_id: &'a str,
    storage_key: &'a str,
    extracted: &'a ExtractedData,
}

impl HttpCollaborators {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> CollaboratorResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Setup(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> CollaboratorResult<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, body))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> CollaboratorResult<T> {
        response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
    }

    async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> CollaboratorResult<()> {
        self.send(self.client.put(self.url(path)).json(body)).await?;
        Ok(())
    }
}

/// Build `/documents/{id}{suffix}` with `id` as a single escaped segment.
fn document_path(id: &str, suffix: &str) -> CollaboratorResult<String> {
    if id.is_empty() || id == "." || id == ".." {
        return Err(CollaboratorError::Rejected(format!(
            "invalid document id '{}'",
            id
        )));
    }
    Ok(format!("/documents/{}{}", urlencoding::encode(id), suffix))
}

/// Map a non-success status to an error.
fn classify(status: StatusCode, body: String) -> CollaboratorError {
    let detail = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };

    if status == StatusCode::NOT_FOUND {
        CollaboratorError::NotFound(detail)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        CollaboratorError::Unavailable(detail)
    } else {
        CollaboratorError::Rejected(detail)
    }
}

#[async_trait]
impl DocumentStore for HttpCollaborators {
    async fn get_by_id(&self, id: &str) -> CollaboratorResult<Option<DocumentRecord>> {
        let request = self.client.get(self.url(&document_path(id, "")?));
        match self.send(request).await {
            Ok(response) => Self::json(response).await.map(Some),
            Err(CollaboratorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> CollaboratorResult<()> {
        debug!(document_id = id, status = status.as_str(), "Updating document status");
        let body = StatusUpdate {
            status: status.as_str(),
            processing_started_at: started_at,
            processing_completed_at: completed_at,
        };
        let request = self
            .client
            .patch(self.url(&document_path(id, "/status")?))
            .json(&body);
        self.send(request).await?;
        Ok(())
    }

    async fn update_extracted_data(
        &self,
        id: &str,
        data: &ExtractedData,
    ) -> CollaboratorResult<()> {
        self.put_json(&document_path(id, "/extracted-data")?, data)
            .await
    }

    async fn update_comparison_results(
        &self,
        id: &str,
        results: &ComparisonResult,
    ) -> CollaboratorResult<()> {
        self.put_json(&document_path(id, "/comparison")?, results)
            .await
    }

    async fn update_authenticity(
        &self,
        id: &str,
        report: &AuthenticityReport,
    ) -> CollaboratorResult<()> {
        self.put_json(&document_path(id, "/authenticity")?, report)
            .await
    }
}

#[async_trait]
impl BlobStorage for HttpCollaborators {
    async fn document_info(&self, key: &str) -> CollaboratorResult<BlobInfo> {
        let request = self
            .client
            .get(self.url("/blobs/info"))
            .query(&[("key", key)]);
        match self.send(request).await {
            Ok(response) => Self::json(response).await,
            Err(CollaboratorError::NotFound(_)) => Ok(BlobInfo::missing()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProcessingLogSink for HttpCollaborators {
    async fn create(&self, entry: &ProcessingLogEntry) -> CollaboratorResult<()> {
        let request = self.client.post(self.url("/processing-logs")).json(entry);
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl OcrEngine for HttpCollaborators {
    async fn extract(
        &self,
        document: &DocumentRecord,
        language_hints: &[String],
    ) -> CollaboratorResult<ExtractedData> {
        let body = OcrRequest {
            document_id: &document.id,
            storage_key: &document.storage_key,
            language_hints,
        };
        let response = self
            .send(self.client.post(self.url("/ocr/extract")).json(&body))
            .await?;
        Self::json(response).await
    }
}

#[async_trait]
impl AuthenticityVerifier for HttpCollaborators {
    async fn verify(
        &self,
        document: &DocumentRecord,
        extracted: &ExtractedData,
    ) -> CollaboratorResult<AuthenticityReport> {
        let body = VerifyRequest {
            document_id: &document.id,
            storage_key: &document.storage_key,
            extracted,
        };
        let response = self
            .send(
                self.client
                    .post(self.url("/verification/authenticity"))
                    .json(&body),
            )
            .await?;
        Self::json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::patch;
    use std::sync::{Arc, Mutex};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn get_document(Path(id): Path<String>) -> Result<Json<DocumentRecord>, AxumStatus> {
        if id != "doc-1" {
            return Err(AxumStatus::NOT_FOUND);
        }
        Ok(Json(DocumentRecord {
            id,
            user_id: "u-1".into(),
            storage_key: "receipts/doc-1.pdf".into(),
            status: DocumentStatus::Queued,
            processing_started_at: None,
            processing_completed_at: None,
            extracted_data: None,
        }))
    }

    async fn spawn_service() -> String {
        let app = Router::new()
            .route("/documents/:id", get(get_document))
            .route(
                "/blobs/info",
                get(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
            )
            .route(
                "/ocr/extract",
                post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "unreadable image") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base: &str) -> HttpCollaborators {
        HttpCollaborators::new(base, Some("secret".into()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_document_lookup() {
        let base = spawn_service().await;
        let client = client(&base);

        let doc = client.get_by_id("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.storage_key, "receipts/doc-1.pdf");
        assert!(client.get_by_id("doc-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_document_id_stays_one_path_segment() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let app = Router::new()
            .route(
                "/documents/:id/status",
                patch(
                    |State(seen): State<Arc<Mutex<Vec<String>>>>, Path(id): Path<String>| async move {
                        seen.lock().unwrap().push(id);
                        AxumStatus::NO_CONTENT
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = client(&base);
        for id in ["attacker/../victim", "a b?c#d", "100%"] {
            client
                .update_status(id, DocumentStatus::Processing, None, None)
                .await
                .unwrap();
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["attacker/../victim", "a b?c#d", "100%"]
        );

        for id in ["", ".", ".."] {
            let err = client.get_by_id(id).await.unwrap_err();
            assert!(matches!(err, CollaboratorError::Rejected(_)));
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let base = spawn_service().await;
        let err = client(&base).document_info("k").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let base = spawn_service().await;
        let client = client(&base);
        let doc = client.get_by_id("doc-1").await.unwrap().unwrap();

        let err = client.extract(&doc, &[]).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(ref m) if m.contains("unreadable")));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let err = client("http://127.0.0.1:9").get_by_id("doc-1").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, String::new()),
            CollaboratorError::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, String::new()),
            CollaboratorError::Unavailable(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "bad".into()),
            CollaboratorError::Rejected(_)
        ));
    }
}
