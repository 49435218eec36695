//! Outbound webhook notifier for approval requests.
//!
//! POSTs the `approval.requested` payload to the configured URL, signing the
//! body with HMAC-SHA256 when a secret is set. Every attempt (success or
//! failure) is appended to the delivery log through the approval repository;
//! a failed log write is reported and does not stop the retries.

use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stepflow_core::repository::approval::ApprovalRepository;
use stepflow_core::workflow::notifier::{ApprovalNotifier, NotifierError};
use stepflow_core::workflow::retry::exponential_backoff;
use stepflow_types::approval::{ApprovalRequested, DeliveryRecord, DeliveryStatus};
use stepflow_types::config::NotifierConfig;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Response bodies longer than this are truncated in the delivery log.
const MAX_LOGGED_BODY: usize = 4 * 1024;

pub const EVENT_HEADER: &str = "X-Stepflow-Event";
pub const DELIVERY_HEADER: &str = "X-Stepflow-Delivery";
pub const TIMESTAMP_HEADER: &str = "X-Stepflow-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Stepflow-Signature";

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String, NotifierError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| NotifierError::Request(format!("invalid HMAC key: {e}")))?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256={hex}"))
}

/// Cut `body` to at most [`MAX_LOGGED_BODY`] bytes on a char boundary.
fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_LOGGED_BODY {
        let mut end = MAX_LOGGED_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Webhook implementation of [`ApprovalNotifier`].
pub struct WebhookNotifier<A> {
    client: reqwest::Client,
    config: NotifierConfig,
    deliveries: A,
}

impl<A: ApprovalRepository> WebhookNotifier<A> {
    pub fn new(config: NotifierConfig, deliveries: A) -> Result<Self, NotifierError> {
        if config.url.is_none() {
            return Err(NotifierError::NotConfigured);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("stepflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifierError::Request(e.to_string()))?;
        Ok(Self {
            client,
            config,
            deliveries,
        })
    }

    /// One POST. Returns the status code and the (truncated) response body,
    /// or the transport error.
    async fn attempt(
        &self,
        url: &str,
        body: &[u8],
        delivery_id: &Uuid,
    ) -> Result<(u16, String), String> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, ApprovalRequested::EVENT)
            .header(DELIVERY_HEADER, delivery_id.to_string())
            .header(TIMESTAMP_HEADER, Utc::now().timestamp().to_string());

        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(secret) = &self.config.secret {
            let signature = sign_payload(secret.as_bytes(), body).map_err(|e| e.to_string())?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, truncate_body(text)))
    }
}

impl<A: ApprovalRepository> ApprovalNotifier for WebhookNotifier<A> {
    async fn notify(&self, payload: &ApprovalRequested) -> Result<(), NotifierError> {
        let url = self.config.url.as_deref().ok_or(NotifierError::NotConfigured)?;
        let body = serde_json::to_vec(payload).map_err(|e| NotifierError::Request(e.to_string()))?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let delivery_id = Uuid::now_v7();
            let started = Instant::now();
            let attempted_at = Utc::now();
            let result = self.attempt(url, &body, &delivery_id).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (status, status_code, response_body, error) = match result {
                Ok((code, text)) if (200..300).contains(&code) => {
                    (DeliveryStatus::Delivered, Some(code), Some(text), None)
                }
                Ok((code, text)) => {
                    let error = format!("webhook responded with status {code}");
                    (DeliveryStatus::Failed, Some(code), Some(text), Some(error))
                }
                Err(e) => (DeliveryStatus::Failed, None, None, Some(e)),
            };

            // The delivery log is best effort; it never cuts the retries short.
            if let Err(e) = self
                .deliveries
                .record_delivery(&DeliveryRecord {
                    id: delivery_id,
                    approval_id: payload.approval_id.clone(),
                    attempt,
                    status,
                    status_code,
                    response_body,
                    error: error.clone(),
                    duration_ms,
                    attempted_at,
                })
                .await
            {
                tracing::warn!(
                    approval_id = payload.approval_id.as_str(),
                    attempt,
                    error = %e,
                    "failed to record webhook delivery"
                );
            }

            match error {
                None => {
                    tracing::debug!(
                        approval_id = payload.approval_id.as_str(),
                        attempt,
                        "approval webhook delivered"
                    );
                    return Ok(());
                }
                Some(e) => {
                    tracing::warn!(
                        approval_id = payload.approval_id.as_str(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "approval webhook delivery failed"
                    );
                    last_error = e;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(exponential_backoff(
                    self.config.initial_backoff_ms,
                    self.config.max_backoff_ms,
                    attempt,
                ))
                .await;
            }
        }

        Err(NotifierError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use stepflow_types::approval::{Approval, ApprovalStatus, approval_id};

    use super::*;
    use crate::sqlite::approval::SqliteApprovalRepository;
    use crate::sqlite::pool::test_pool;

    #[derive(Clone, Default)]
    struct Receiver {
        hits: Arc<AtomicU32>,
        fail_first: u32,
        seen: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
    }

    async fn receive(State(rx): State<Receiver>, headers: HeaderMap, body: Bytes) -> StatusCode {
        let n = rx.hits.fetch_add(1, Ordering::SeqCst) + 1;
        rx.seen.lock().unwrap().push((headers, body));
        if n <= rx.fail_first {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }

    async fn serve(rx: Receiver) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/hook", post(receive)).with_state(rx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn payload() -> ApprovalRequested {
        let run_id = Uuid::now_v7();
        let approval = Approval {
            id: approval_id(&run_id, "review", 0),
            run_id,
            state_id: "review".to_string(),
            message: "Ship it?".to_string(),
            summary_path: None,
            approvers: vec![],
            status: ApprovalStatus::Pending,
            timeout_at: Utc::now(),
            decided_by: None,
            decided_at: None,
            comment: None,
            created_at: Utc::now(),
        };
        ApprovalRequested::new(&approval, "http://127.0.0.1:3000")
    }

    fn config(url: String) -> NotifierConfig {
        NotifierConfig {
            enabled: true,
            url: Some(url),
            timeout_secs: 5,
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            secret: Some("s3cret".to_string()),
            headers: HashMap::from([("X-Team".to_string(), "ops".to_string())]),
        }
    }

    #[test]
    fn test_signature_format() {
        let sig = sign_payload(b"key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_truncate_body_respects_char_boundary() {
        let long = "é".repeat(MAX_LOGGED_BODY);
        let cut = truncate_body(long);
        assert!(cut.len() <= MAX_LOGGED_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_body("short".to_string()), "short");
    }

    #[tokio::test]
    async fn test_new_requires_url() {
        let repo = SqliteApprovalRepository::new(test_pool().await);
        let result = WebhookNotifier::new(NotifierConfig::default(), repo);
        assert!(matches!(result, Err(NotifierError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_delivers_signed_payload_with_headers() {
        let rx = Receiver::default();
        let url = serve(rx.clone()).await;
        let repo = SqliteApprovalRepository::new(test_pool().await);
        let notifier = WebhookNotifier::new(config(url), repo.clone()).unwrap();

        let payload = payload();
        notifier.notify(&payload).await.unwrap();

        let seen = rx.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(headers["x-stepflow-event"], "approval.requested");
        assert_eq!(headers["x-team"], "ops");
        assert!(headers["user-agent"].to_str().unwrap().starts_with("stepflow/"));
        let expected = sign_payload(b"s3cret", body).unwrap();
        assert_eq!(headers["x-stepflow-signature"].to_str().unwrap(), expected);

        let sent: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(sent["approvalId"], payload.approval_id.as_str());

        let log = repo_deliveries(&repo, &payload.approval_id).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, DeliveryStatus::Delivered);
        assert_eq!(log[0].status_code, Some(200));
    }

    #[tokio::test]
    async fn test_retries_until_success_and_logs_each_attempt() {
        let rx = Receiver {
            fail_first: 2,
            ..Receiver::default()
        };
        let url = serve(rx.clone()).await;
        let repo = SqliteApprovalRepository::new(test_pool().await);
        let notifier = WebhookNotifier::new(config(url), repo.clone()).unwrap();

        let payload = payload();
        notifier.notify(&payload).await.unwrap();
        assert_eq!(rx.hits.load(Ordering::SeqCst), 3);

        let log = repo_deliveries(&repo, &payload.approval_id).await;
        let statuses: Vec<DeliveryStatus> = log.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![DeliveryStatus::Failed, DeliveryStatus::Failed, DeliveryStatus::Delivered]
        );
        assert_eq!(log[0].status_code, Some(503));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let rx = Receiver {
            fail_first: u32::MAX,
            ..Receiver::default()
        };
        let url = serve(rx.clone()).await;
        let repo = SqliteApprovalRepository::new(test_pool().await);
        let mut cfg = config(url);
        cfg.max_attempts = 2;
        let notifier = WebhookNotifier::new(cfg, repo.clone()).unwrap();

        let payload = payload();
        let err = notifier.notify(&payload).await.unwrap_err();
        assert!(matches!(err, NotifierError::Exhausted { attempts: 2, .. }));
        assert_eq!(repo_deliveries(&repo, &payload.approval_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_log_failure_does_not_stop_retries() {
        let rx = Receiver {
            fail_first: 1,
            ..Receiver::default()
        };
        let url = serve(rx.clone()).await;
        let pool = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool.clone());
        let notifier = WebhookNotifier::new(config(url), repo).unwrap();

        // Every delivery log write now fails.
        pool.writer.close().await;

        notifier.notify(&payload()).await.unwrap();
        assert_eq!(rx.hits.load(Ordering::SeqCst), 2);
    }

    async fn repo_deliveries(repo: &SqliteApprovalRepository, id: &str) -> Vec<DeliveryRecord> {
        repo.list_deliveries(id).await.unwrap()
    }
}
