//! `http.request` operation handler.
//!
//! Input:
//! ```json
//! { "url": "https://...", "method": "POST", "headers": { "X-Key": "v" },
//!   "body": { "any": "json" }, "timeout_secs": 10 }
//! ```
//! `method` defaults to GET. A string `body` is sent verbatim, any other JSON
//! value is sent as `application/json`. 2xx responses produce
//! `{ status, headers, body }` where `body` is parsed JSON when possible.
//! Other statuses and transport errors are retryable failures.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use stepflow_core::workflow::operation::{OperationFailure, OperationHandler, OperationRequest};

/// Task identifier this handler is registered under.
pub const HTTP_TASK: &str = "http.request";

pub struct HttpOperation {
    client: reqwest::Client,
}

impl HttpOperation {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("stepflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn execute(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
        let input = &request.input;
        let url = input
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| OperationFailure::InvalidInput("'url' is required".to_string()))?;
        let method = input.get("method").and_then(Value::as_str).unwrap_or("GET");
        let method: reqwest::Method = method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| OperationFailure::InvalidInput(format!("invalid HTTP method: {method}")))?;

        let mut builder = self.client.request(method, url);

        if let Some(headers) = input.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                builder = builder.header(key.as_str(), value);
            }
        }

        builder = match input.get("body") {
            None | Some(Value::Null) => builder,
            Some(Value::String(s)) => builder.body(s.clone()),
            Some(other) => builder.json(other),
        };

        if let Some(secs) = input.get("timeout_secs").and_then(Value::as_u64) {
            builder = builder.timeout(Duration::from_secs(secs.max(1)));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OperationFailure::Failed(format!("HTTP request to '{url}' failed: {e}")))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("<binary>").to_string()))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| OperationFailure::Failed(format!("failed to read HTTP response body: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(OperationFailure::Failed(format!(
                "HTTP {status} from '{url}'"
            )));
        }

        tracing::debug!(
            run_id = %request.run_id,
            state_id = request.state_id.as_str(),
            url,
            status,
            body_len = text.len(),
            "http operation completed"
        );

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({
            "status": status,
            "headers": headers,
            "body": body,
        }))
    }
}

impl OperationHandler for HttpOperation {
    async fn invoke(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
        tokio::select! {
            result = self.execute(request) => result,
            _ = request.cancel.cancelled() => {
                Err(OperationFailure::Failed("request cancelled".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;

    async fn serve() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { Json(json!({ "hello": "world" })) }))
            .route("/text", get(|| async { "plain" }))
            .route(
                "/echo",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    let team = headers
                        .get("x-team")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({ "team": team, "received": body }))
                }),
            )
            .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(input: Value) -> OperationRequest {
        OperationRequest {
            run_id: Uuid::now_v7(),
            state_id: "call".to_string(),
            task: HTTP_TASK.to_string(),
            input,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_get_parses_json_body() {
        let base = serve().await;
        let op = HttpOperation::new().unwrap();

        let out = op.invoke(&request(json!({ "url": format!("{base}/ok") }))).await.unwrap();
        assert_eq!(out["status"], json!(200));
        assert_eq!(out["body"]["hello"], json!("world"));

        let text = op.invoke(&request(json!({ "url": format!("{base}/text") }))).await.unwrap();
        assert_eq!(text["body"], json!("plain"));
    }

    #[tokio::test]
    async fn test_post_sends_json_and_headers() {
        let base = serve().await;
        let op = HttpOperation::new().unwrap();

        let out = op
            .invoke(&request(json!({
                "url": format!("{base}/echo"),
                "method": "post",
                "headers": { "X-Team": "ops" },
                "body": { "amount": 5 }
            })))
            .await
            .unwrap();
        assert_eq!(out["body"]["team"], json!("ops"));
        assert_eq!(out["body"]["received"]["amount"], json!(5));
    }

    #[tokio::test]
    async fn test_error_status_is_retryable_failure() {
        let base = serve().await;
        let op = HttpOperation::new().unwrap();

        let err = op
            .invoke(&request(json!({ "url": format!("{base}/down") })))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_missing_url_is_invalid_input() {
        let op = HttpOperation::new().unwrap();
        let err = op.invoke(&request(json!({ "method": "GET" }))).await.unwrap_err();
        assert!(matches!(err, OperationFailure::InvalidInput(_)));
        assert!(!err.is_retryable());
    }
}
