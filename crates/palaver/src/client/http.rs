//! One-shot HTTP variant of the client.
//!
//! Each dispatch is a `POST /api/<task>`; the response body is the reply.
//! No correlation table, no reconnection, no push. Useful when the caller
//! is itself stateless or sits behind infrastructure that speaks HTTP
//! better than WebSocket.

use serde_json::Value;

use palaverproto::WireError;

use crate::error::ClientError;

pub struct HttpClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Dispatch one task; OK payloads come back as the value, error
    /// statuses as the decoded wire error.
    pub async fn dispatch(&self, task: &str, payload: Value) -> Result<Value, ClientError> {
        let url = format!("{}/api/{}", self.base_url, task);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            Ok(body)
        } else {
            let mut error = WireError::from_value(body);
            if error.code.is_none() {
                error.code = Some(status.as_u16());
            }
            Err(ClientError::Task(error))
        }
    }

    /// `GET /healthcheck`.
    pub async fn healthcheck(&self) -> Result<Value, ClientError> {
        let url = format!("{}/healthcheck", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            Ok(body)
        } else {
            Err(ClientError::Task(WireError::from_value(body)))
        }
    }
}
