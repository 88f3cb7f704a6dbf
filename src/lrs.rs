//! Learning Record Store client.
//!
//! Defines the [`StatementPublisher`] trait the publish queue talks to and
//! [`LrsClient`], its HTTP implementation against the xAPI statements
//! resource.
//!
//! # Response classification
//!
//! - 2xx → success
//! - 401 / 403 → [`PublishError::Auth`]
//! - 408, 429, 5xx and transport errors → [`PublishError::Connection`]
//! - other 4xx naming the id of a submitted statement → [`PublishError::Storage`]
//! - anything else → [`PublishError::Unexpected`]
//!
//! The client never retries on its own; retry policy belongs to the queue.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::config::LrsConfig;
use crate::errors::PublishError;
use crate::models::Statement;

/// Description of the store returned by the `about` resource.
#[derive(Debug, Clone)]
pub struct LrsAbout {
    pub versions: Vec<String>,
    pub raw: Value,
}

/// Sink for batches of statements.
#[async_trait]
pub trait StatementPublisher: Send + Sync {
    /// Publish the whole sequence in a single call.
    async fn publish_statements(&self, statements: &[Statement]) -> Result<(), PublishError>;

    /// Connectivity probe.
    async fn about(&self) -> Result<LrsAbout, PublishError>;
}

pub struct LrsClient {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    version: String,
}

impl LrsClient {
    pub fn new(config: &LrsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.resolved_password(),
            version: config.version.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, method: reqwest::Method, resource: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.endpoint, resource))
            .basic_auth(&self.username, Some(&self.password))
            .header("X-Experience-API-Version", &self.version)
    }
}

#[async_trait]
impl StatementPublisher for LrsClient {
    async fn publish_statements(&self, statements: &[Statement]) -> Result<(), PublishError> {
        let response = self
            .request(reqwest::Method::POST, "statements")
            .json(statements)
            .send()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, body, statements))
    }

    async fn about(&self) -> Result<LrsAbout, PublishError> {
        let response = self
            .request(reqwest::Method::GET, "about")
            .send()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, body, &[]));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| PublishError::Connection(format!("invalid about response: {}", e)))?;
        let versions = raw
            .get("version")
            .and_then(Value::as_array)
            .map(|v| {
                v.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(LrsAbout { versions, raw })
    }
}

/// Map a non-success answer onto the publish error classes.
pub fn classify_failure(status: StatusCode, body: String, submitted: &[Statement]) -> PublishError {
    let message = store_message(&body);

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return PublishError::Auth {
            status: status.as_u16(),
            message,
        };
    }

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return PublishError::Connection(format!("{}: {}", status, message));
    }

    if status.is_client_error() {
        if let Some(rejected) = submitted
            .iter()
            .find(|s| body.contains(&s.id.to_string()))
        {
            return PublishError::Storage {
                statement_id: rejected.id,
                message,
            };
        }
    }

    PublishError::Unexpected {
        status: status.as_u16(),
        message,
    }
}

/// Human-readable message from an LRS error body (`{"message": ...}` or text).
fn store_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Activity, Agent, Verb, XAPI_VERSION};
    use chrono::Utc;
    use uuid::Uuid;

    fn stmt() -> Statement {
        Statement {
            id: Uuid::new_v4(),
            actor: Agent::new("u", "https://lms"),
            verb: Verb::new("http://adlnet.gov/expapi/verbs/experienced", "experienced"),
            object: Activity::reference("https://lms/a"),
            result: None,
            context: None,
            timestamp: Utc::now(),
            version: XAPI_VERSION.to_string(),
        }
    }

    #[test]
    fn auth_statuses() {
        let err = classify_failure(StatusCode::UNAUTHORIZED, "nope".into(), &[]);
        assert!(matches!(err, PublishError::Auth { status: 401, .. }));
        assert!(err.is_connection_class());
    }

    #[test]
    fn transient_statuses_are_connection_errors() {
        for status in [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(
                classify_failure(status, String::new(), &[]),
                PublishError::Connection(_)
            ));
        }
    }

    #[test]
    fn bad_request_naming_a_statement_is_storage_rejection() {
        let batch = vec![stmt(), stmt(), stmt()];
        let body = format!(
            r#"{{"message": "Statement {} has an invalid verb"}}"#,
            batch[1].id
        );
        match classify_failure(StatusCode::BAD_REQUEST, body, &batch) {
            PublishError::Storage {
                statement_id,
                message,
            } => {
                assert_eq!(statement_id, batch[1].id);
                assert!(message.contains("invalid verb"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_request_without_id_is_unexpected() {
        let batch = vec![stmt()];
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "malformed".into(), &batch),
            PublishError::Unexpected { status: 400, .. }
        ));
    }
}
