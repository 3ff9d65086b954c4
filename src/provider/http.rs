//! HTTP provider adapter.
//!
//! Speaks a small JSON protocol to a provider service:
//!
//! - `POST /resources` creates a resource
//! - `PUT /resources/{type}/{name}` updates it
//! - `DELETE /resources/{type}/{name}` deletes it
//! - `GET /resources/{type}/{name}` describes it
//! - `GET /operations/{id}` polls a pending operation
//! - `POST /operations/{id}/cancel` aborts one
//!
//! Mutating responses are `{"status": "complete", "attributes": {...}}`,
//! `{"status": "in_progress", "operation_id": "..."}` or
//! `{"status": "failed", "message": "..."}`.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::planner::Action;
use crate::resource::{Attributes, ResolvedDescriptor, ResourceId};

use super::adapter::{PendingOperation, ProviderAdapter, ProviderResponse, ResourceHandle};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of retries for transient failures.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between retries in milliseconds.
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Header carrying the per-operation idempotency key.
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Provider adapter backed by an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Service base URL without trailing slash.
    base_url: String,
    /// Bearer token.
    token: Option<String>,
    /// Retries after the first attempt.
    max_retries: u32,
    /// Base delay, doubled on each retry.
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    resource: &'a ResourceId,
    #[serde(rename = "type")]
    resource_type: &'a str,
    name: &'a str,
    properties: &'a Attributes,
    ingress: &'a [crate::network::SecurityRule],
    tags: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    properties: &'a Attributes,
    ingress: &'a [crate::network::SecurityRule],
    tags: &'a std::collections::BTreeMap<String, String>,
    previous: &'a Attributes,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum OperationResponse {
    Complete {
        #[serde(default)]
        attributes: Attributes,
    },
    InProgress {
        operation_id: String,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    attributes: Attributes,
}

impl HttpProvider {
    /// Creates a provider for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        })
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    fn resource_path(handle_type: &str, name: &str) -> String {
        format!("/resources/{handle_type}/{name}")
    }

    /// Sends a request, retrying transient failures with the same
    /// idempotency key.
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(StatusCode, String), ProviderError> {
        let key = Uuid::new_v4().to_string();
        let mut attempt = 0;

        loop {
            match self.send_once(method.clone(), path, body, &key).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = self.retry_delay * 2u32.saturating_pow(attempt - 1);
                    let delay = e
                        .retry_delay_secs()
                        .filter(|_| matches!(e, ProviderError::RateLimited { .. }))
                        .map_or(backoff, |secs| backoff.max(Duration::from_secs(secs)));
                    warn!("{method} {path} failed ({e}), retry {attempt}/{} in {delay:?}", self.max_retries);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        idempotency_key: &str,
    ) -> Result<(StatusCode, String), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency_key);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: String::from("Provider rejected the credentials"),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;

        if status.is_server_error() {
            return Err(ProviderError::api_error(status.as_u16(), text));
        }

        Ok((status, text))
    }

    /// Interprets a mutating or polling response.
    fn operation_response(
        resource: &ResourceId,
        action: Action,
        status: StatusCode,
        body: &str,
    ) -> Result<ProviderResponse, ProviderError> {
        if !status.is_success() {
            return Err(ProviderError::api_error(status.as_u16(), body));
        }

        let parsed: OperationResponse = serde_json::from_str(body).map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
        })?;

        match parsed {
            OperationResponse::Complete { attributes } => Ok(ProviderResponse::Complete(attributes)),
            OperationResponse::InProgress { operation_id } => {
                debug!("{action} {resource} in progress as {operation_id}");
                Ok(ProviderResponse::InProgress(PendingOperation {
                    id: operation_id,
                    resource: resource.clone(),
                    action,
                }))
            }
            OperationResponse::Failed { message } => {
                Err(ProviderError::failed(resource.as_str(), message))
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn create(&self, resource: &ResolvedDescriptor) -> Result<ProviderResponse, ProviderError> {
        let body = CreateRequest {
            resource: &resource.id,
            resource_type: resource.resource_type.as_str(),
            name: &resource.physical_name,
            properties: &resource.properties,
            ingress: &resource.ingress,
            tags: &resource.tags,
        };
        let (status, text) = self.send(Method::POST, "/resources", Some(&body)).await?;
        Self::operation_response(&resource.id, Action::Create, status, &text)
    }

    async fn update(
        &self,
        resource: &ResolvedDescriptor,
        previous: &Attributes,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = UpdateRequest {
            properties: &resource.properties,
            ingress: &resource.ingress,
            tags: &resource.tags,
            previous,
        };
        let path = Self::resource_path(resource.resource_type.as_str(), &resource.physical_name);
        let (status, text) = self.send(Method::PUT, &path, Some(&body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                resource: resource.physical_name.clone(),
            });
        }
        Self::operation_response(&resource.id, Action::Update, status, &text)
    }

    async fn delete(&self, resource: &ResourceHandle) -> Result<ProviderResponse, ProviderError> {
        let path = Self::resource_path(resource.resource_type.as_str(), &resource.physical_name);
        let (status, text) = self.send::<()>(Method::DELETE, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                resource: resource.physical_name.clone(),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(ProviderResponse::Complete(Attributes::new()));
        }
        Self::operation_response(&resource.id, Action::Delete, status, &text)
    }

    async fn describe(&self, resource: &ResourceHandle) -> Result<Attributes, ProviderError> {
        let path = Self::resource_path(resource.resource_type.as_str(), &resource.physical_name);
        let (status, text) = self.send::<()>(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                resource: resource.physical_name.clone(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::api_error(status.as_u16(), text));
        }

        let parsed: DescribeResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
        })?;
        Ok(parsed.attributes)
    }

    async fn poll(&self, operation: &PendingOperation) -> Result<ProviderResponse, ProviderError> {
        let path = format!("/operations/{}", operation.id);
        let (status, text) = self.send::<()>(Method::GET, &path, None).await?;
        // An unknown operation says nothing about the resource itself.
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::api_error(
                status.as_u16(),
                format!("operation {} is unknown to the provider", operation.id),
            ));
        }
        Self::operation_response(&operation.resource, operation.action, status, &text)
    }

    async fn cancel(&self, operation: &PendingOperation) -> Result<bool, ProviderError> {
        let path = format!("/operations/{}/cancel", operation.id);
        let (status, _) = self.send::<()>(Method::POST, &path, None).await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {
                Ok(false)
            }
            s => Err(ProviderError::api_error(s.as_u16(), "cancel rejected")),
        }
    }
}
