use crate::client::{AppendOutcome, ClientError, ProvisionOutcome, StreamClient};
use crate::record::StreamRecord;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use urlencoding;

/// Configuration for [`HttpStreamClient`].
///
/// The client talks to a log-stream service over its JSON HTTP interface:
/// groups and streams are provisioned with idempotent `PUT`s and records
/// are appended with a `POST` of a JSON array.
#[derive(Clone, Debug)]
pub struct HttpStreamConfig {
    /// Base URL without a trailing slash, e.g. "http://127.0.0.1:9280".
    pub base_url: String,
    /// Optional bearer token attached to every request.
    pub token: Option<String>,
}

/// HTTP implementation of [`StreamClient`].
///
/// Status mapping is the classification contract: 4xx responses that will
/// deterministically repeat become fatal [`ClientError`] kinds, while 5xx,
/// throttling on append, and transport failures are transient.
#[derive(Clone)]
pub struct HttpStreamClient {
    client: Client,
    config: HttpStreamConfig,
}

/// Error body the service returns with non-2xx statuses.
#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Success body of an append; `rejected` counts records the service
/// dropped from an otherwise accepted request.
#[derive(Deserialize, Default)]
struct AppendBody {
    #[serde(default)]
    rejected: u64,
}

impl HttpStreamClient {
    /// Construct a new client using the provided configuration.
    ///
    /// **Parameters**
    /// - `config`: [`HttpStreamConfig`] describing the target URL and
    ///   optional authentication token.
    ///
    /// **Returns**
    /// - A ready-to-use [`HttpStreamClient`] that can be passed into
    ///   [`crate::queue::StreamQueue::spawn`] or the init helpers.
    pub fn new(config: HttpStreamConfig) -> Self {
        let client = Client::new();
        Self { client, config }
    }

    fn group_url(&self, group: &str) -> String {
        format!(
            "{}/v1/groups/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(group)
        )
    }

    fn stream_url(&self, group: &str, stream: &str) -> String {
        format!("{}/streams/{}", self.group_url(group), urlencoding::encode(stream))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn provision(&self, url: String) -> Result<ProvisionOutcome, ClientError> {
        let resp = self
            .authorized(self.client.put(&url))
            .send()
            .await
            .map_err(transport_error)?;
        match resp.status() {
            status if status.is_success() => Ok(ProvisionOutcome::Created),
            StatusCode::CONFLICT => Ok(ProvisionOutcome::AlreadyExists),
            status => Err(classify_provision(status, error_detail(resp).await.1)),
        }
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    ClientError::Transient(err.to_string())
}

/// Pull the machine-readable code and a human-readable detail string out of
/// an error response, tolerating non-JSON bodies.
async fn error_detail(resp: Response) -> (Option<String>, String) {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => {
            let detail = format!(
                "status {}: {}",
                status,
                body.message.unwrap_or_else(|| text.clone())
            );
            (body.code, detail)
        }
        Err(_) => (None, format!("status {status}: {text}")),
    }
}

fn classify_provision(status: StatusCode, detail: String) -> ClientError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ClientError::InvalidParameter(detail)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized(detail),
        StatusCode::NOT_FOUND => ClientError::MissingDestination(detail),
        // Provisioning throttles mean the account hit a resource cap, not a
        // rate limit; retrying cannot create the destination.
        StatusCode::TOO_MANY_REQUESTS => ClientError::QuotaExceeded(detail),
        _ => ClientError::Transient(detail),
    }
}

fn classify_append(
    status: StatusCode,
    code: Option<&str>,
    detail: String,
) -> Result<AppendOutcome, ClientError> {
    match status {
        // A conflict is either a resubmission the service already took or a
        // sequencing rejection; the body code tells them apart.
        StatusCode::CONFLICT if code == Some("duplicate_submission") => {
            Ok(AppendOutcome::Duplicate)
        }
        StatusCode::CONFLICT => Err(ClientError::BadSequence(detail)),
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => Err(ClientError::InvalidParameter(detail)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::Unauthorized(detail)),
        StatusCode::NOT_FOUND => Err(ClientError::MissingDestination(detail)),
        // Append throttling is a rate limit; the same batch succeeds later.
        StatusCode::TOO_MANY_REQUESTS => Err(ClientError::Transient(detail)),
        _ => Err(ClientError::Transient(detail)),
    }
}

#[async_trait]
impl StreamClient for HttpStreamClient {
    async fn create_group(&self, group: &str) -> Result<ProvisionOutcome, ClientError> {
        self.provision(self.group_url(group)).await
    }

    async fn create_stream(
        &self,
        group: &str,
        stream: &str,
    ) -> Result<ProvisionOutcome, ClientError> {
        self.provision(self.stream_url(group, stream)).await
    }

    async fn put_records(
        &self,
        group: &str,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<AppendOutcome, ClientError> {
        let url = format!("{}/records", self.stream_url(group, stream));
        let resp = self
            .authorized(self.client.post(&url).json(records))
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status().is_success() {
            let body: AppendBody = resp.json().await.unwrap_or_default();
            return Ok(AppendOutcome::Accepted {
                partially_rejected: body.rejected > 0,
            });
        }

        let status = resp.status();
        let (code, detail) = error_detail(resp).await;
        classify_append(status, code.as_deref(), detail)
    }
}
