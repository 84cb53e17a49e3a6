use async_trait::async_trait;
use booking_core::{Meeting, MeetingRequest, ProviderError, VideoProvider};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{error, info};

/// Meeting API client used by the session provisioner
pub struct HttpVideoProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpVideoProvider {
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(HttpVideoProvider {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

impl std::fmt::Debug for HttpVideoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVideoProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VideoProvider for HttpVideoProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_meeting(&self, request: &MeetingRequest) -> Result<Meeting, ProviderError> {
        let url = format!("{}/meetings", self.base_url);

        let mut builder = self.client.post(&url).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            error!(booking_id = %request.booking_id, "Meeting request failed: {}", e);
            ProviderError::Unavailable(format!("Meeting request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = format!("Meeting creation failed with status {}: {}", status, error_text);
            return Err(classify(status, message));
        }

        let meeting = response.json::<Meeting>().await.map_err(|e| {
            ProviderError::Unavailable(format!("Failed to parse response: {}", e))
        })?;

        info!(booking_id = %request.booking_id, "Meeting created");

        Ok(meeting)
    }
}

/// Server-side and throttling failures are retryable; other client errors are not
fn classify(status: StatusCode, message: String) -> ProviderError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ProviderError::Unavailable(message)
    } else {
        ProviderError::Rejected(message)
    }
}
