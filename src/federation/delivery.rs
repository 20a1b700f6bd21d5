//! Activity delivery
//!
//! Sends signed activities to remote inboxes and classifies the result.

use std::time::Instant;

use reqwest::StatusCode;

use super::actor::check_remote_url;
use super::signature::sign_request;
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// How a remote inbox answered a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx
    Delivered(StatusCode),
    /// 5xx; worth trying again later
    Transient(StatusCode),
    /// Any other status; the peer will not accept this activity
    Rejected(StatusCode),
}

impl DeliveryOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            DeliveryOutcome::Delivered(status)
        } else if status.is_server_error() {
            DeliveryOutcome::Transient(status)
        } else {
            DeliveryOutcome::Rejected(status)
        }
    }
}

/// Activity delivery service
#[derive(Debug, Clone)]
pub struct ActivityDelivery {
    http_client: reqwest::Client,
    allow_private_hosts: bool,
}

impl ActivityDelivery {
    pub fn new(http_client: reqwest::Client, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            allow_private_hosts,
        }
    }

    /// Deliver an activity body to a single inbox
    ///
    /// # Arguments
    /// * `inbox_url` - Target inbox URL
    /// * `key_id` - Signing key ID of the sending actor
    /// * `private_key_pem` - Sending actor's private key
    /// * `activity_type` - For metrics only
    /// * `body` - Serialized activity
    ///
    /// # Errors
    /// - `KeyDecode` if the key cannot be parsed
    /// - `HttpClient` on transport failures
    /// - `Validation`/`Forbidden` if the inbox URL is not deliverable
    pub async fn deliver(
        &self,
        inbox_url: &str,
        key_id: &str,
        private_key_pem: &str,
        activity_type: &str,
        body: Vec<u8>,
    ) -> Result<DeliveryOutcome, AppError> {
        let url = check_remote_url(inbox_url, self.allow_private_hosts).await?;

        let mut request = self.http_client.post(url).body(body.clone()).build()?;
        sign_request(&mut request, key_id, private_key_pem, &body)?;

        let started = Instant::now();
        let result = self.http_client.execute(request).await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["deliver"])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["deliver", "error"])
                    .inc();
                tracing::warn!(inbox = %inbox_url, %error, "Delivery failed");
                return Err(error.into());
            }
        };

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["deliver", status.as_str()])
            .inc();

        let outcome = DeliveryOutcome::from_status(status);
        match &outcome {
            DeliveryOutcome::Delivered(_) => {
                ACTIVITYPUB_ACTIVITIES_SENT
                    .with_label_values(&[activity_type])
                    .inc();
                tracing::info!(inbox = %inbox_url, %status, activity_type, "Delivered activity");
            }
            _ => {
                let detail = response.text().await.unwrap_or_default();
                tracing::warn!(
                    inbox = %inbox_url,
                    %status,
                    body = %detail.chars().take(200).collect::<String>(),
                    "Inbox did not accept activity"
                );
            }
        }

        Ok(outcome)
    }
}
