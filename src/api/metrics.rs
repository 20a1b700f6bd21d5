//! `/metrics` in the Prometheus text exposition format

use axum::http::header::CONTENT_TYPE;
use axum::{Router, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};

use crate::error::AppError;
use crate::metrics::REGISTRY;

async fn scrape() -> Result<impl IntoResponse, AppError> {
    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode metrics: {e}")))?;

    Ok(([(CONTENT_TYPE, encoder.format_type().to_string())], body))
}

/// Stateless so it can be merged after `with_state`
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(scrape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scrape_uses_text_format() {
        crate::metrics::init_metrics();

        let response = scrape().await.unwrap().into_response();

        let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
