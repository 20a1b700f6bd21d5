//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub actors, mailboxes and collections
//! - WebFinger discovery
//! - Metrics (Prometheus)

mod activitypub;
mod extract;
pub mod metrics;
mod wellknown;

use axum::http::{HeaderValue, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::federation::types::ACTIVITY_CONTENT_TYPE;

pub use activitypub::activitypub_router;
pub use extract::{ApiKeyUser, LocalUser};
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;

/// JSON body served as `application/activity+json`
#[derive(Debug, Clone)]
pub struct ActivityJson<T>(pub T);

impl<T: Serialize> IntoResponse for ActivityJson<T> {
    fn into_response(self) -> Response {
        let mut response = axum::Json(self.0).into_response();
        if response.status().is_success() {
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static(ACTIVITY_CONTENT_TYPE),
            );
        }
        response
    }
}
