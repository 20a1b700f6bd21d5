//! WebFinger protocol implementation
//!
//! Resolves `acct:user@domain` handles to local actor URLs.

use serde::{Deserialize, Serialize};

use super::types::ACTIVITY_CONTENT_TYPE;
use crate::error::AppError;

/// A JSON Resource Descriptor (RFC 7033 §4.4)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Split an `acct:user@domain` resource into its parts
///
/// # Errors
/// `Validation` unless the resource is `acct:` followed by exactly one
/// non-empty user, one `@` and a non-empty domain
pub fn parse_acct_resource(resource: &str) -> Result<(&str, &str), AppError> {
    let invalid = || AppError::Validation("invalid resource parameter".to_string());

    let handle = resource.strip_prefix("acct:").ok_or_else(invalid)?;
    let (user, domain) = handle.split_once('@').ok_or_else(invalid)?;
    if user.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }

    Ok((user, domain))
}

/// Generate WebFinger response for a local account
///
/// # Arguments
/// * `resource` - The resource as requested; echoed as the subject
/// * `actor_id` - The account's actor URL
pub fn generate_webfinger_response(resource: &str, actor_id: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: resource.to_string(),
        aliases: vec![actor_id.to_string()],
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_CONTENT_TYPE.to_string()),
            href: Some(actor_id.to_string()),
        }],
    }
}
