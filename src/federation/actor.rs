//! Actors
//!
//! Rendering local identities as actor documents, and fetching remote ones.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use http::header::ACCEPT;

use super::actor_cache::ActorCache;
use super::signature::actor_key_id;
use super::types::{ACTIVITY_CONTENT_TYPE, ACTOR_CONTEXT, Actor, Image, PublicKey};
use crate::config::{FederationConfig, ServerConfig};
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Anything that can be published as an actor
pub trait Actorish {
    fn username(&self) -> &str;
    fn name(&self) -> &str;
    fn summary(&self) -> &str;
    /// Profile image URL, if one is set
    fn image_url(&self) -> Option<&str>;
}

/// Build the actor document for a local identity
///
/// # Arguments
/// * `user` - The local identity
/// * `public_key_pem` - The identity's public key
/// * `server` - Server configuration, for the public base URL
pub fn actor_document(user: &impl Actorish, public_key_pem: &str, server: &ServerConfig) -> Actor {
    let id = server.actor_id(user.username());

    Actor {
        context: Some(ACTOR_CONTEXT.clone()),
        kind: "Person".to_string(),
        inbox: Some(format!("{id}/inbox")),
        outbox: Some(format!("{id}/outbox")),
        following: Some(format!("{id}/following")),
        followers: Some(format!("{id}/followers")),
        preferred_username: Some(user.username().to_string()),
        name: Some(user.name().to_string()),
        summary: Some(user.summary().to_string()),
        url: Some(id.clone()),
        icon: user.image_url().map(|url| Image {
            kind: "Image".to_string(),
            name: None,
            url: url.to_string(),
        }),
        public_key: Some(PublicKey {
            id: actor_key_id(&id),
            owner: id.clone(),
            public_key_pem: public_key_pem.to_string(),
        }),
        id,
    }
}

// =============================================================================
// Remote fetch
// =============================================================================

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Validate a remote URL before the server requests it
///
/// Rejects non-HTTP(S) URLs and, unless private hosts are allowed, hosts
/// that are or resolve to local/private addresses.
pub async fn check_remote_url(raw: &str, allow_private_hosts: bool) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid remote URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in remote URL".to_string()))?
        .to_ascii_lowercase();

    if !allow_private_hosts {
        if is_disallowed_host(&host) {
            return Err(AppError::Forbidden);
        }
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in remote URL".to_string()))?;
        // Hosts that look public may still resolve internally
        validate_resolved_host_ips(&host, port).await?;
    }

    Ok(parsed)
}

/// Fetches and caches remote actor documents
#[derive(Debug, Clone)]
pub struct ActorFetcher {
    http_client: reqwest::Client,
    allow_private_hosts: bool,
    cache: ActorCache,
}

impl ActorFetcher {
    pub fn new(http_client: reqwest::Client, config: &FederationConfig) -> Self {
        Self {
            http_client,
            allow_private_hosts: config.allow_private_hosts,
            cache: ActorCache::new(
                Duration::from_secs(config.actor_cache_ttl_seconds),
                config.actor_cache_capacity,
            ),
        }
    }

    /// Fetch a remote actor document
    ///
    /// # Arguments
    /// * `actor_id` - Actor URL; a `#fragment` is ignored
    ///
    /// # Errors
    /// - `HttpClient` on transport failures
    /// - `Federation` on non-2xx responses or undecodable documents
    /// - `Forbidden`/`Validation` when the URL fails the remote URL check
    pub async fn fetch_actor(&self, actor_id: &str) -> Result<Actor, AppError> {
        let actor_url = actor_id.split('#').next().unwrap_or(actor_id);

        if let Some(actor) = self.cache.get(actor_url).await {
            return Ok(actor);
        }

        let url = check_remote_url(actor_url, self.allow_private_hosts).await?;

        let started = Instant::now();
        let result = self
            .http_client
            .get(url)
            .header(ACCEPT, ACTIVITY_CONTENT_TYPE)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["fetch", "error"])
                    .inc();
                return Err(error.into());
            }
        };

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["fetch", status.as_str()])
            .inc();

        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch actor {}: HTTP {}",
                actor_url, status
            )));
        }

        let actor: Actor = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

        if actor.id.is_empty() {
            return Err(AppError::Federation(
                "Actor document has no id".to_string(),
            ));
        }

        tracing::debug!(actor = %actor_url, "Fetched remote actor");
        self.cache.insert(actor_url, actor.clone()).await;
        Ok(actor)
    }

    /// Drop any cached copy of `actor_id` and fetch it again
    pub async fn refresh_actor(&self, actor_id: &str) -> Result<Actor, AppError> {
        let actor_url = actor_id.split('#').next().unwrap_or(actor_id);
        self.cache.invalidate(actor_url).await;
        self.fetch_actor(actor_id).await
    }
}
