//! HTTP Signatures for ActivityPub
//!
//! Outgoing requests are signed over `(request-target) date digest` with
//! RSA-SHA256. Incoming requests must be signed with `rsa-sha256` by the
//! key the claimed actor publishes.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderValue;
use http::header::{ACCEPT, CONTENT_TYPE, DATE};
use rsa::pkcs1v15::Signature as Pkcs1v15Signature;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::actor::ActorFetcher;
use super::types::{ACTIVITY_CONTENT_TYPE, Actor};
use crate::error::AppError;

/// Only algorithm accepted on inbound requests
pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// Headers covered by outgoing signatures
const SIGNED_HEADERS: [&str; 3] = ["(request-target)", "date", "digest"];

/// Maximum clock skew tolerated on the Date header
const MAX_DATE_SKEW_SECONDS: i64 = 300;

/// Key ID published on local actors
pub fn actor_key_id(actor_id: &str) -> String {
    format!("{actor_id}#main-key")
}

fn invalid(reason: impl Into<String>) -> AppError {
    AppError::SignatureInvalid(reason.into())
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid header value: {e}")))
}

/// Sign an outgoing request in place
///
/// Sets `Content-Type`, `Accept`, `Date`, `Digest` and `Signature`.
///
/// # Arguments
/// * `request` - Request whose URL and method are signed
/// * `key_id` - Full URL to the public key (actor#main-key)
/// * `private_key_pem` - PKCS#8 RSA private key
/// * `body` - Exact body bytes the request will carry
///
/// # Errors
/// `KeyDecode` if the private key cannot be parsed
pub fn sign_request(
    request: &mut reqwest::Request,
    key_id: &str,
    private_key_pem: &str,
    body: &[u8],
) -> Result<(), AppError> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::KeyDecode(e.to_string()))?;

    let url = request.url();
    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let request_target = format!(
        "{} {}",
        request.method().as_str().to_lowercase(),
        path_and_query
    );

    // RFC 2616 date
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = generate_digest(body);

    let signing_string = format!(
        "(request-target): {}\ndate: {}\ndigest: {}",
        request_target, date, digest
    );

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNATURE_ALGORITHM,
        SIGNED_HEADERS.join(" "),
        BASE64.encode(signature.to_bytes())
    );

    let headers = request.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_CONTENT_TYPE));
    headers.insert(ACCEPT, HeaderValue::from_static(ACTIVITY_CONTENT_TYPE));
    headers.insert(DATE, header_value(&date)?);
    headers.insert("digest", header_value(&digest)?);
    headers.insert("signature", header_value(&signature_header)?);

    Ok(())
}

/// Verify an HTTP request signature against a known public key
///
/// # Arguments
/// * `method` - HTTP method
/// * `path_and_query` - Request path as received, including any query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - SPKI RSA public key
///
/// # Errors
/// `SignatureInvalid` for every failure
pub fn verify_signature(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
) -> Result<(), AppError> {
    let parsed = parse_signature_header(signature_header(headers)?)?;

    if !parsed.algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
        return Err(invalid(format!(
            "unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(invalid(format!("signed headers must include {required}")));
        }
    }

    // Date must be recent
    let date = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date).map_err(|_| invalid("invalid Date format"))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECONDS {
        return Err(invalid("Date header too old or in future"));
    }

    // Digest must match the body actually received
    if header_str(headers, "digest")? != generate_digest(body) {
        return Err(invalid("digest mismatch"));
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path_and_query),
            pseudo if pseudo.starts_with('(') => {
                return Err(invalid(format!("unsupported pseudo-header {pseudo}")));
            }
            name => header_str(headers, name)?.to_string(),
        };
        signing_parts.push(format!("{name}: {value}"));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| invalid("invalid signature encoding"))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| invalid(format!("invalid signature format: {e}")))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| invalid(format!("invalid public key: {e}")))?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| invalid("signature verification failed"))
}

/// Verify that an inbound request was signed by `claimed_actor_id`
///
/// The actor document is fetched (or taken from cache); the signature's
/// `keyId` must equal the actor's published `publicKey.id`. When a cached
/// document does not verify, it is refetched once in case the actor has
/// rotated its key.
///
/// # Returns
/// The verified actor document
pub async fn verify_request(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    claimed_actor_id: &str,
    fetcher: &ActorFetcher,
) -> Result<Actor, AppError> {
    let parsed = parse_signature_header(signature_header(headers)?)?;
    let fetch_failed =
        |e: AppError| invalid(format!("could not fetch actor {claimed_actor_id}: {e}"));

    let actor = fetcher
        .fetch_actor(claimed_actor_id)
        .await
        .map_err(fetch_failed)?;
    let error = match verify_with_actor(method, path_and_query, headers, body, &parsed, &actor) {
        Ok(()) => return Ok(actor),
        Err(error) => error,
    };

    let refreshed = fetcher
        .refresh_actor(claimed_actor_id)
        .await
        .map_err(fetch_failed)?;
    if published_key(&refreshed) == published_key(&actor) {
        return Err(error);
    }
    tracing::info!(actor = %claimed_actor_id, "Actor key changed; verifying with refetched key");
    verify_with_actor(method, path_and_query, headers, body, &parsed, &refreshed)?;

    Ok(refreshed)
}

fn published_key(actor: &Actor) -> Option<(&str, &str)> {
    actor
        .public_key
        .as_ref()
        .map(|key| (key.id.as_str(), key.public_key_pem.as_str()))
}

fn verify_with_actor(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    parsed: &ParsedSignature,
    actor: &Actor,
) -> Result<(), AppError> {
    let (key_id, public_key_pem) =
        published_key(actor).ok_or_else(|| invalid("actor publishes no public key"))?;

    if key_id != parsed.key_id {
        return Err(invalid("keyId does not match the actor's public key"));
    }

    verify_signature(method, path_and_query, headers, body, public_key_pem)
}

fn signature_header(headers: &http::HeaderMap) -> Result<&str, AppError> {
    headers
        .get("signature")
        .ok_or_else(|| invalid("missing Signature header"))?
        .to_str()
        .map_err(|_| invalid("invalid Signature header"))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| invalid(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| invalid(format!("invalid {name} header")))
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| invalid("missing keyId"))?,
        algorithm: algorithm.ok_or_else(|| invalid("missing algorithm"))?,
        headers: headers.ok_or_else(|| invalid("missing headers"))?,
        signature: signature.ok_or_else(|| invalid("missing signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}
