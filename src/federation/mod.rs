//! ActivityPub federation module
//!
//! Handles:
//! - ActivityStreams wire types
//! - Actor documents and remote actor fetching
//! - HTTP Signatures
//! - Activity delivery
//! - WebFinger

pub mod actor;
mod actor_cache;
mod delivery;
pub mod signature;
pub mod types;
mod webfinger;

pub use actor::{ActorFetcher, Actorish, actor_document, check_remote_url};
pub use actor_cache::ActorCache;
pub use delivery::{ActivityDelivery, DeliveryOutcome};
pub use signature::{
    actor_key_id, generate_digest, parse_signature_header, sign_request, verify_request,
    verify_signature,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_acct_resource,
};
