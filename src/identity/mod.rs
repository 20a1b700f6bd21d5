//! Local identities
//!
//! Users, their RSA key pairs and API keys.

mod models;
mod service;

pub use models::*;
pub use service::{IdentityService, generate_key_pair};
