//! Identity records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::federation::actor::Actorish;

/// A local identity that owns an inbox, outbox and key pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub summary: String,
    pub name: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actorish for User {
    fn username(&self) -> &str {
        &self.username
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn summary(&self) -> &str {
        &self.summary
    }

    fn image_url(&self) -> Option<&str> {
        Some(self.image_url.as_str()).filter(|url| !url.is_empty())
    }
}

/// Fields for a new user
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub name: String,
    pub summary: String,
    pub image_url: String,
}

/// Which half of a key pair a PEM holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum KeyKind {
    Public,
    Private,
}

/// A PEM-encoded signing key
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SigningKey {
    pub id: String,
    pub user_id: String,
    pub kind: KeyKind,
    pub pem: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored API key; clients present it as `$id.$value`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
