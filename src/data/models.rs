//! Data models
//!
//! Rust structs for the federation tables. Record IDs are ULIDs and
//! timestamps are chrono UTC values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Last non-empty path segment of a protocol ID
///
/// Note record IDs are the trailing ULID of the note's object URL.
pub fn last_path_segment(id: &str) -> Option<&str> {
    id.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
}

// =============================================================================
// Activities
// =============================================================================

/// Which of an identity's two streams an activity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Mailbox {
    Inbox,
    Outbox,
}

impl Mailbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mailbox::Inbox => "inbox",
            Mailbox::Outbox => "outbox",
        }
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored ActivityStreams activity
///
/// `(user_id, activity_id)` is unique. Rows are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub id: String,
    pub user_id: String,
    pub mailbox: Mailbox,
    #[sqlx(rename = "activity_context")]
    pub context: String,
    pub activity_type: String,
    /// Protocol-level activity ID (URL)
    pub activity_id: String,
    /// Raw JSON body as received or authored
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting an activity
#[derive(Debug, Clone)]
pub struct NewActivity<'a> {
    pub user_id: &'a str,
    pub mailbox: Mailbox,
    pub context: &'a str,
    pub activity_type: &'a str,
    pub activity_id: &'a str,
    pub data: &'a str,
}

// =============================================================================
// Followers
// =============================================================================

/// A remote actor following a local identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowerRecord {
    pub id: String,
    pub user_id: String,
    /// Remote actor ID (URL)
    pub actor_id: String,
    /// The Follow activity that created the relationship
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Notes
// =============================================================================

/// An authored, publicly addressable short post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: String,
    pub user_id: String,
    /// The Create activity that produced this note
    pub activity_id: String,
    /// The note's own object ID (URL)
    pub object_id: String,
    pub content: String,
    pub published: DateTime<Utc>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row shape of `notes`; address lists are stored as JSON arrays
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NoteRow {
    pub id: String,
    pub user_id: String,
    pub activity_id: String,
    pub object_id: String,
    pub content: String,
    pub published: DateTime<Utc>,
    pub to_iri: String,
    pub cc_iri: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<NoteRow> for NoteRecord {
    type Error = AppError;

    fn try_from(row: NoteRow) -> Result<Self, Self::Error> {
        let to = serde_json::from_str(&row.to_iri)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt notes.to_iri: {e}")))?;
        let cc = serde_json::from_str(&row.cc_iri)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt notes.cc_iri: {e}")))?;

        Ok(NoteRecord {
            id: row.id,
            user_id: row.user_id,
            activity_id: row.activity_id,
            object_id: row.object_id,
            content: row.content,
            published: row.published,
            to,
            cc,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_path_segment_reads_trailing_ulid() {
        assert_eq!(
            last_path_segment("https://pub.example.com/~alice/notes/01HF3Y7Z9K"),
            Some("01HF3Y7Z9K")
        );
        assert_eq!(
            last_path_segment("https://pub.example.com/~alice/notes/01HF3Y7Z9K/"),
            Some("01HF3Y7Z9K")
        );
    }

    #[test]
    fn last_path_segment_rejects_bare_origin() {
        assert_eq!(last_path_segment("https:"), None);
        assert_eq!(last_path_segment(""), None);
    }

    #[test]
    fn mailbox_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Mailbox::Outbox).expect("serialize"),
            "\"outbox\""
        );
        assert_eq!(Mailbox::Inbox.to_string(), "inbox");
    }
}
