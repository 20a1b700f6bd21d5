//! Connection-scoped queries
//!
//! Every function here takes a `&mut SqliteConnection`, so the same call
//! works against a pooled connection or inside an open transaction
//! (`&mut *tx`). Multi-statement writes are composed by the service layer.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqliteConnection;

use super::models::*;
use crate::error::AppError;
use crate::federation::types::{ActivityEnvelope, CREATE, Note};

/// Current time as a fixed-width RFC 3339 string
///
/// Fixed width keeps `ORDER BY created_at` equal to chronological order.
pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conflict_on_unique(what: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |error| match &error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            AppError::Conflict(format!("{what} already exists"))
        }
        _ => AppError::Database(error),
    }
}

// =========================================================================
// Activities
// =========================================================================

/// Store an activity in a user's inbox or outbox
///
/// # Errors
/// `Conflict` if the user already has an activity with this protocol ID
pub async fn insert_activity(
    conn: &mut SqliteConnection,
    activity: &NewActivity<'_>,
) -> Result<ActivityRecord, AppError> {
    let now = timestamp_now();

    sqlx::query_as::<_, ActivityRecord>(
        r#"
        INSERT INTO activities (
            id, user_id, mailbox, activity_context, activity_type,
            activity_id, data, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(EntityId::new().0)
    .bind(activity.user_id)
    .bind(activity.mailbox)
    .bind(activity.context)
    .bind(activity.activity_type)
    .bind(activity.activity_id)
    .bind(activity.data)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *conn)
    .await
    .map_err(conflict_on_unique("activity"))
}

/// Look up an activity by its protocol ID
pub async fn get_activity_by_id(
    conn: &mut SqliteConnection,
    user_id: &str,
    activity_id: &str,
) -> Result<ActivityRecord, AppError> {
    sqlx::query_as::<_, ActivityRecord>(
        "SELECT * FROM activities WHERE user_id = ? AND activity_id = ?",
    )
    .bind(user_id)
    .bind(activity_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(AppError::ActivityNotFound)
}

/// Public `Create` activities in a user's outbox, newest first
///
/// An activity is public when its `to` addresses the public collection,
/// either as a single string or inside an array.
pub async fn list_public_outbox(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Vec<ActivityRecord>, AppError> {
    let records = sqlx::query_as::<_, ActivityRecord>(
        r#"
        SELECT * FROM activities
        WHERE user_id = ? AND mailbox = ? AND activity_type = ?
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(user_id)
    .bind(Mailbox::Outbox)
    .bind(CREATE)
    .fetch_all(&mut *conn)
    .await?;

    Ok(records
        .into_iter()
        .filter(|record| match serde_json::from_str::<ActivityEnvelope>(&record.data) {
            Ok(envelope) => envelope.is_public(),
            Err(error) => {
                tracing::warn!(id = %record.id, %error, "skipping undecodable outbox activity");
                false
            }
        })
        .collect())
}

// =========================================================================
// Followers
// =========================================================================

/// Record that `actor_id` follows `user_id`
///
/// A repeated Follow from the same actor refreshes the stored Follow
/// activity ID instead of adding a second row.
pub async fn create_follower(
    conn: &mut SqliteConnection,
    user_id: &str,
    actor_id: &str,
    activity_id: &str,
) -> Result<FollowerRecord, AppError> {
    let now = timestamp_now();

    let record = sqlx::query_as::<_, FollowerRecord>(
        r#"
        INSERT INTO followers (id, user_id, actor_id, activity_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (user_id, actor_id) DO UPDATE SET
            activity_id = excluded.activity_id,
            updated_at = excluded.updated_at
        RETURNING *
        "#,
    )
    .bind(EntityId::new().0)
    .bind(user_id)
    .bind(actor_id)
    .bind(activity_id)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(record)
}

/// Remove a follower relationship
///
/// # Returns
/// Whether a row was removed; removing an absent follower is not an error
pub async fn delete_follower(
    conn: &mut SqliteConnection,
    user_id: &str,
    actor_id: &str,
) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM followers WHERE user_id = ? AND actor_id = ?")
        .bind(user_id)
        .bind(actor_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_followers(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Vec<FollowerRecord>, AppError> {
    let followers = sqlx::query_as::<_, FollowerRecord>(
        "SELECT * FROM followers WHERE user_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(followers)
}

// =========================================================================
// Notes
// =========================================================================

/// Persist an authored note
///
/// The record ID is the trailing segment of the note's object ID.
///
/// # Errors
/// `Validation` if the object ID has no usable trailing segment,
/// `Conflict` if a note with the same object ID exists
pub async fn create_note(
    conn: &mut SqliteConnection,
    user_id: &str,
    activity_id: &str,
    note: &Note,
) -> Result<NoteRecord, AppError> {
    let id = last_path_segment(&note.id).ok_or_else(|| {
        AppError::Validation(format!("note ID has no trailing segment: {}", note.id))
    })?;
    let published = DateTime::parse_from_rfc3339(&note.published)
        .map(|published| published.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let now = timestamp_now();

    let row = sqlx::query_as::<_, NoteRow>(
        r#"
        INSERT INTO notes (
            id, user_id, activity_id, object_id, content, published,
            to_iri, cc_iri, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(activity_id)
    .bind(&note.id)
    .bind(&note.content)
    .bind(published.to_rfc3339_opts(SecondsFormat::Micros, true))
    .bind(serde_json::to_string(&note.to)?)
    .bind(serde_json::to_string(&note.cc)?)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *conn)
    .await
    .map_err(conflict_on_unique("note"))?;

    row.try_into()
}

pub async fn get_note_by_id(
    conn: &mut SqliteConnection,
    user_id: &str,
    note_id: &str,
) -> Result<NoteRecord, AppError> {
    sqlx::query_as::<_, NoteRow>("SELECT * FROM notes WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(note_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(AppError::NoteNotFound)?
        .try_into()
}
