//! Outbox side of activity recording

use sqlx::SqliteConnection;

use crate::data::{ActivityRecord, store};
use crate::error::AppError;
use crate::federation::types::{ActivityEnvelope, CREATE, NOTE, TypedActivity};
use crate::jobs::{JobArgs, JobQueue};

/// Store the authored note and schedule one delivery per follower
///
/// Followers are listed on the caller's transaction so the fan-out sees
/// the same snapshot as the insert.
///
/// # Errors
/// - `InvalidActivityType` unless the activity is a Create
/// - `InvalidObjectType` unless it embeds a Note
pub(super) async fn publish_outbox_activity(
    conn: &mut SqliteConnection,
    jobs: &JobQueue,
    record: &ActivityRecord,
) -> Result<usize, AppError> {
    let envelope = ActivityEnvelope::from_slice(record.data.as_bytes())?;
    if envelope.kind != CREATE {
        return Err(AppError::InvalidActivityType(envelope.kind));
    }

    let note = match envelope.decode() {
        Ok(TypedActivity::Create(note)) if note.kind == NOTE => note,
        Ok(TypedActivity::Create(note)) => return Err(AppError::InvalidObjectType(note.kind)),
        _ => return Err(AppError::InvalidObjectType("missing".to_string())),
    };

    store::create_note(conn, &record.user_id, &record.activity_id, &note).await?;

    let followers = store::list_followers(conn, &record.user_id).await?;
    for follower in &followers {
        jobs.enqueue(
            conn,
            &JobArgs::HandleOutboxDelivery {
                user_id: record.user_id.clone(),
                activity_id: record.activity_id.clone(),
                follower_actor_id: follower.actor_id.clone(),
            },
        )
        .await?;
    }

    tracing::info!(
        activity_id = %record.activity_id,
        followers = followers.len(),
        "Scheduled outbox delivery"
    );
    Ok(followers.len())
}
