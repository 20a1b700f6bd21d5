//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox (publishing and listing)
//! - Followers/Following collections
//! - Notes

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, header::LOCATION};
use axum::response::{IntoResponse, Response};
use axum::{
    Router,
    routing::{get, post},
};
use chrono::SecondsFormat;

use super::ActivityJson;
use super::extract::{ApiKeyUser, LocalUser};
use crate::AppState;
use crate::data::Mailbox;
use crate::error::AppError;
use crate::federation::types::{
    ACTIVITY_STREAMS_CONTEXT, Activity, ActivityEnvelope, CREATE, Context, NOTE, Note,
    OrderedCollection,
};
use crate::federation::{actor_document, verify_request};

/// Create ActivityPub router
///
/// Routes:
/// - GET /:handle - Actor profile
/// - POST /:handle/inbox - Personal inbox
/// - GET, POST /:handle/outbox - Outbox
/// - GET /:handle/followers - Followers collection
/// - GET /:handle/following - Following collection
/// - GET /:handle/notes/:id - Authored note
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/:handle", get(actor))
        .route("/:handle/inbox", post(inbox))
        .route("/:handle/outbox", get(outbox).post(publish))
        .route("/:handle/followers", get(followers))
        .route("/:handle/following", get(following))
        .route("/:handle/notes/:id", get(note))
}

/// GET /:handle
async fn actor(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
) -> Result<Response, AppError> {
    let key = state.identity.get_public_key(&user.id).await?;
    let document = actor_document(&user, &key.pem, &state.config.server);
    Ok(ActivityJson(document).into_response())
}

/// POST /:handle/inbox
///
/// # Steps
/// 1. Parse the envelope and find the claimed actor
/// 2. Verify the HTTP signature against that actor's key
/// 3. Record the activity and schedule its side effects
///
/// Responds 201 when recorded, 202 when the activity was already known.
async fn inbox(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let envelope = ActivityEnvelope::from_slice(&body)?;
    let actor_id = envelope
        .actor_id()
        .ok_or_else(|| AppError::Validation("activity has no actor".to_string()))?;
    if envelope.id.is_empty() || envelope.kind.is_empty() {
        return Err(AppError::Validation(
            "activity must have an id and a type".to_string(),
        ));
    }

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    verify_request(
        method.as_str(),
        path_and_query,
        &headers,
        &body,
        actor_id,
        &state.fetcher,
    )
    .await?;

    let data = std::str::from_utf8(&body)
        .map_err(|_| AppError::Validation("body is not UTF-8".to_string()))?;
    let context = envelope
        .context
        .as_ref()
        .and_then(Context::primary_iri)
        .unwrap_or(ACTIVITY_STREAMS_CONTEXT);

    match state
        .activities
        .create_activity(
            &user.id,
            Mailbox::Inbox,
            context,
            &envelope.kind,
            &envelope.id,
            data,
        )
        .await
    {
        Ok(_) => Ok(StatusCode::CREATED),
        Err(AppError::Conflict(_)) => {
            tracing::debug!(activity_id = %envelope.id, "Duplicate inbox delivery");
            Ok(StatusCode::ACCEPTED)
        }
        Err(error) => Err(error),
    }
}

/// POST /:handle/outbox
///
/// Publishes a Note. The server assigns the note and activity IDs and the
/// publish time, wraps the note in a Create and records it.
async fn publish(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
    ApiKeyUser(key_owner): ApiKeyUser,
    body: Bytes,
) -> Result<Response, AppError> {
    if key_owner.id != user.id {
        return Err(AppError::Forbidden);
    }

    let submitted: Note = serde_json::from_slice(&body)?;
    if submitted.kind != NOTE {
        return Err(AppError::Unprocessable(format!(
            "expected a Note, got {}",
            submitted.kind
        )));
    }
    let has_context = submitted
        .context
        .as_ref()
        .is_some_and(|context| context.contains(ACTIVITY_STREAMS_CONTEXT));
    if !has_context {
        return Err(AppError::Unprocessable(
            "@context must include the ActivityStreams context".to_string(),
        ));
    }

    let actor_id = state.config.server.actor_id(&user.username);
    let note = Note::new(&actor_id, submitted.content, submitted.to, submitted.cc);
    let activity = Activity::create(&actor_id, note);
    let data = serde_json::to_string(&activity)?;

    state
        .activities
        .create_activity(
            &user.id,
            Mailbox::Outbox,
            ACTIVITY_STREAMS_CONTEXT,
            CREATE,
            &activity.id,
            &data,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        [(LOCATION, activity.id.clone())],
        ActivityJson(activity),
    )
        .into_response())
}

/// GET /:handle/outbox
///
/// Public Create activities, newest first.
async fn outbox(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
) -> Result<Response, AppError> {
    let records = state.db.list_public_outbox(&user.id).await?;
    let items = records
        .iter()
        .filter_map(|record| match serde_json::from_str::<serde_json::Value>(&record.data) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(id = %record.id, %error, "skipping unreadable outbox activity");
                None
            }
        })
        .collect();

    let id = format!("{}/outbox", state.config.server.actor_id(&user.username));
    Ok(ActivityJson(OrderedCollection::<serde_json::Value>::new(id, items)).into_response())
}

/// GET /:handle/followers
async fn followers(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
) -> Result<Response, AppError> {
    let followers = state.db.list_followers(&user.id).await?;
    let items = followers.into_iter().map(|follower| follower.actor_id).collect();

    let id = format!("{}/followers", state.config.server.actor_id(&user.username));
    Ok(ActivityJson(OrderedCollection::<String>::new(id, items)).into_response())
}

/// GET /:handle/following
///
/// Following remote actors is not supported, so this is always empty.
async fn following(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
) -> Result<Response, AppError> {
    let id = format!("{}/following", state.config.server.actor_id(&user.username));
    Ok(ActivityJson(OrderedCollection::<String>::new(id, Vec::new())).into_response())
}

/// GET /:handle/notes/:id
async fn note(
    State(state): State<AppState>,
    LocalUser(user): LocalUser,
    Path((_handle, note_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let record = state.db.get_note_by_id(&user.id, &note_id).await?;

    let note = Note {
        context: Some(Context::activity_streams()),
        kind: NOTE.to_string(),
        id: record.object_id,
        attributed_to: state.config.server.actor_id(&user.username),
        content: record.content,
        published: record.published.to_rfc3339_opts(SecondsFormat::Secs, true),
        to: record.to,
        cc: record.cc,
    };
    Ok(ActivityJson(note).into_response())
}
