//! Federation job handlers
//!
//! Each handler turns lower-level errors into [`JobError`] at the point it
//! calls them: missing records and malformed input cancel, network and
//! database trouble retries.

use super::{JobArgs, JobError, JobRunner};
use crate::config::ServerConfig;
use crate::data::Database;
use crate::error::AppError;
use crate::federation::types::{ACCEPT, Activity, ActivityEnvelope, FOLLOW, TypedActivity};
use crate::federation::{ActivityDelivery, ActorFetcher, DeliveryOutcome, actor_key_id};
use crate::identity::IdentityService;

/// Runs inbox side effects and outbox fan-out
#[derive(Clone)]
pub struct FederationJobRunner {
    db: Database,
    identity: IdentityService,
    fetcher: ActorFetcher,
    delivery: ActivityDelivery,
    server: ServerConfig,
}

impl JobRunner for FederationJobRunner {
    async fn run(&self, args: JobArgs) -> Result<(), JobError> {
        match args {
            JobArgs::HandleInbox {
                user_id,
                activity_id,
            } => self.handle_inbox(&user_id, &activity_id).await,
            JobArgs::HandleOutboxDelivery {
                user_id,
                activity_id,
                follower_actor_id,
            } => {
                self.handle_outbox_delivery(&user_id, &activity_id, &follower_actor_id)
                    .await
            }
        }
    }
}

/// Missing rows are permanent, anything else about storage is transient
fn lookup_failure(error: AppError) -> JobError {
    match error {
        AppError::ActivityNotFound
        | AppError::UserNotFound
        | AppError::SigningKeyNotFound
        | AppError::NotFound => JobError::cancel(error),
        other => JobError::retry(other),
    }
}

/// Only network and remote-side failures can succeed on a later attempt;
/// a URL refused by the remote URL check is refused every time
fn fetch_failure(error: AppError) -> JobError {
    match error {
        AppError::HttpClient(_) | AppError::Federation(_) => JobError::retry(error),
        other => JobError::cancel(other),
    }
}

/// Map a delivery attempt onto the job outcome
fn delivery_result(result: Result<DeliveryOutcome, AppError>) -> Result<(), JobError> {
    match result {
        Ok(DeliveryOutcome::Delivered(_)) => Ok(()),
        Ok(DeliveryOutcome::Transient(status)) => {
            Err(JobError::retry(format!("inbox answered {status}")))
        }
        Ok(DeliveryOutcome::Rejected(status)) => {
            Err(JobError::cancel(format!("inbox rejected delivery with {status}")))
        }
        Err(error @ (AppError::HttpClient(_) | AppError::Federation(_))) => {
            Err(JobError::retry(error))
        }
        Err(error) => Err(JobError::cancel(error)),
    }
}

impl FederationJobRunner {
    pub fn new(
        db: Database,
        identity: IdentityService,
        fetcher: ActorFetcher,
        delivery: ActivityDelivery,
        server: ServerConfig,
    ) -> Self {
        Self {
            db,
            identity,
            fetcher,
            delivery,
            server,
        }
    }

    /// Act on a Follow or Undo stored in `user_id`'s inbox
    async fn handle_inbox(&self, user_id: &str, activity_id: &str) -> Result<(), JobError> {
        let record = self
            .db
            .get_activity_by_id(user_id, activity_id)
            .await
            .map_err(lookup_failure)?;

        let envelope = ActivityEnvelope::from_slice(record.data.as_bytes())
            .map_err(|e| JobError::cancel(format!("stored activity is not decodable: {e}")))?;

        match envelope.decode().map_err(JobError::cancel)? {
            TypedActivity::Follow => self.follow(user_id, &envelope).await,
            TypedActivity::Undo(inner) => self.undo(user_id, &envelope, &inner).await,
            TypedActivity::Create(_) | TypedActivity::Other(_) => Err(JobError::cancel(format!(
                "no inbox handler for {}",
                envelope.kind
            ))),
        }
    }

    async fn follow(&self, user_id: &str, follow: &ActivityEnvelope) -> Result<(), JobError> {
        let actor_id = follow
            .actor_id()
            .ok_or_else(|| JobError::cancel("Follow has no actor"))?;

        self.db
            .create_follower(user_id, actor_id, &follow.id)
            .await
            .map_err(JobError::retry)?;
        tracing::info!(user_id, follower = actor_id, "Follower added");

        self.accept(user_id, &follow.id, actor_id).await
    }

    async fn undo(
        &self,
        user_id: &str,
        undo: &ActivityEnvelope,
        inner: &ActivityEnvelope,
    ) -> Result<(), JobError> {
        if inner.kind != FOLLOW {
            return Err(JobError::cancel(format!("cannot undo a {}", inner.kind)));
        }
        let actor_id = undo
            .actor_id()
            .ok_or_else(|| JobError::cancel("Undo has no actor"))?;
        if inner.actor_id() != Some(actor_id) {
            tracing::warn!(
                user_id,
                undo_actor = actor_id,
                follow_actor = ?inner.actor_id(),
                "Undo actor does not own the Follow"
            );
            return Err(JobError::cancel("Undo actor does not match Follow actor"));
        }

        let removed = self
            .db
            .delete_follower(user_id, actor_id)
            .await
            .map_err(JobError::retry)?;
        tracing::info!(user_id, follower = actor_id, removed, "Follower removed");

        self.accept(user_id, &undo.id, actor_id).await
    }

    /// Sign and send an Accept for `object_id` to `remote_actor_id`'s inbox
    async fn accept(
        &self,
        user_id: &str,
        object_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), JobError> {
        let user = self
            .identity
            .get_user_by_id(user_id)
            .await
            .map_err(lookup_failure)?;
        let key = self
            .identity
            .get_private_key(user_id)
            .await
            .map_err(lookup_failure)?;

        let remote = self
            .fetcher
            .fetch_actor(remote_actor_id)
            .await
            .map_err(fetch_failure)?;
        let inbox = remote
            .inbox_url()
            .ok_or_else(|| JobError::cancel(format!("{remote_actor_id} has no inbox")))?;

        let local_actor_id = self.server.actor_id(&user.username);
        let accept = Activity::<String>::accept(&local_actor_id, object_id, remote_actor_id);
        let body = serde_json::to_vec(&accept).map_err(JobError::cancel)?;

        delivery_result(
            self.delivery
                .deliver(inbox, &actor_key_id(&local_actor_id), &key.pem, ACCEPT, body)
                .await,
        )
    }

    /// Post one stored outbox activity to one follower's inbox
    async fn handle_outbox_delivery(
        &self,
        user_id: &str,
        activity_id: &str,
        follower_actor_id: &str,
    ) -> Result<(), JobError> {
        let record = self
            .db
            .get_activity_by_id(user_id, activity_id)
            .await
            .map_err(lookup_failure)?;
        let user = self
            .identity
            .get_user_by_id(user_id)
            .await
            .map_err(lookup_failure)?;
        let key = self
            .identity
            .get_private_key(user_id)
            .await
            .map_err(lookup_failure)?;

        let follower = self
            .fetcher
            .fetch_actor(follower_actor_id)
            .await
            .map_err(fetch_failure)?;
        let inbox = follower
            .inbox_url()
            .ok_or_else(|| JobError::cancel(format!("{follower_actor_id} has no inbox")))?;

        let local_actor_id = self.server.actor_id(&user.username);
        delivery_result(
            self.delivery
                .deliver(
                    inbox,
                    &actor_key_id(&local_actor_id),
                    &key.pem,
                    &record.activity_type,
                    record.data.into_bytes(),
                )
                .await,
        )
    }
}
