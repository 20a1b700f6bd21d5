//! Activity service
//!
//! Records inbound and authored activities.

use sqlx::SqliteConnection;

use super::{inbox, outbox};
use crate::data::{ActivityRecord, Database, Mailbox, NewActivity, store};
use crate::error::AppError;
use crate::jobs::JobQueue;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Records activities and schedules their side effects
#[derive(Debug, Clone)]
pub struct ActivityService {
    db: Database,
    jobs: JobQueue,
}

impl ActivityService {
    pub fn new(db: Database, jobs: JobQueue) -> Self {
        Self { db, jobs }
    }

    /// Store an activity and enqueue its follow-up jobs atomically
    ///
    /// # Arguments
    /// * `user_id` - Owner of the mailbox
    /// * `mailbox` - Inbox for received activities, outbox for authored ones
    /// * `context` - Primary `@context` IRI
    /// * `activity_type` - The activity's `type`
    /// * `activity_id` - Protocol-level activity ID
    /// * `data` - Raw JSON body, stored verbatim
    ///
    /// # Errors
    /// - `Conflict` if the activity ID was already recorded for this user
    /// - `InvalidActivityType`/`InvalidObjectType` for outbox activities
    ///   that are not `Create(Note)`
    ///
    /// Nothing is persisted when an error is returned.
    pub async fn create_activity(
        &self,
        user_id: &str,
        mailbox: Mailbox,
        context: &str,
        activity_type: &str,
        activity_id: &str,
        data: &str,
    ) -> Result<ActivityRecord, AppError> {
        let activity = NewActivity {
            user_id,
            mailbox,
            context,
            activity_type,
            activity_id,
            data,
        };

        let mut tx = self.db.begin().await?;
        match self.record(&mut tx, &activity).await {
            Ok(record) => {
                tx.commit().await?;
                if mailbox == Mailbox::Inbox {
                    ACTIVITYPUB_ACTIVITIES_RECEIVED
                        .with_label_values(&[activity_type])
                        .inc();
                }
                tracing::info!(
                    %mailbox,
                    activity_type,
                    activity_id,
                    "Recorded activity"
                );
                Ok(record)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::error!(
                        error = %rollback_error,
                        original = %error,
                        "Failed to roll back activity transaction"
                    );
                }
                Err(error)
            }
        }
    }

    async fn record(
        &self,
        conn: &mut SqliteConnection,
        activity: &NewActivity<'_>,
    ) -> Result<ActivityRecord, AppError> {
        let record = store::insert_activity(conn, activity).await?;
        match activity.mailbox {
            Mailbox::Inbox => inbox::schedule_inbox_work(conn, &self.jobs, &record).await?,
            Mailbox::Outbox => {
                outbox::publish_outbox_activity(conn, &self.jobs, &record).await?;
            }
        }
        Ok(record)
    }
}
