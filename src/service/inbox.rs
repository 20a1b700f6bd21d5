//! Inbox side of activity recording

use sqlx::SqliteConnection;

use crate::data::ActivityRecord;
use crate::error::AppError;
use crate::federation::types::{FOLLOW, UNDO};
use crate::jobs::{JobArgs, JobQueue};

/// Schedule follow-up work for a freshly stored inbox activity
///
/// Follow and Undo get a `HandleInbox` job. Other types are kept without
/// further processing.
pub(super) async fn schedule_inbox_work(
    conn: &mut SqliteConnection,
    jobs: &JobQueue,
    record: &ActivityRecord,
) -> Result<(), AppError> {
    match record.activity_type.as_str() {
        FOLLOW | UNDO => {
            jobs.enqueue(
                conn,
                &JobArgs::HandleInbox {
                    user_id: record.user_id.clone(),
                    activity_id: record.activity_id.clone(),
                },
            )
            .await?;
        }
        other => {
            tracing::info!(
                activity_id = %record.activity_id,
                activity_type = other,
                "Stored inbox activity without handler"
            );
        }
    }
    Ok(())
}
