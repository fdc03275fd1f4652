use crate::coordinator::{AcceptedJob, JobCoordinator};
use crate::types::{Job, ParticipantId};
use std::sync::Arc;
use tauri::{command, State};

/// Accept an open job as the given fulfiller
#[command]
pub async fn accept_job(
    coordinator: State<'_, Arc<JobCoordinator>>,
    job_id: String,
    fulfiller_id: String,
) -> Result<AcceptedJob, String> {
    log::info!("Accept requested for job {} by {}", job_id, fulfiller_id);

    let fulfiller = ParticipantId::new(fulfiller_id).map_err(|e| e.user_message())?;
    coordinator
        .accept_job(&job_id, &fulfiller)
        .await
        .map_err(|e| {
            log::warn!("Accept of job {} failed: {}", job_id, e);
            e.user_message()
        })
}

#[command]
pub async fn complete_job(
    coordinator: State<'_, Arc<JobCoordinator>>,
    job_id: String,
) -> Result<Job, String> {
    coordinator
        .complete_job(&job_id)
        .await
        .map_err(|e| e.user_message())
}
