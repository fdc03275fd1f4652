use crate::coordinator::JobCoordinator;
use crate::session::SessionStats;
use crate::signaling::Role;
use crate::types::JobId;
use std::sync::Arc;
use tauri::{command, State};

/// Fulfiller: start streaming the camera for an accepted job
#[command]
pub async fn go_live(
    coordinator: State<'_, Arc<JobCoordinator>>,
    job_id: String,
) -> Result<SessionStats, String> {
    let id = JobId::parse(&job_id).map_err(|e| e.user_message())?;
    let session = coordinator
        .go_live(&id)
        .await
        .map_err(|e| e.user_message())?;
    Ok(session.stats())
}

/// Requester: watch the fulfiller's camera
#[command]
pub async fn watch_live(
    coordinator: State<'_, Arc<JobCoordinator>>,
    job_id: String,
) -> Result<SessionStats, String> {
    let id = JobId::parse(&job_id).map_err(|e| e.user_message())?;
    let session = coordinator
        .watch_live(&id)
        .await
        .map_err(|e| e.user_message())?;
    Ok(session.stats())
}

/// Tear down one side when its view is left
#[command]
pub async fn leave_live(
    coordinator: State<'_, Arc<JobCoordinator>>,
    job_id: String,
    role: Role,
) -> Result<(), String> {
    let id = JobId::parse(&job_id).map_err(|e| e.user_message())?;
    coordinator.leave_live(&id, role).await;
    Ok(())
}

#[command]
pub async fn get_session_stats(
    coordinator: State<'_, Arc<JobCoordinator>>,
    job_id: String,
    role: Role,
) -> Result<Option<SessionStats>, String> {
    let id = JobId::parse(&job_id).map_err(|e| e.user_message())?;
    Ok(coordinator.session_stats(&id, role).await)
}
