//! Job lifecycle transitions driven by requester and fulfiller actions.
//!
//! Every transition is a conditional update against the store, so two
//! fulfillers racing to accept the same job cannot both win: the loser sees
//! `LinkError::Conflict`, whether it lost the compare-and-swap or read the
//! job after the winner committed. `AlreadyAccepted` is reserved for a job
//! that left `Open` some other way (completed, or already bound to the
//! caller). Observers learn about the new state through the
//! store's change feed.

use crate::errors::LinkError;
use crate::jobs::store::JobStore;
use crate::types::{Job, JobId, JobStatus, ParticipantId};
use std::sync::Arc;

#[derive(Clone)]
pub struct JobStateMachine {
    store: Arc<dyn JobStore>,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Open -> Accepted, binding `fulfiller`.
    pub async fn accept(&self, job_id: &str, fulfiller: &ParticipantId) -> Result<Job, LinkError> {
        let id = JobId::parse(job_id)?;
        let current = self.store.get_job(&id).await?;

        match (&current.status, &current.fulfiller_id) {
            (JobStatus::Open, _) => {}
            // Someone else already won this job.
            (JobStatus::Accepted, Some(bound)) if bound != fulfiller => {
                log::info!("Fulfiller {} lost the accept race for job {}", fulfiller, id);
                return Err(LinkError::Conflict(format!(
                    "job {} was accepted by another fulfiller",
                    id
                )));
            }
            (status, _) => {
                log::info!(
                    "Fulfiller {} cannot accept job {}: status is {}",
                    fulfiller,
                    id,
                    status
                );
                return Err(LinkError::AlreadyAccepted(format!("job {} is {}", id, status)));
            }
        }

        let job = self
            .store
            .update_job_status(
                &id,
                JobStatus::Accepted,
                JobStatus::Open,
                Some(fulfiller.clone()),
            )
            .await
            .map_err(|e| {
                if matches!(e, LinkError::Conflict(_)) {
                    log::info!("Fulfiller {} lost the accept race for job {}", fulfiller, id);
                }
                e
            })?;

        log::info!("Job {} accepted by {}", id, fulfiller);
        Ok(job)
    }

    /// Accepted -> Completed.
    pub async fn complete(&self, job_id: &str) -> Result<Job, LinkError> {
        let id = JobId::parse(job_id)?;
        let current = self.store.get_job(&id).await?;

        if !current.status.can_transition_to(JobStatus::Completed) {
            return Err(LinkError::InvalidTransition {
                from: current.status,
                to: JobStatus::Completed,
            });
        }

        let job = self
            .store
            .update_job_status(&id, JobStatus::Completed, JobStatus::Accepted, None)
            .await
            .map_err(|e| match e {
                LinkError::Conflict(_) => LinkError::InvalidTransition {
                    from: current.status,
                    to: JobStatus::Completed,
                },
                other => other,
            })?;

        log::info!("Job {} completed", id);
        Ok(job)
    }
}
