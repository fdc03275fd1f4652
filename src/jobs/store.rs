//! Storage collaborator interface and an in-process implementation.

use crate::errors::LinkError;
use crate::types::{Job, JobId, JobStatus, NewJob, ParticipantId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Change notification for a stored job
#[derive(Debug, Clone, PartialEq)]
pub enum JobChange {
    Inserted(Job),
    Updated(Job),
    Deleted(JobId),
}

impl JobChange {
    pub fn job_id(&self) -> JobId {
        match self {
            JobChange::Inserted(job) | JobChange::Updated(job) => job.id,
            JobChange::Deleted(id) => *id,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs, newest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, LinkError>;

    async fn get_job(&self, id: &JobId) -> Result<Job, LinkError>;

    async fn create_job(&self, fields: NewJob, requester: ParticipantId) -> Result<Job, LinkError>;

    /// Conditional update: succeeds only while the stored status still equals
    /// `expected`, otherwise fails with `Conflict`.
    async fn update_job_status(
        &self,
        id: &JobId,
        new_status: JobStatus,
        expected: JobStatus,
        fulfiller: Option<ParticipantId>,
    ) -> Result<Job, LinkError>;

    async fn delete_job(&self, id: &JobId) -> Result<(), LinkError>;

    fn subscribe(&self) -> broadcast::Receiver<JobChange>;
}

/// In-memory job table with a change feed
#[derive(Clone)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    changes: broadcast::Sender<JobChange>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    fn notify(&self, change: JobChange) {
        // No receivers is fine; views subscribe lazily.
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>, LinkError> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, LinkError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LinkError::NotFound(format!("job {}", id)))
    }

    async fn create_job(&self, fields: NewJob, requester: ParticipantId) -> Result<Job, LinkError> {
        fields.validate()?;
        let job = fields.into_job(JobId::new(), requester);

        self.jobs.write().await.insert(job.id, job.clone());
        log::info!("Created job {} ({})", job.id, job.title);
        self.notify(JobChange::Inserted(job.clone()));
        Ok(job)
    }

    async fn update_job_status(
        &self,
        id: &JobId,
        new_status: JobStatus,
        expected: JobStatus,
        fulfiller: Option<ParticipantId>,
    ) -> Result<Job, LinkError> {
        let updated = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| LinkError::NotFound(format!("job {}", id)))?;

            if job.status != expected {
                return Err(LinkError::Conflict(format!(
                    "job {} is {} (expected {})",
                    id, job.status, expected
                )));
            }

            job.status = new_status;
            if let Some(fulfiller) = fulfiller {
                job.fulfiller_id = Some(fulfiller);
            }
            job.updated_at = Utc::now();
            job.clone()
        };

        log::debug!("Job {} moved {} -> {}", id, expected, new_status);
        self.notify(JobChange::Updated(updated.clone()));
        Ok(updated)
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), LinkError> {
        let removed = self.jobs.write().await.remove(id);
        match removed {
            Some(_) => {
                self.notify(JobChange::Deleted(*id));
                Ok(())
            }
            None => Err(LinkError::NotFound(format!("job {}", id))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester() -> ParticipantId {
        ParticipantId::new("client-1").unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_incomplete_job() {
        let store = MemoryJobStore::new();
        let result = store.create_job(NewJob::new("t", "", "c", "a"), requester()).await;
        assert!(matches!(result, Err(LinkError::InvalidJob(_))));
        assert!(store.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = MemoryJobStore::new();
        let job = store
            .create_job(NewJob::new("t", "c", "c", "a"), requester())
            .await
            .unwrap();

        let stale = store
            .update_job_status(&job.id, JobStatus::Completed, JobStatus::Accepted, None)
            .await;
        assert!(matches!(stale, Err(LinkError::Conflict(_))));

        let fulfiller = ParticipantId::new("provider-1").unwrap();
        let updated = store
            .update_job_status(
                &job.id,
                JobStatus::Accepted,
                JobStatus::Open,
                Some(fulfiller.clone()),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Accepted);
        assert_eq!(updated.fulfiller_id, Some(fulfiller));
    }

    #[tokio::test]
    async fn test_change_feed() {
        let store = MemoryJobStore::new();
        let mut feed = store.subscribe();
        let job = store
            .create_job(NewJob::new("t", "c", "c", "a"), requester())
            .await
            .unwrap();
        store.delete_job(&job.id).await.unwrap();

        assert_eq!(feed.recv().await.unwrap(), JobChange::Inserted(job.clone()));
        assert_eq!(feed.recv().await.unwrap(), JobChange::Deleted(job.id));
        assert!(matches!(
            store.delete_job(&job.id).await,
            Err(LinkError::NotFound(_))
        ));
    }
}
