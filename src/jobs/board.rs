//! Local job views kept fresh from the store's change feed.

use crate::errors::LinkError;
use crate::jobs::store::{JobChange, JobStore};
use crate::types::{Job, JobId, ParticipantId};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Newest-first list of jobs mirrored from storage
#[derive(Clone)]
pub struct JobBoard {
    store: Arc<dyn JobStore>,
    jobs: Arc<RwLock<Vec<Job>>>,
}

impl JobBoard {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            jobs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the local view with a full listing.
    pub async fn refresh(&self) -> Result<(), LinkError> {
        let listing = self.store.list_jobs().await?;
        log::debug!("Job board reloaded with {} jobs", listing.len());
        *self.jobs.write().await = listing;
        Ok(())
    }

    pub async fn apply(&self, change: JobChange) {
        let mut jobs = self.jobs.write().await;
        match change {
            JobChange::Inserted(job) => {
                if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
                    *existing = job;
                } else {
                    jobs.insert(0, job);
                }
            }
            JobChange::Updated(job) => {
                if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
                    *existing = job;
                }
            }
            JobChange::Deleted(id) => jobs.retain(|j| j.id != id),
        }
    }

    /// Load once, then follow the change feed until the store goes away.
    pub async fn spawn_sync(&self) -> Result<JoinHandle<()>, LinkError> {
        let mut feed = self.store.subscribe();
        self.refresh().await?;

        let board = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(change) => board.apply(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Job feed lagged by {} changes, reloading", skipped);
                        if let Err(e) = board.refresh().await {
                            log::error!("Failed to reload jobs: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    pub async fn all(&self) -> Vec<Job> {
        self.jobs.read().await.clone()
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.read().await.iter().find(|j| &j.id == id).cloned()
    }

    /// Jobs a fulfiller may still accept
    pub async fn open_jobs(&self) -> Vec<Job> {
        self.filtered(|j| j.is_open()).await
    }

    pub async fn jobs_for_requester(&self, requester: &ParticipantId) -> Vec<Job> {
        self.filtered(|j| &j.requester_id == requester).await
    }

    /// Jobs whose live camera the requester can watch right now
    pub async fn live_jobs_for_requester(&self, requester: &ParticipantId) -> Vec<Job> {
        self.filtered(|j| &j.requester_id == requester && j.is_live())
            .await
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|j| predicate(j))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryJobStore;
    use crate::types::{JobStatus, NewJob};
    use std::time::Duration;

    fn client() -> ParticipantId {
        ParticipantId::new("client-1").unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_insert_replaces() {
        let store = Arc::new(MemoryJobStore::new());
        let board = JobBoard::new(store.clone());
        let job = store
            .create_job(NewJob::new("t", "c", "c", "a"), client())
            .await
            .unwrap();

        board.apply(JobChange::Inserted(job.clone())).await;
        let mut renamed = job.clone();
        renamed.title = "renamed".to_string();
        board.apply(JobChange::Inserted(renamed)).await;

        let all = board.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "renamed");
    }

    #[tokio::test]
    async fn test_views_follow_feed() {
        let store = Arc::new(MemoryJobStore::new());
        let board = JobBoard::new(store.clone());
        let sync = board.spawn_sync().await.unwrap();

        let first = store
            .create_job(NewJob::new("first", "c", "c", "a"), client())
            .await
            .unwrap();
        let second = store
            .create_job(NewJob::new("second", "c", "c", "a"), client())
            .await
            .unwrap();
        store
            .update_job_status(
                &first.id,
                JobStatus::Accepted,
                JobStatus::Open,
                Some(ParticipantId::new("provider-1").unwrap()),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while board.open_jobs().await.len() != 1
                || board.live_jobs_for_requester(&client()).await.len() != 1
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("board did not converge");

        assert_eq!(board.open_jobs().await[0].id, second.id);
        assert_eq!(board.jobs_for_requester(&client()).await.len(), 2);
        assert_eq!(board.all().await[0].id, second.id);

        store.delete_job(&second.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while board.get(&second.id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("delete was not applied");

        sync.abort();
    }
}
