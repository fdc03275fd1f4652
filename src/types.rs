//! Core data types shared by the job lifecycle and the session layer.

use crate::errors::LinkError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque job identifier assigned by the storage collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job id received from a caller; anything that is not a UUID is
    /// rejected before touching storage.
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LinkError::InvalidId("job id is empty".to_string()));
        }
        Uuid::parse_str(trimmed)
            .map(JobId)
            .map_err(|_| LinkError::InvalidId(format!("'{}' is not a valid job id", raw)))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for JobId {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::parse(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Open,
    /// Older clients wrote `camera_ready` for the same transition.
    #[serde(alias = "camera_ready")]
    Accepted,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Open => "open",
            JobStatus::Accepted => "accepted",
            JobStatus::Completed => "completed",
        }
    }

    /// The single status that may follow this one.
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Open => Some(JobStatus::Accepted),
            JobStatus::Accepted => Some(JobStatus::Completed),
            JobStatus::Completed => None,
        }
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        self.next() == Some(target)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(JobStatus::Open),
            "accepted" | "camera_ready" => Ok(JobStatus::Accepted),
            "completed" => Ok(JobStatus::Completed),
            other => Err(LinkError::InvalidJob(format!("unknown status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Requester,
    Fulfiller,
}

impl ParticipantKind {
    fn prefix(&self) -> &'static str {
        match self {
            ParticipantKind::Requester => "client",
            ParticipantKind::Fulfiller => "provider",
        }
    }
}

/// Identity of a requester or fulfiller. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self, LinkError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(LinkError::InvalidId("participant id is empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Generate a local demo identity, e.g. `provider-1700000000000-3f9a1c2b7d`.
    pub fn generate(kind: ParticipantKind) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}",
            kind.prefix(),
            Utc::now().timestamp_millis(),
            &suffix[..10]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work that needs someone physically present to verify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub requester_id: ParticipantId,
    pub fulfiller_id: Option<ParticipantId>,
    /// Reference into blob storage; opaque to the core
    pub media_ref: Option<String>,
    pub title: String,
    pub country: String,
    pub city: String,
    pub address: String,
    pub gps: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
    pub budget: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_open(&self) -> bool {
        self.status == JobStatus::Open
    }

    pub fn is_live(&self) -> bool {
        self.status == JobStatus::Accepted
    }
}

/// Creation payload for a job, as filled in by the requester
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub country: String,
    pub city: String,
    pub address: String,
    pub gps: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
    pub budget: Option<String>,
    pub media_ref: Option<String>,
}

impl NewJob {
    pub fn new(
        title: impl Into<String>,
        country: impl Into<String>,
        city: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            country: country.into(),
            city: city.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_media(mut self, media_ref: impl Into<String>) -> Self {
        self.media_ref = Some(media_ref.into());
        self
    }

    pub fn with_budget(mut self, budget: impl Into<String>) -> Self {
        self.budget = Some(budget.into());
        self
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        let required = [
            ("title", &self.title),
            ("country", &self.country),
            ("city", &self.city),
            ("address", &self.address),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(LinkError::InvalidJob(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    /// Materialize into an open job owned by `requester`.
    pub fn into_job(self, id: JobId, requester: ParticipantId) -> Job {
        let now = Utc::now();
        Job {
            id,
            status: JobStatus::Open,
            requester_id: requester,
            fulfiller_id: None,
            media_ref: self.media_ref,
            title: self.title,
            country: self.country,
            city: self.city,
            address: self.address,
            gps: self.gps,
            date: self.date,
            time: self.time,
            duration: self.duration,
            budget: self.budget,
            created_at: now,
            updated_at: now,
        }
    }
}
