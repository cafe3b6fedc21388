use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::protocol::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Eight hex digit job token. Only unique among jobs currently held by one
/// broker; collisions are not checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(format!("{:08X}", rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub service: String,
    /// Param frame exactly as the client sent it
    #[serde(serialize_with = "lossy_utf8")]
    pub param: Bytes,
    /// Envelope address of the requesting client
    pub client_id: Identity,
    pub sync: bool,
    pub state: JobState,
    pub req_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_worker: Option<Identity>,
}

impl Job {
    pub fn new(service: impl Into<String>, param: Bytes, client_id: Identity, sync: bool) -> Self {
        Self::with_id(JobId::generate(), service, param, client_id, sync)
    }

    pub fn with_id(
        id: JobId,
        service: impl Into<String>,
        param: Bytes,
        client_id: Identity,
        sync: bool,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            param,
            client_id,
            sync,
            state: JobState::Queued,
            req_time: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_worker: None,
        }
    }

    /// Seconds between start and completion, if both are known.
    pub fn run_time_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds() as f64 / 1000.0)
    }
}

fn lossy_utf8<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_eight_hex_digits() {
        for _ in 0..32 {
            let id = JobId::generate();
            assert_eq!(id.as_str().len(), 8);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn job_serializes_for_admin_queries() {
        let job = Job::with_id(
            JobId::from("0000BEEF"),
            "ECHO",
            Bytes::from(r#"PARAM-JSON: {"x":1}"#),
            Identity::from("client-1"),
            true,
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], "0000BEEF");
        assert_eq!(value["service"], "ECHO");
        assert_eq!(value["param"], r#"PARAM-JSON: {"x":1}"#);
        assert_eq!(value["client_id"], "client-1");
        assert_eq!(value["state"], "queued");
        assert!(value["assigned_worker"].is_null());
    }
}
