//! Wire vocabulary shared by the broker, workers and clients.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, ZmwsError};
use crate::protocol::Message;

/// Protocol tag carried by client requests and job dispatches.
pub const CLIENT_PROTOCOL: &str = "MDPC02";
/// Message type of a request (client → broker, broker → worker).
pub const REQUEST: u8 = 0x01;
/// Message type of a reply pushed to a synchronous client.
pub const REPLY: u8 = 0x03;

pub const HEARTBEAT: &str = "HEARTBEAT";
pub const READY: &str = "READY";
pub const JOB_PREFIX: &str = "JOB: ";
pub const SYNC_PREFIX: &str = "SYNC-";
pub const FAIL_PREFIX: &str = "FAIL: ";
pub const PARAM_JSON: &str = "PARAM-JSON";

/// Whether `frame` is the request type byte. Dynamically typed clients
/// send the ASCII digit instead of the raw byte; both are accepted.
pub fn is_request_type(frame: &[u8]) -> bool {
    frame == [REQUEST] || frame == b"1"
}

pub fn is_reply_type(frame: &[u8]) -> bool {
    frame == [REPLY] || frame == b"3"
}

/// Status prefix of a worker answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnswerStatus {
    Complete,
    Fail,
    /// Intermediate, non-terminal streaming answer
    Cont,
}

impl AnswerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerStatus::Complete => "COMPLETE",
            AnswerStatus::Fail => "FAIL",
            AnswerStatus::Cont => "CONT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnswerStatus::Cont)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.trim().to_ascii_uppercase().as_str() {
            "COMPLETE" => Some(AnswerStatus::Complete),
            "FAIL" => Some(AnswerStatus::Fail),
            "CONT" => Some(AnswerStatus::Cont),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnswerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a worker → broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBody {
    Heartbeat,
    Ready,
    Answer { status: AnswerStatus, job_id: String },
    Unknown,
}

impl WorkerBody {
    pub fn parse(body: &str) -> Self {
        if body == HEARTBEAT {
            return WorkerBody::Heartbeat;
        }
        if body.starts_with(READY) {
            return WorkerBody::Ready;
        }
        if let Some((prefix, job_id)) = body.split_once(':') {
            if let Some(status) = AnswerStatus::from_prefix(prefix) {
                return WorkerBody::Answer {
                    status,
                    job_id: job_id.trim().to_string(),
                };
            }
        }
        WorkerBody::Unknown
    }
}

/// `"<STATUS>: <job id>"`, the body a worker answers with.
pub fn answer_body(status: AnswerStatus, job_id: &str) -> String {
    format!("{}: {}", status, job_id)
}

/// `"<STATUS>: <service> [<job id>]"`, the status line pushed to clients.
pub fn status_line(status: AnswerStatus, service: &str, job_id: &str) -> String {
    format!("{}: {} [{}]", status, service, job_id)
}

/// Inverse of [`status_line`].
pub fn parse_status_line(line: &str) -> Option<(AnswerStatus, String, String)> {
    let (prefix, rest) = line.split_once(':')?;
    let status = AnswerStatus::from_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    let service = parts.next()?.to_string();
    let job_id = parts
        .next()
        .map(|id| id.trim_start_matches('[').trim_end_matches(']').to_string())
        .unwrap_or_default();
    Some((status, service, job_id))
}

/// Reserved job names answered directly from broker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminQuery {
    /// Pending jobs
    Jobs,
    /// Jobs in flight
    Active,
    /// Recently finished jobs
    History,
    /// Registered workers
    Workers,
}

impl AdminQuery {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "SERVER-JOBS" => Some(AdminQuery::Jobs),
            "SERVER-ACTIVE" => Some(AdminQuery::Active),
            "SERVER-HIST" => Some(AdminQuery::History),
            "SERVER-WORKERS" => Some(AdminQuery::Workers),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdminQuery::Jobs => "SERVER-JOBS",
            AdminQuery::Active => "SERVER-ACTIVE",
            AdminQuery::History => "SERVER-HIST",
            AdminQuery::Workers => "SERVER-WORKERS",
        }
    }
}

/// Drop a leading `JOB: ` marker.
pub fn strip_job_prefix(body: &str) -> &str {
    body.strip_prefix(JOB_PREFIX).unwrap_or(body)
}

/// A client's job name: `JOB: [SYNC-]<service>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobName {
    pub service: String,
    pub sync: bool,
}

impl JobName {
    pub fn parse(body: &str) -> Self {
        let name = strip_job_prefix(body).trim();
        match name.strip_prefix(SYNC_PREFIX) {
            Some(service) => Self {
                service: service.to_string(),
                sync: true,
            },
            None => Self {
                service: name.to_string(),
                sync: false,
            },
        }
    }

    /// The body a client sends for this job.
    pub fn to_body(&self) -> String {
        if self.sync {
            format!("{}{}{}", JOB_PREFIX, SYNC_PREFIX, self.service)
        } else {
            format!("{}{}", JOB_PREFIX, self.service)
        }
    }
}

/// Decode a tagged param frame. Untagged or empty frames yield an empty
/// object; only JSON payloads are understood.
pub fn decode_param(frame: &[u8]) -> Value {
    let empty = || Value::Object(Map::new());

    let Ok(text) = std::str::from_utf8(frame) else {
        tracing::warn!(len = frame.len(), "Param frame is not UTF-8, ignoring");
        return empty();
    };
    let Some((tag, payload)) = text.split_once(": ") else {
        return empty();
    };
    if !tag.starts_with("PARAM") {
        return empty();
    }
    if !tag.contains("JSON") {
        tracing::warn!(tag, "Unsupported param encoding, using empty param");
        return empty();
    }
    match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed JSON param, using empty param");
            empty()
        }
    }
}

/// `"PARAM-JSON: <json>"`.
pub fn encode_param(value: &Value) -> Bytes {
    Bytes::from(format!("{}: {}", PARAM_JSON, value))
}

/// A reply as seen by a client after its envelope has been removed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientReply {
    /// Asynchronous job accepted and queued
    Accepted { job_id: String, service: String },
    /// Request refused outright (unknown service or protocol violation)
    Rejected { job: String },
    /// Intermediate or terminal answer for a synchronous job
    Answer {
        status: AnswerStatus,
        service: String,
        job_id: String,
        payload: Option<Value>,
    },
    /// Administrative query result
    Data(Value),
}

impl ClientReply {
    pub fn parse(mut msg: Message) -> Result<Self> {
        msg.strip_delimiter();

        let is_answer = msg.frame_count() >= 4
            && msg.get(1).is_some_and(|f| is_reply_type(f))
            && msg.get(2).is_some_and(|f| &f[..] == CLIENT_PROTOCOL.as_bytes());
        if is_answer {
            let line = msg
                .get(3)
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            let (status, service, job_id) = parse_status_line(&line)
                .ok_or_else(|| ZmwsError::UnexpectedReply(line.clone()))?;
            let payload = msg
                .get(4)
                .filter(|f| !f.is_empty())
                .map(|f| decode_param(f));
            return Ok(ClientReply::Answer {
                status,
                service,
                job_id,
                payload,
            });
        }

        let body = msg.body_str().into_owned();
        if let Some(rest) = body.strip_prefix(JOB_PREFIX) {
            let mut parts = rest.split_whitespace();
            let job_id = parts.next().unwrap_or_default().to_string();
            let service = parts.next().unwrap_or_default().to_string();
            return Ok(ClientReply::Accepted { job_id, service });
        }
        if let Some(job) = body.strip_prefix(FAIL_PREFIX) {
            return Ok(ClientReply::Rejected {
                job: job.to_string(),
            });
        }
        serde_json::from_str(&body)
            .map(ClientReply::Data)
            .map_err(|_| ZmwsError::UnexpectedReply(body))
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ClientReply::Answer { status, .. } => status.is_terminal(),
            _ => true,
        }
    }
}
