use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::wire::AnswerStatus;

/// Errors a job handler may return. Any error answers the job with FAIL.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid param: {0}")]
    InvalidParam(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Answer stream closed")]
    StreamClosed,
}

/// A job as handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub job_id: String,
    /// Decoded param; an empty object when the job carried none
    pub param: Value,
}

impl Assignment {
    /// Decode the param into a typed request.
    pub fn param_as<T: DeserializeOwned>(&self) -> Result<T, WorkError> {
        Ok(serde_json::from_value(self.param.clone())?)
    }

    /// A required field of the param object.
    pub fn field(&self, name: &str) -> Result<&Value, WorkError> {
        self.param
            .get(name)
            .ok_or_else(|| WorkError::InvalidParam(format!("missing field `{}`", name)))
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Complete(Option<Value>),
    Failed,
}

impl Answer {
    pub fn complete() -> Self {
        Answer::Complete(None)
    }

    pub fn with_payload(payload: impl Into<Value>) -> Self {
        Answer::Complete(Some(payload.into()))
    }

    pub fn status(&self) -> AnswerStatus {
        match self {
            Answer::Complete(_) => AnswerStatus::Complete,
            Answer::Failed => AnswerStatus::Fail,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Answer::Complete(payload) => payload.as_ref(),
            Answer::Failed => None,
        }
    }
}

impl From<bool> for Answer {
    fn from(ok: bool) -> Self {
        if ok {
            Answer::complete()
        } else {
            Answer::Failed
        }
    }
}

/// Booleans become a bare status, null completes without payload, and
/// anything else completes carrying the value.
impl From<Value> for Answer {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(ok) => Answer::from(ok),
            Value::Null => Answer::complete(),
            other => Answer::Complete(Some(other)),
        }
    }
}

/// Lets a handler stream intermediate CONT answers while it runs.
#[derive(Debug, Clone)]
pub struct Responder {
    job_id: String,
    tx: mpsc::UnboundedSender<Value>,
}

impl Responder {
    pub fn new(job_id: impl Into<String>, tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Queue a CONT answer. It reaches the broker before the final answer.
    pub fn cont(&self, payload: impl Into<Value>) -> Result<(), WorkError> {
        self.tx
            .send(payload.into())
            .map_err(|_| WorkError::StreamClosed)
    }
}

/// Application code run by a worker.
#[async_trait]
pub trait JobHandler: Send {
    async fn work(&mut self, job: &Assignment, responder: &Responder) -> Result<Answer, WorkError>;

    /// Runs once after the worker has been idle for a few heartbeats.
    async fn on_idle(&mut self) {}
}

/// Adapts a synchronous closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&Assignment, &Responder) -> Result<Answer, WorkError> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: FnMut(&Assignment, &Responder) -> Result<Answer, WorkError> + Send,
{
    async fn work(&mut self, job: &Assignment, responder: &Responder) -> Result<Answer, WorkError> {
        (self.0)(job, responder)
    }
}

/// Answers every job with its own param.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn work(
        &mut self,
        job: &Assignment,
        _responder: &Responder,
    ) -> Result<Answer, WorkError> {
        tracing::debug!(job_id = %job.job_id, "Echoing param");
        Ok(Answer::with_payload(job.param.clone()))
    }
}
