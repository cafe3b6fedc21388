use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::BrokerConfig;
use crate::protocol::wire::{
    self, AdminQuery, AnswerStatus, JobName, WorkerBody, CLIENT_PROTOCOL, HEARTBEAT, JOB_PREFIX,
    REPLY, REQUEST,
};
use crate::protocol::{Identity, Message};
use crate::scheduler::{Job, JobId, JobState, JobStore, WorkerRegistry};

/// Socket an outbound message leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Client-facing ROUTER
    Frontend,
    /// Worker-facing ROUTER
    Backend,
    /// PUB socket announcing finished jobs
    News,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub route: Route,
    pub message: Message,
}

/// Broker state and message handling, without any sockets.
///
/// Handlers consume decoded messages and queue their replies in an outbox
/// that the server drains after every poll. All queue and registry
/// mutation happens here, on the single task that owns the dispatcher.
#[derive(Debug)]
pub struct Dispatcher {
    jobs: JobStore,
    workers: WorkerRegistry,
    heartbeat_interval: Duration,
    next_heartbeat: Instant,
    outbox: Vec<Outbound>,
}

impl Dispatcher {
    pub fn new(config: &BrokerConfig, now: Instant) -> Self {
        Self {
            jobs: JobStore::with_history_limit(config.history_limit),
            workers: WorkerRegistry::new(config.heartbeat.expiry()),
            heartbeat_interval: config.heartbeat.interval,
            next_heartbeat: now + config.heartbeat.interval,
            outbox: Vec::new(),
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Take every message queued since the last drain, in emission order.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn emit(&mut self, route: Route, message: Message) {
        self.outbox.push(Outbound { route, message });
    }

    /// Periodic work after each poll: heartbeat idle workers when the tick
    /// is due, purge expired workers, then hand queued jobs to idle ones.
    pub fn tick(&mut self, now: Instant) {
        if now >= self.next_heartbeat {
            self.send_heartbeats();
            self.next_heartbeat = now + self.heartbeat_interval;
        }
        self.purge_stale_workers(now);
        self.start_jobs();
    }

    pub fn send_heartbeats(&mut self) {
        let idle: Vec<Identity> = self.workers.idle().map(|w| w.identity.clone()).collect();
        for identity in idle {
            tracing::debug!(worker = %identity, "Sending heartbeat");
            self.emit(
                Route::Backend,
                Message::from_frames([
                    identity.to_bytes(),
                    Bytes::from_static(HEARTBEAT.as_bytes()),
                ]),
            );
        }
    }

    /// Drop workers whose deadline has passed. A job held by a purged
    /// worker goes back to the head of the queue. Returns the number of
    /// workers purged.
    pub fn purge_stale_workers(&mut self, now: Instant) -> usize {
        let purged = self.workers.purge_stale(now);
        for worker in &purged {
            tracing::info!(
                worker = %worker.identity,
                service = %worker.service,
                "Purging expired worker"
            );
            if let Some(job_id) = self.jobs.active_for_worker(&worker.identity) {
                self.jobs.demote(&job_id);
                tracing::warn!(
                    job_id = %job_id,
                    worker = %worker.identity,
                    "Requeued job held by purged worker"
                );
            }
        }
        purged.len()
    }

    /// First idle worker registered for `service`.
    pub fn select_worker(&self, service: &str) -> Option<Identity> {
        self.workers.select(service)
    }

    /// Dispatch queued jobs, in FIFO order, to idle workers of their
    /// service. Jobs without an idle worker stay queued without blocking
    /// those behind them. Returns the number of jobs started.
    pub fn start_jobs(&mut self) -> usize {
        let mut plan = Vec::new();
        for job in self.jobs.pending() {
            if let Some(worker) = self.workers.select(&job.service) {
                self.workers.mark_busy(&worker);
                plan.push((job.id.clone(), worker));
            }
        }

        let started = plan.len();
        for (job_id, worker) in plan {
            let message = match self.jobs.start(&job_id, worker.clone()) {
                Some(job) => dispatch_message(&worker, job),
                None => {
                    self.workers.release(&worker);
                    continue;
                }
            };
            tracing::info!(
                job_id = %job_id,
                worker = %worker,
                left = self.jobs.pending_len(),
                "Starting job"
            );
            self.emit(Route::Backend, message);
        }
        started
    }

    /// Handle a message that arrived on the worker-facing socket.
    pub fn handle_back(&mut self, mut msg: Message, now: Instant) {
        let identity = match msg.pop_front() {
            Ok(frame) => Identity::from(frame),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping worker message without envelope");
                return;
            }
        };
        msg.strip_delimiter();
        tracing::debug!(worker = %identity, message = %msg, "Backend in");

        match WorkerBody::parse(&msg.body_str()) {
            WorkerBody::Heartbeat => {
                if !self.workers.refresh(&identity, now) {
                    tracing::debug!(worker = %identity, "Heartbeat from unknown worker");
                }
            }
            WorkerBody::Ready => {
                if msg.frame_count() < 2 {
                    tracing::warn!(worker = %identity, "READY without service name");
                    return;
                }
                let service = msg
                    .get(0)
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .unwrap_or_default();
                self.register_worker(identity, &service, now);
            }
            WorkerBody::Answer { status, job_id } => {
                self.handle_answer(identity, &msg, status, JobId::from(job_id), now);
            }
            WorkerBody::Unknown => {
                tracing::warn!(worker = %identity, message = %msg, "Unrecognized worker message");
            }
        }
    }

    fn register_worker(&mut self, identity: Identity, service: &str, now: Instant) {
        if let Some(job_id) = self.jobs.active_for_worker(&identity) {
            tracing::warn!(
                job_id = %job_id,
                worker = %identity,
                "Worker re-registered while holding a job, requeueing it"
            );
            self.jobs.demote(&job_id);
        }
        tracing::info!(worker = %identity, service, "Worker ready");
        self.workers.register(identity, service, now);
    }

    fn handle_answer(
        &mut self,
        identity: Identity,
        msg: &Message,
        status: AnswerStatus,
        job_id: JobId,
        now: Instant,
    ) {
        if !self.workers.refresh(&identity, now) {
            tracing::warn!(
                job_id = %job_id,
                worker = %identity,
                "Ignoring answer from unknown worker"
            );
            return;
        }

        let owner = self
            .jobs
            .get_active(&job_id)
            .map(|job| job.assigned_worker.as_ref() == Some(&identity));
        if owner != Some(true) {
            tracing::warn!(
                job_id = %job_id,
                worker = %identity,
                %status,
                "Ignoring answer for a job the worker does not hold"
            );
            if self.jobs.active_for_worker(&identity).is_none() {
                self.workers.release(&identity);
            }
            return;
        }

        // [service, payload?, body]
        let payload = if msg.frame_count() >= 3 {
            msg.get(msg.frame_count() - 2).filter(|p| !p.is_empty()).cloned()
        } else {
            None
        };

        if !status.is_terminal() {
            let reply = self
                .jobs
                .get_active(&job_id)
                .filter(|job| job.sync)
                .map(|job| client_answer(job, status, payload));
            tracing::debug!(job_id = %job_id, worker = %identity, "Intermediate answer");
            if let Some(reply) = reply {
                self.emit(Route::Frontend, reply);
            }
            return;
        }

        let state = match status {
            AnswerStatus::Complete => JobState::Completed,
            _ => JobState::Failed,
        };
        self.workers.release(&identity);
        let Some(job) = self.jobs.finish(&job_id, state) else {
            return;
        };

        let took = job.run_time_secs().unwrap_or_default();
        match state {
            JobState::Completed => {
                tracing::info!(job_id = %job_id, worker = %identity, took, "Job complete")
            }
            _ => tracing::info!(job_id = %job_id, worker = %identity, took, "Job failed"),
        }

        let news = news_message(job, status);
        let reply = job.sync.then(|| client_answer(job, status, payload));
        if let Some(reply) = reply {
            self.emit(Route::Frontend, reply);
        }
        self.emit(Route::News, news);
    }

    /// Handle a message that arrived on the client-facing socket.
    pub fn handle_front(&mut self, mut msg: Message) {
        let client = match msg.pop_front() {
            Ok(frame) => Identity::from(frame),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping client message without envelope");
                return;
            }
        };
        msg.strip_delimiter();
        tracing::debug!(client = %client, message = %msg, "Frontend in");

        let body = msg.body_str().into_owned();
        if let Some(query) = AdminQuery::parse(wire::strip_job_prefix(&body)) {
            self.answer_query(client, query);
            return;
        }

        let name = JobName::parse(&body);

        // [tag, type, param, job]
        let well_formed = msg.frame_count() == 4
            && msg.get(0).is_some_and(|f| &f[..] == CLIENT_PROTOCOL.as_bytes())
            && msg.get(1).is_some_and(|f| wire::is_request_type(f));
        if !well_formed {
            tracing::warn!(client = %client, message = %msg, "Protocol violation from client");
            self.reject(client, &name.service);
            return;
        }

        if !self.workers.has_seen(&name.service) {
            tracing::warn!(client = %client, service = %name.service, "No service for job");
            self.reject(client, &name.service);
            return;
        }

        let param = msg.get(2).cloned().unwrap_or_default();
        let job = Job::new(name.service.clone(), param, client.clone(), name.sync);
        let job_id = job.id.clone();
        self.jobs.enqueue(job);
        tracing::info!(job_id = %job_id, service = %name.service, sync = name.sync, "Queued job");

        if !name.sync {
            self.emit(
                Route::Frontend,
                client_message(&client, format!("{}{} {}", JOB_PREFIX, job_id, name.service)),
            );
        }
    }

    fn reject(&mut self, client: Identity, job: &str) {
        self.emit(
            Route::Frontend,
            client_message(&client, format!("{}{}", wire::FAIL_PREFIX, job)),
        );
    }

    fn answer_query(&mut self, client: Identity, query: AdminQuery) {
        let result = match query {
            AdminQuery::Jobs => serde_json::to_string(&self.jobs.pending().collect::<Vec<_>>()),
            AdminQuery::Active => {
                let mut active: Vec<&Job> = self.jobs.active().collect();
                active.sort_by_key(|j| j.started_at);
                serde_json::to_string(&active)
            }
            AdminQuery::History => serde_json::to_string(&self.jobs.history().collect::<Vec<_>>()),
            AdminQuery::Workers => serde_json::to_string(&self.workers.workers()),
        };
        let json = result.unwrap_or_else(|e| {
            tracing::error!(query = query.as_str(), error = %e, "Failed to serialize query result");
            "[]".to_string()
        });
        tracing::debug!(client = %client, query = query.as_str(), "Answering admin query");
        self.emit(Route::Frontend, client_message(&client, json));
    }
}

/// `[client, "", body]`
fn client_message(client: &Identity, body: String) -> Message {
    Message::from_frames([client.to_bytes(), Bytes::new(), Bytes::from(body)])
}

/// `[worker, "", MDPC02, 0x01, param, "JOB: <id>"]`
fn dispatch_message(worker: &Identity, job: &Job) -> Message {
    Message::from_frames([
        worker.to_bytes(),
        Bytes::new(),
        Bytes::from_static(CLIENT_PROTOCOL.as_bytes()),
        Bytes::from_static(&[REQUEST]),
        job.param.clone(),
        Bytes::from(format!("{}{}", JOB_PREFIX, job.id)),
    ])
}

/// `[client, "", service, 0x03, MDPC02, "<STATUS>: <service> [<id>]", payload?]`
fn client_answer(job: &Job, status: AnswerStatus, payload: Option<Bytes>) -> Message {
    let mut msg = Message::from_frames([
        job.client_id.to_bytes(),
        Bytes::new(),
        Bytes::from(job.service.clone()),
        Bytes::from_static(&[REPLY]),
        Bytes::from_static(CLIENT_PROTOCOL.as_bytes()),
        Bytes::from(wire::status_line(status, &job.service, job.id.as_str())),
    ]);
    if let Some(payload) = payload {
        msg.push_back(payload);
    }
    msg
}

/// `[service, "<STATUS>: <service> [<id>]"]`, topic first for subscribers.
fn news_message(job: &Job, status: AnswerStatus) -> Message {
    Message::from_frames([
        Bytes::from(job.service.clone()),
        Bytes::from(wire::status_line(status, &job.service, job.id.as_str())),
    ])
}
